//! # llamagen
//!
//! Autoregressive text generation on top of a pluggable inference backend.
//!
//! Provides:
//! - [`Session`]: per-conversation backend state with a contiguous position cursor
//! - [`PrefillScheduler`]: bounded-chunk prompt prefill
//! - [`StopDetector`]: terminal-token and text-heuristic stop rules
//! - [`Generator`]: the sample / stop / decode / emit / feed-back loop
//! - [`TokenSink`]: cancellable streaming consumers
//! - [`SessionRegistry`]: handle-based host API (`create`, `free`,
//!   `reset_cache`, `generate`, `generate_stream`)
//!
//! Backend traits live in `llamagen-engine`, tokenization in
//! `llamagen-tokenizer`, sampler chains in `llamagen-sampling` and the
//! reference backend plus telemetry in `llamagen-runtime`.

pub mod config;
pub mod error;
pub mod generate;
pub mod prefill;
pub mod registry;
pub mod session;
pub mod stop;
pub mod stream;

pub use config::{resolve_threads, ContextConfig, GenerationConfig, PromptConfig, MAX_THREADS};
pub use error::{LlamaError, Result};
pub use generate::{FinishReason, GenerationOutcome, GenerationPhase, Generator};
pub use prefill::PrefillScheduler;
pub use registry::{SessionHandle, SessionRegistry};
pub use session::Session;
pub use stop::{StopConfig, StopDetector, StopHeuristics, StopReason, TERMINAL_MARKERS};
pub use stream::{continue_while, CallbackFault, ChannelSink, ContinueWhile, StreamControl, TokenSink};

pub use llamagen_engine as engine;
pub use llamagen_runtime as runtime;
pub use llamagen_sampling as sampling;
pub use llamagen_tokenizer as tokenizer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
