//! # llamagen-runtime
//!
//! Runtime pieces that sit next to the generation pipeline:
//!
//! - [`reference`]: a deterministic CPU backend. Models are JSON vocabulary
//!   files and logits are hash-derived from the cached history, which makes
//!   it suitable for demos and for exercising the pipeline end to end.
//! - [`telemetry`]: hooks for TTFT, tokens/sec and generation summaries.

pub mod reference;
pub mod telemetry;

pub use reference::{ReferenceBackend, ReferenceModel, ReferenceModelFile};
pub use telemetry::{
    InferenceMetrics, InferenceTimer, LogTelemetry, NoopTelemetry, TelemetryHook,
    TracingTelemetry,
};
