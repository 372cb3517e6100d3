//! Generation configuration.
//!
//! Every field has a default, so a JSON file only needs the values it
//! overrides:
//!
//! ```json
//! { "context": { "chunk_capacity": 64 }, "sampling": { "seed": 7 } }
//! ```

use std::path::Path;

use llamagen_engine::ContextParams;
use llamagen_sampling::SamplingConfig;
use serde::{Deserialize, Serialize};

use crate::error::{LlamaError, Result};
use crate::stop::StopHeuristics;

/// Upper bound for the backend's intra-op thread pool.
pub const MAX_THREADS: usize = 64;

fn default_n_ctx() -> usize {
    2048
}

fn default_chunk_capacity() -> usize {
    256
}

fn default_true() -> bool {
    true
}

/// Backend context sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Maximum context length in tokens.
    #[serde(default = "default_n_ctx")]
    pub n_ctx: usize,
    /// Maximum tokens per prefill chunk; also the backend batch width.
    #[serde(default = "default_chunk_capacity")]
    pub chunk_capacity: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            n_ctx: default_n_ctx(),
            chunk_capacity: default_chunk_capacity(),
        }
    }
}

/// How prompts are tokenized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Recognize control markers in the prompt as atomic tokens.
    #[serde(default = "default_true")]
    pub structured: bool,
    /// Prepend the model's BOS token.
    #[serde(default = "default_true")]
    pub add_special: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            structured: true,
            add_special: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub stop: StopHeuristics,
}

impl GenerationConfig {
    /// Load and validate a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: GenerationConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_n_ctx(mut self, n_ctx: usize) -> Self {
        self.context.n_ctx = n_ctx;
        self
    }

    pub fn with_chunk_capacity(mut self, capacity: usize) -> Self {
        self.context.chunk_capacity = capacity;
        self
    }

    pub fn with_structured_prompts(mut self, structured: bool) -> Self {
        self.prompt.structured = structured;
        self
    }

    pub fn with_add_special(mut self, add_special: bool) -> Self {
        self.prompt.add_special = add_special;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.sampling.seed = Some(seed);
        self
    }

    pub fn with_stop(mut self, stop: StopHeuristics) -> Self {
        self.stop = stop;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.context.n_ctx == 0 {
            return Err(LlamaError::Config("n_ctx must be positive".into()));
        }
        if self.context.chunk_capacity == 0 {
            return Err(LlamaError::Config("chunk_capacity must be positive".into()));
        }
        self.sampling
            .validate()
            .map_err(|e| LlamaError::Config(e.to_string()))
    }

    /// Backend allocation parameters for a session using `n_threads`.
    pub fn context_params(&self, n_threads: usize) -> ContextParams {
        ContextParams {
            n_ctx: self.context.n_ctx,
            n_batch: self.context.chunk_capacity,
            n_threads,
        }
    }
}

/// Turn a caller's thread hint into a usable thread count.
///
/// A hint of zero or less means "unspecified" and selects the hardware
/// concurrency. The result is clamped into `1..=MAX_THREADS`.
pub fn resolve_threads(hint: i32) -> usize {
    let requested = match usize::try_from(hint) {
        Ok(n) if n > 0 => n,
        _ => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    };
    requested.clamp(1, MAX_THREADS)
}
