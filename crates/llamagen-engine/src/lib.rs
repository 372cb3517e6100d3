//! # llamagen-engine
//!
//! The "narrow waist" of the llamagen stack. Defines the backend contract that
//! the generation pipeline is written against: token ids, position-tagged
//! [`Chunk`]s, and the [`InferenceBackend`] / [`Model`] / [`Vocabulary`] /
//! [`InferenceContext`] traits. Model-file parsing and tensor math live behind
//! these traits; the pipeline only ever sees synchronous, fallible calls.
//!
//! ## Design Notes
//!
//! ### Ownership
//! A loaded model is shared as a [`ModelHandle`] (`Arc<dyn Model>`). Every
//! session clones the handle, so the model is released only after the last
//! session that depends on it has been dropped.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility with llama.cpp-style
//! backends, though token IDs are logically non-negative.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, BackendError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Shared, immutable handle to a loaded model.
pub type ModelHandle = Arc<dyn Model>;

/// Errors reported by an inference backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("model loading failed: {0}")]
    ModelLoad(String),
    #[error("context initialization failed: {0}")]
    ContextInit(String),
    #[error("tokenization failed: {0}")]
    Tokenization(String),
    #[error("decode failed at position {position}: {reason}")]
    Decode { position: usize, reason: String },
    #[error("no output distribution available: {0}")]
    NoOutput(String),
    #[error("chunk capacity {capacity} exceeded")]
    ChunkOverflow { capacity: usize },
}

/// One slot of a [`Chunk`]: a token at an absolute position, and whether the
/// backend should compute the output distribution for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEntry {
    pub token: TokenId,
    pub position: usize,
    pub wants_output: bool,
}

/// A bounded batch of tokens submitted to the backend in one call.
///
/// # Invariants
/// - `len() <= capacity()`; [`Chunk::push`] refuses to grow past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    entries: Vec<ChunkEntry>,
    capacity: usize,
}

impl Chunk {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// A one-token chunk that requests output, as used for decode feedback.
    pub fn single(token: TokenId, position: usize) -> Self {
        Self {
            entries: vec![ChunkEntry {
                token,
                position,
                wants_output: true,
            }],
            capacity: 1,
        }
    }

    pub fn push(&mut self, entry: ChunkEntry) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(BackendError::ChunkOverflow {
                capacity: self.capacity,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[ChunkEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Position of the first entry, if any.
    pub fn first_position(&self) -> Option<usize> {
        self.entries.first().map(|e| e.position)
    }

    /// Whether any entry in this chunk requests output.
    pub fn wants_output(&self) -> bool {
        self.entries.iter().any(|e| e.wants_output)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.entries.first(), self.entries.last()) {
            (Some(first), Some(last)) => write!(
                f,
                "chunk[{}..={}, {} tokens]",
                first.position,
                last.position,
                self.entries.len()
            ),
            _ => write!(f, "chunk[empty]"),
        }
    }
}

/// Allocation parameters for a per-session inference context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Maximum context length (positions `0..n_ctx`).
    pub n_ctx: usize,
    /// Maximum number of tokens accepted by one [`InferenceContext::decode_chunk`].
    pub n_batch: usize,
    /// Threads for the backend's intra-op pool.
    pub n_threads: usize,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 256,
            n_threads: 1,
        }
    }
}

/// Vocabulary introspection and raw tokenization.
pub trait Vocabulary: Send + Sync {
    /// Number of entries in the vocabulary (length of an output distribution).
    fn n_tokens(&self) -> usize;

    /// Split text into token ids.
    ///
    /// `add_special` prepends the beginning-of-sequence token when the model
    /// has one. `parse_special` recognizes control markers embedded in the
    /// text as single atomic tokens; otherwise they are tokenized as text.
    fn tokenize_raw(&self, text: &str, add_special: bool, parse_special: bool)
        -> Result<Vec<TokenId>>;

    /// Literal text of a single token, if the vocabulary has one.
    fn text_of(&self, token: TokenId) -> Option<&str>;

    /// Backend-level "end of generation" flag for a token.
    fn is_terminal(&self, token: TokenId) -> bool;

    /// The end-of-sequence token, if the model defines one.
    fn eos_token(&self) -> Option<TokenId>;
}

/// A loaded, immutable model.
pub trait Model: Send + Sync {
    /// Human-readable model name for logging.
    fn name(&self) -> &str;

    fn vocab(&self) -> &dyn Vocabulary;

    /// Allocate backend state for one conversation.
    fn init_context(&self, params: &ContextParams) -> Result<Box<dyn InferenceContext>>;
}

/// Per-session backend state (the cache) driven by the generation pipeline.
///
/// Not safe for concurrent generation: callers hold it behind `&mut`.
pub trait InferenceContext: Send {
    /// Process one chunk, extending the cache. Blocking.
    fn decode_chunk(&mut self, chunk: &Chunk) -> Result<()>;

    /// Next-token logits for the most recent entry that requested output.
    fn output_distribution(&self) -> Result<Vec<f32>>;

    /// Invalidate every cached position.
    fn clear_cache(&mut self);
}

/// Entry point of a backend: turns a model path into a [`ModelHandle`].
pub trait InferenceBackend: Send + Sync {
    fn load_model(&self, path: &Path) -> Result<ModelHandle>;
}
