//! Error types for the llamagen crate.

use llamagen_engine::{BackendError, TokenId};
use llamagen_sampling::SamplingError;
use llamagen_tokenizer::TokenizerError;
use thiserror::Error;

/// Top-level error type for llamagen operations.
#[derive(Error, Debug)]
pub enum LlamaError {
    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Context init error: {0}")]
    ContextInit(String),

    #[error("Tokenization error: {0}")]
    Tokenization(String),

    #[error("No text fragment for token {0}")]
    MissingFragment(TokenId),

    #[error("Decode error at position {position}: {reason}")]
    Decode { position: usize, reason: String },

    /// A backend failure not tied to a cache position.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),

    #[error("Stream consumer fault: {0}")]
    CallbackFault(String),

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LlamaError>;

impl From<BackendError> for LlamaError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ModelLoad(msg) => LlamaError::ModelLoad(msg),
            BackendError::ContextInit(msg) => LlamaError::ContextInit(msg),
            BackendError::Tokenization(msg) => LlamaError::Tokenization(msg),
            BackendError::Decode { position, reason } => LlamaError::Decode { position, reason },
            other @ (BackendError::NoOutput(_) | BackendError::ChunkOverflow { .. }) => {
                LlamaError::Backend(other.to_string())
            }
        }
    }
}

impl LlamaError {
    /// Map a backend error raised while working at `position`. Errors that
    /// carry their own position keep it.
    pub fn at_position(err: BackendError, position: usize) -> Self {
        match err {
            BackendError::NoOutput(_) | BackendError::ChunkOverflow { .. } => LlamaError::Decode {
                position,
                reason: err.to_string(),
            },
            other => other.into(),
        }
    }
}

impl From<TokenizerError> for LlamaError {
    fn from(err: TokenizerError) -> Self {
        match err {
            TokenizerError::Tokenization(msg) => LlamaError::Tokenization(msg),
            TokenizerError::MissingFragment(token) => LlamaError::MissingFragment(token),
        }
    }
}

impl From<crate::stream::CallbackFault> for LlamaError {
    fn from(fault: crate::stream::CallbackFault) -> Self {
        LlamaError::CallbackFault(fault.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_keep_their_category() {
        let err: LlamaError = BackendError::ContextInit("oom".into()).into();
        assert!(matches!(err, LlamaError::ContextInit(_)));

        let err: LlamaError = BackendError::Decode {
            position: 4,
            reason: "kv full".into(),
        }
        .into();
        assert!(matches!(err, LlamaError::Decode { position: 4, .. }));
    }

    #[test]
    fn positionless_backend_errors_do_not_invent_a_position() {
        let err: LlamaError = BackendError::NoOutput("nothing requested".into()).into();
        assert!(matches!(err, LlamaError::Backend(_)));

        let err: LlamaError = BackendError::ChunkOverflow { capacity: 4 }.into();
        assert_eq!(err.to_string(), "Backend error: chunk capacity 4 exceeded");
    }

    #[test]
    fn at_position_fills_in_the_cursor() {
        let err = LlamaError::at_position(BackendError::ChunkOverflow { capacity: 2 }, 17);
        assert!(matches!(err, LlamaError::Decode { position: 17, .. }));

        let err = LlamaError::at_position(BackendError::NoOutput("none".into()), 3);
        assert!(matches!(err, LlamaError::Decode { position: 3, .. }));

        let err = LlamaError::at_position(
            BackendError::Decode {
                position: 9,
                reason: "kv full".into(),
            },
            3,
        );
        assert!(matches!(err, LlamaError::Decode { position: 9, .. }));
    }

    #[test]
    fn tokenizer_errors_map() {
        let err: LlamaError = TokenizerError::MissingFragment(9).into();
        assert_eq!(err.to_string(), "No text fragment for token 9");
    }
}
