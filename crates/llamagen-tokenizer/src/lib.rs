//! # llamagen-tokenizer
//!
//! Tokenization glue between prompt text and a backend [`Vocabulary`].
//!
//! This crate provides:
//! - [`TokenizerAdapter`]: text → token ids (plain or structured mode) and
//!   token id → raw fragment
//! - [`TextDecoder`]: raw fragments → displayable text, with the sub-word
//!   word-boundary marker (`▁`) turned back into a space
//!
//! The sub-word splitting algorithm itself belongs to the backend.

use llamagen_engine::{BackendError, ModelHandle, TokenId, Vocabulary};

/// Glyph used by SentencePiece-style vocabularies to mark a word boundary.
pub const WORD_BOUNDARY: &str = "\u{2581}";

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Tokenization error: {0}")]
    Tokenization(String),
    #[error("No text fragment for token {0}")]
    MissingFragment(TokenId),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// How control markers inside prompt text are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenizeMode {
    /// Markers such as `<|im_end|>` are split like any other text.
    Plain,
    /// Markers are recognized as the single atomic tokens the model was
    /// trained with.
    #[default]
    Structured,
}

impl TokenizeMode {
    pub fn from_structured(structured: bool) -> Self {
        if structured {
            TokenizeMode::Structured
        } else {
            TokenizeMode::Plain
        }
    }
}

/// Tokenizer bound to one model's vocabulary.
#[derive(Clone)]
pub struct TokenizerAdapter {
    model: ModelHandle,
    add_special: bool,
}

impl TokenizerAdapter {
    /// Create an adapter that prepends the model's BOS token to prompts.
    pub fn new(model: ModelHandle) -> Self {
        Self {
            model,
            add_special: true,
        }
    }

    pub fn with_add_special(mut self, add_special: bool) -> Self {
        self.add_special = add_special;
        self
    }

    pub fn vocab(&self) -> &dyn Vocabulary {
        self.model.vocab()
    }

    /// Encode prompt text into a token sequence.
    ///
    /// Fails if the backend rejects the input or produces no tokens at all,
    /// since an empty sequence cannot be prefilled.
    pub fn tokenize(&self, text: &str, mode: TokenizeMode) -> TokenizerResult<Vec<TokenId>> {
        let tokens = self
            .vocab()
            .tokenize_raw(text, self.add_special, mode == TokenizeMode::Structured)
            .map_err(|e| match e {
                BackendError::Tokenization(msg) => TokenizerError::Tokenization(msg),
                other => TokenizerError::Tokenization(other.to_string()),
            })?;

        if tokens.is_empty() {
            return Err(TokenizerError::Tokenization(
                "input produced no tokens".to_string(),
            ));
        }

        tracing::trace!(n_tokens = tokens.len(), ?mode, "tokenized prompt");
        Ok(tokens)
    }

    /// Resolve a literal marker to its token id.
    ///
    /// Returns `None` when the marker is unknown to the vocabulary or does
    /// not collapse to exactly one token in structured mode.
    pub fn single_token(&self, marker: &str) -> Option<TokenId> {
        match self.vocab().tokenize_raw(marker, false, true) {
            Ok(ids) if ids.len() == 1 => Some(ids[0]),
            _ => None,
        }
    }

    /// Literal vocabulary text for one token.
    pub fn detokenize_fragment(&self, token: TokenId) -> TokenizerResult<String> {
        self.vocab()
            .text_of(token)
            .map(str::to_string)
            .ok_or(TokenizerError::MissingFragment(token))
    }
}

/// Replace a leading word-boundary marker with a literal space.
///
/// A fragment that is exactly the marker becomes `" "`; a fragment starting
/// with it becomes a space followed by the remainder; anything else passes
/// through unchanged.
pub fn normalize_fragment(raw: &str) -> String {
    match raw.strip_prefix(WORD_BOUNDARY) {
        Some(rest) => format!(" {rest}"),
        None => raw.to_string(),
    }
}

/// Turns sampled token ids into displayable text.
pub struct TextDecoder<'a> {
    adapter: &'a TokenizerAdapter,
}

impl<'a> TextDecoder<'a> {
    pub fn new(adapter: &'a TokenizerAdapter) -> Self {
        Self { adapter }
    }

    pub fn decode(&self, token: TokenId) -> TokenizerResult<String> {
        let raw = self.adapter.detokenize_fragment(token)?;
        Ok(normalize_fragment(&raw))
    }
}
