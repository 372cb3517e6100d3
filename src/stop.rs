//! Stop detection.
//!
//! A candidate token is checked before its text is appended to the output.
//! Rules, in priority order:
//!
//! 1. Membership in the per-session terminal-token set ([`StopConfig`]).
//! 2. The backend's own end-of-generation flag for the token.
//! 3. Text heuristics on the output accumulated so far ([`StopHeuristics`]).
//!
//! A token that triggers a stop is discarded: it is neither emitted nor fed
//! back to the backend.

use std::collections::BTreeSet;
use std::fmt;

use llamagen_engine::{TokenId, Vocabulary};
use llamagen_tokenizer::TokenizerAdapter;
use serde::{Deserialize, Serialize};

/// Literal end-of-turn markers used across common chat templates.
pub const TERMINAL_MARKERS: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<|im_end|>",
    "<|end|>",
    "<end_of_turn>",
];

fn default_user_marker() -> String {
    "User:".to_string()
}

fn default_assistant_marker() -> String {
    "Assistant:".to_string()
}

fn default_assistant_min_len() -> usize {
    20
}

fn default_assistant_truncate_min_pos() -> usize {
    10
}

fn default_max_newlines() -> usize {
    3
}

/// Text-based fallback for models whose terminal tokens are unreliable.
///
/// An empty marker disables the corresponding rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopHeuristics {
    /// Stop as soon as the output contains this marker.
    #[serde(default = "default_user_marker")]
    pub user_marker: String,
    /// Stop when the output contains this marker and is longer than
    /// `assistant_min_len` bytes.
    #[serde(default = "default_assistant_marker")]
    pub assistant_marker: String,
    #[serde(default = "default_assistant_min_len")]
    pub assistant_min_len: usize,
    /// [`StopHeuristics::clean`] only cuts at the assistant marker when it
    /// starts after this byte offset.
    #[serde(default = "default_assistant_truncate_min_pos")]
    pub assistant_truncate_min_pos: usize,
    /// Stop once the output holds more newlines than this.
    #[serde(default = "default_max_newlines")]
    pub max_newlines: usize,
}

impl Default for StopHeuristics {
    fn default() -> Self {
        Self {
            user_marker: default_user_marker(),
            assistant_marker: default_assistant_marker(),
            assistant_min_len: default_assistant_min_len(),
            assistant_truncate_min_pos: default_assistant_truncate_min_pos(),
            max_newlines: default_max_newlines(),
        }
    }
}

impl StopHeuristics {
    /// Evaluate the text rules against output accumulated so far.
    pub fn check_text(&self, text: &str) -> Option<StopReason> {
        if !self.user_marker.is_empty() && text.contains(self.user_marker.as_str()) {
            return Some(StopReason::UserTurn);
        }
        if !self.assistant_marker.is_empty()
            && text.contains(self.assistant_marker.as_str())
            && text.len() > self.assistant_min_len
        {
            return Some(StopReason::AssistantTurn);
        }
        if text.matches('\n').count() > self.max_newlines {
            return Some(StopReason::NewlineLimit);
        }
        None
    }

    /// Final cleanup for non-streaming output: cut at a hallucinated turn
    /// marker and strip trailing whitespace.
    pub fn clean(&self, text: &str) -> String {
        let mut out = text;
        if !self.user_marker.is_empty() {
            if let Some(pos) = out.find(self.user_marker.as_str()) {
                out = &out[..pos];
            }
        }
        if !self.assistant_marker.is_empty() {
            if let Some(pos) = out.find(self.assistant_marker.as_str()) {
                if pos > self.assistant_truncate_min_pos {
                    out = &out[..pos];
                }
            }
        }
        out.trim_end().to_string()
    }
}

/// Which rule ended a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Token is in the session's resolved terminal set.
    TerminalToken(TokenId),
    /// Token carries the backend's end-of-generation flag.
    EndOfGeneration(TokenId),
    UserTurn,
    AssistantTurn,
    NewlineLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::TerminalToken(id) => write!(f, "terminal token {id}"),
            StopReason::EndOfGeneration(id) => write!(f, "end-of-generation token {id}"),
            StopReason::UserTurn => write!(f, "user turn marker"),
            StopReason::AssistantTurn => write!(f, "assistant turn marker"),
            StopReason::NewlineLimit => write!(f, "newline limit"),
        }
    }
}

/// Terminal tokens and heuristic thresholds for one session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StopConfig {
    terminal: BTreeSet<TokenId>,
    heuristics: StopHeuristics,
}

impl StopConfig {
    /// Resolve the terminal set from a model's vocabulary: its EOS token plus
    /// every marker in [`TERMINAL_MARKERS`] that tokenizes to exactly one
    /// token. Unsupported markers are skipped.
    pub fn resolve(tokenizer: &TokenizerAdapter, heuristics: StopHeuristics) -> Self {
        let mut terminal = BTreeSet::new();
        if let Some(eos) = tokenizer.vocab().eos_token() {
            terminal.insert(eos);
        }
        for marker in TERMINAL_MARKERS {
            match tokenizer.single_token(marker) {
                Some(id) => {
                    tracing::debug!(marker, id, "resolved terminal marker");
                    terminal.insert(id);
                }
                None => tracing::trace!(marker, "terminal marker not supported"),
            }
        }
        Self {
            terminal,
            heuristics,
        }
    }

    pub fn from_tokens(
        tokens: impl IntoIterator<Item = TokenId>,
        heuristics: StopHeuristics,
    ) -> Self {
        Self {
            terminal: tokens.into_iter().collect(),
            heuristics,
        }
    }

    pub fn terminal_tokens(&self) -> &BTreeSet<TokenId> {
        &self.terminal
    }

    pub fn heuristics(&self) -> &StopHeuristics {
        &self.heuristics
    }

    pub fn is_terminal(&self, token: TokenId) -> bool {
        self.terminal.contains(&token)
    }
}

/// Applies a [`StopConfig`] against a vocabulary during generation.
pub struct StopDetector<'a> {
    config: &'a StopConfig,
    vocab: &'a dyn Vocabulary,
}

impl<'a> StopDetector<'a> {
    pub fn new(config: &'a StopConfig, vocab: &'a dyn Vocabulary) -> Self {
        Self { config, vocab }
    }

    /// Decide whether `token` ends generation, given the output accumulated
    /// before it.
    pub fn check(&self, token: TokenId, accumulated: &str) -> Option<StopReason> {
        if self.config.is_terminal(token) {
            return Some(StopReason::TerminalToken(token));
        }
        if self.vocab.is_terminal(token) {
            return Some(StopReason::EndOfGeneration(token));
        }
        self.config.heuristics.check_text(accumulated)
    }

    pub fn should_stop(&self, token: TokenId, accumulated: &str) -> bool {
        self.check(token, accumulated).is_some()
    }
}
