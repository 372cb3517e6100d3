//! Recording mock backend shared by the integration tests.
//!
//! Vocabulary layout:
//! - `0` `<s>` (BOS), `1` `</s>` (EOS), `2` `<|im_end|>`
//! - `3` `▁`, `4` `▁Hello`, `5` `▁world`, `6` `▁ello`, `7` `hello`
//! - `8` `<eog>`: flagged end-of-generation by the backend only
//! - `9` has no text at all
//! - `100 + b` is the ASCII character `b`
//!
//! Prompts tokenize to BOS plus one token per ASCII character; `</s>` and
//! `<|im_end|>` are atomic when special parsing is on.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use llamagen::engine::{
    BackendError, Chunk, ChunkEntry, ContextParams, InferenceBackend, InferenceContext, Model,
    ModelHandle, Result, TokenId, Vocabulary,
};

pub const BOS: TokenId = 0;
pub const EOS: TokenId = 1;
pub const IM_END: TokenId = 2;
pub const SPACE: TokenId = 3;
pub const HELLO: TokenId = 4;
pub const WORLD: TokenId = 5;
pub const MARKER_ELLO: TokenId = 6;
pub const PLAIN_HELLO: TokenId = 7;
pub const EOG: TokenId = 8;
pub const NO_TEXT: TokenId = 9;
pub const ASCII_BASE: TokenId = 100;

/// Token id for an ASCII character.
pub fn ascii(c: char) -> TokenId {
    ASCII_BASE + c as TokenId
}

/// How the mock computes next-token logits.
#[derive(Debug, Clone)]
pub enum LogitsMode {
    /// The n-th output since the last cache clear strongly prefers
    /// `script[n]`; past the end the last entry repeats.
    Script(Vec<TokenId>),
    /// Logits over lowercase letters and `▁`, hashed from the whole cached
    /// history. Independent of how the history was chunked.
    History,
    /// Every entry is `-inf`.
    Empty,
}

/// Everything the backend was asked to do, across all contexts of a model.
#[derive(Debug, Default)]
pub struct Recorder {
    calls: Mutex<Vec<Vec<ChunkEntry>>>,
    clears: AtomicUsize,
    contexts: AtomicUsize,
}

impl Recorder {
    pub fn calls(&self) -> Vec<Vec<ChunkEntry>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn decode_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn entries(&self) -> Vec<ChunkEntry> {
        self.calls().into_iter().flatten().collect()
    }

    pub fn positions(&self) -> Vec<usize> {
        self.entries().iter().map(|e| e.position).collect()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub fn contexts(&self) -> usize {
        self.contexts.load(Ordering::SeqCst)
    }

    pub fn forget(&self) {
        self.calls.lock().unwrap().clear();
    }
}

pub struct MockVocab {
    pieces: Vec<Option<String>>,
}

impl MockVocab {
    fn new() -> Self {
        let mut pieces: Vec<Option<String>> = vec![None; ASCII_BASE as usize + 128];
        let named = [
            (BOS, "<s>"),
            (EOS, "</s>"),
            (IM_END, "<|im_end|>"),
            (SPACE, "\u{2581}"),
            (HELLO, "\u{2581}Hello"),
            (WORLD, "\u{2581}world"),
            (MARKER_ELLO, "\u{2581}ello"),
            (PLAIN_HELLO, "hello"),
            (EOG, "<eog>"),
        ];
        for (id, text) in named {
            pieces[id as usize] = Some(text.to_string());
        }
        for b in 0u8..128 {
            pieces[(ASCII_BASE + TokenId::from(b)) as usize] = Some(char::from(b).to_string());
        }
        Self { pieces }
    }
}

impl Vocabulary for MockVocab {
    fn n_tokens(&self) -> usize {
        self.pieces.len()
    }

    fn tokenize_raw(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>> {
        let mut ids = Vec::new();
        if add_special {
            ids.push(BOS);
        }
        let mut rest = text;
        while let Some(c) = rest.chars().next() {
            if parse_special {
                if let Some(tail) = rest.strip_prefix("</s>") {
                    ids.push(EOS);
                    rest = tail;
                    continue;
                }
                if let Some(tail) = rest.strip_prefix("<|im_end|>") {
                    ids.push(IM_END);
                    rest = tail;
                    continue;
                }
            }
            if !c.is_ascii() {
                return Err(BackendError::Tokenization(format!("non-ascii {c:?}")));
            }
            ids.push(ascii(c));
            rest = &rest[c.len_utf8()..];
        }
        Ok(ids)
    }

    fn text_of(&self, token: TokenId) -> Option<&str> {
        usize::try_from(token)
            .ok()
            .and_then(|i| self.pieces.get(i))
            .and_then(|p| p.as_deref())
    }

    fn is_terminal(&self, token: TokenId) -> bool {
        token == EOS || token == EOG
    }

    fn eos_token(&self) -> Option<TokenId> {
        Some(EOS)
    }
}

pub struct MockModel {
    vocab: MockVocab,
    mode: LogitsMode,
    recorder: Arc<Recorder>,
    fail_on_call: Option<usize>,
    fail_context_init: bool,
}

impl MockModel {
    pub fn new(mode: LogitsMode) -> Self {
        Self {
            vocab: MockVocab::new(),
            mode,
            recorder: Arc::new(Recorder::default()),
            fail_on_call: None,
            fail_context_init: false,
        }
    }

    pub fn scripted(tokens: &[TokenId]) -> Self {
        Self::new(LogitsMode::Script(tokens.to_vec()))
    }

    /// Fail the n-th (1-based) `decode_chunk` call across all contexts.
    pub fn fail_on_decode_call(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    pub fn fail_context_init(mut self) -> Self {
        self.fail_context_init = true;
        self
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        Arc::clone(&self.recorder)
    }

    pub fn into_handle(self) -> ModelHandle {
        Arc::new(self)
    }
}

impl Model for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    fn vocab(&self) -> &dyn Vocabulary {
        &self.vocab
    }

    fn init_context(&self, params: &ContextParams) -> Result<Box<dyn InferenceContext>> {
        if self.fail_context_init {
            return Err(BackendError::ContextInit("out of memory".into()));
        }
        self.recorder.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockContext {
            params: *params,
            n_vocab: self.vocab.n_tokens(),
            mode: self.mode.clone(),
            recorder: Arc::clone(&self.recorder),
            fail_on_call: self.fail_on_call,
            history: Vec::new(),
            outputs: 0,
            output: None,
        }))
    }
}

struct MockContext {
    params: ContextParams,
    n_vocab: usize,
    mode: LogitsMode,
    recorder: Arc<Recorder>,
    fail_on_call: Option<usize>,
    history: Vec<TokenId>,
    outputs: usize,
    output: Option<Vec<f32>>,
}

impl MockContext {
    fn logits(&self) -> Vec<f32> {
        match &self.mode {
            LogitsMode::Script(script) => {
                let mut logits = vec![0.0; self.n_vocab];
                let idx = self.outputs.min(script.len().saturating_sub(1));
                if let Some(&token) = script.get(idx) {
                    logits[token as usize] = 30.0;
                }
                logits
            }
            LogitsMode::History => {
                let mut state: u64 = 0xcbf2_9ce4_8422_2325;
                for (pos, &token) in self.history.iter().enumerate() {
                    state ^= (token as u64) ^ ((pos as u64) << 32);
                    state = state.wrapping_mul(0x0100_0000_01b3);
                }
                (0..self.n_vocab)
                    .map(|v| {
                        let id = v as TokenId;
                        let letter = (ascii('a')..=ascii('z')).contains(&id);
                        if !(letter || id == SPACE) {
                            return f32::NEG_INFINITY;
                        }
                        let mut h = state ^ (v as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
                        h ^= h >> 33;
                        h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
                        h ^= h >> 33;
                        (h % 1000) as f32 / 250.0
                    })
                    .collect()
            }
            LogitsMode::Empty => vec![f32::NEG_INFINITY; self.n_vocab],
        }
    }
}

impl InferenceContext for MockContext {
    fn decode_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        let call = {
            let mut calls = self.recorder.calls.lock().unwrap();
            calls.push(chunk.entries().to_vec());
            calls.len()
        };
        let position = chunk.first_position().unwrap_or(self.history.len());

        if self.fail_on_call == Some(call) {
            return Err(BackendError::Decode {
                position,
                reason: "injected failure".into(),
            });
        }
        if chunk.len() > self.params.n_batch {
            return Err(BackendError::Decode {
                position,
                reason: "chunk wider than batch".into(),
            });
        }
        for (offset, entry) in chunk.entries().iter().enumerate() {
            if entry.position != self.history.len() + offset {
                return Err(BackendError::Decode {
                    position: entry.position,
                    reason: "non-contiguous position".into(),
                });
            }
        }

        self.history
            .extend(chunk.entries().iter().map(|e| e.token));
        self.output = if chunk.entries().last().is_some_and(|e| e.wants_output) {
            let logits = self.logits();
            self.outputs += 1;
            Some(logits)
        } else {
            None
        };
        Ok(())
    }

    fn output_distribution(&self) -> Result<Vec<f32>> {
        self.output
            .clone()
            .ok_or_else(|| BackendError::NoOutput("no output requested".into()))
    }

    fn clear_cache(&mut self) {
        self.recorder.clears.fetch_add(1, Ordering::SeqCst);
        self.history.clear();
        self.outputs = 0;
        self.output = None;
    }
}

/// Hands out one prepared model for every path except those containing
/// `"missing"`.
pub struct MockBackend {
    model: ModelHandle,
}

impl MockBackend {
    pub fn new(model: ModelHandle) -> Self {
        Self { model }
    }
}

impl InferenceBackend for MockBackend {
    fn load_model(&self, path: &Path) -> Result<ModelHandle> {
        if path.to_string_lossy().contains("missing") {
            return Err(BackendError::ModelLoad(format!("{} not found", path.display())));
        }
        Ok(Arc::clone(&self.model))
    }
}
