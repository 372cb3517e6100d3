//! Deterministic reference backend.
//!
//! A model is a JSON vocabulary description:
//!
//! ```json
//! {
//!   "name": "tiny",
//!   "pieces": ["<unk>", "<s>", "</s>", "▁", "▁Hello", "a", "b"],
//!   "special": ["<unk>", "<s>", "</s>"],
//!   "bos": "<s>",
//!   "eos": "</s>",
//!   "unk": "<unk>",
//!   "end_of_generation": [],
//!   "seed": 0
//! }
//! ```
//!
//! Tokenization is greedy longest-match over the non-special pieces, with
//! spaces written as `▁`. Special pieces are atomic only when the caller
//! asks for special parsing. Logits are a pure function of the model seed,
//! the last two cached tokens and the cache length, so a generation is
//! reproducible no matter how the prompt was chunked.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use llamagen_engine::{
    BackendError, Chunk, ContextParams, InferenceBackend, InferenceContext, Model, ModelHandle,
    Result, TokenId, Vocabulary,
};
use serde::{Deserialize, Serialize};

const BOUNDARY: char = '\u{2581}';

/// Bias added to terminal tokens once the cache is full; scales linearly
/// with cache occupancy so long generations wind down.
const TERMINAL_BIAS: f32 = 8.0;

fn default_name() -> String {
    "reference".to_string()
}

/// On-disk description of a reference model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceModelFile {
    #[serde(default = "default_name")]
    pub name: String,
    pub pieces: Vec<String>,
    #[serde(default)]
    pub special: Vec<String>,
    #[serde(default)]
    pub bos: Option<String>,
    #[serde(default)]
    pub eos: Option<String>,
    #[serde(default)]
    pub unk: Option<String>,
    #[serde(default)]
    pub end_of_generation: Vec<String>,
    #[serde(default)]
    pub seed: u64,
}

/// Loads [`ReferenceModel`]s from JSON files.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    pub fn new() -> Self {
        Self
    }
}

impl InferenceBackend for ReferenceBackend {
    fn load_model(&self, path: &Path) -> Result<ModelHandle> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BackendError::ModelLoad(format!("{}: {e}", path.display())))?;
        let file: ReferenceModelFile = serde_json::from_str(&content)
            .map_err(|e| BackendError::ModelLoad(format!("{}: {e}", path.display())))?;
        let model = ReferenceModel::from_file(file)?;
        tracing::info!(
            name = model.name(),
            n_vocab = model.vocab.n_tokens(),
            path = %path.display(),
            "loaded reference model"
        );
        Ok(Arc::new(model))
    }
}

enum Segment<'t> {
    Text(&'t str),
    Special(TokenId),
}

struct ReferenceVocab {
    pieces: Vec<String>,
    lookup: HashMap<String, TokenId>,
    special: Vec<(String, TokenId)>,
    max_piece_chars: usize,
    bos: Option<TokenId>,
    eos: Option<TokenId>,
    unk: Option<TokenId>,
    terminal: HashSet<TokenId>,
}

impl ReferenceVocab {
    fn split_special<'t>(&self, text: &'t str) -> Vec<Segment<'t>> {
        let mut segments = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            // Earliest match wins; ties go to the longer marker.
            let found = self
                .special
                .iter()
                .filter_map(|(piece, id)| rest.find(piece.as_str()).map(|at| (at, piece.len(), *id)))
                .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
            match found {
                Some((at, len, id)) => {
                    if at > 0 {
                        segments.push(Segment::Text(&rest[..at]));
                    }
                    segments.push(Segment::Special(id));
                    rest = &rest[at + len..];
                }
                None => {
                    segments.push(Segment::Text(rest));
                    rest = "";
                }
            }
        }
        segments
    }

    fn encode_text(&self, text: &str, prefix: bool, out: &mut Vec<TokenId>) -> Result<()> {
        let mut chars: Vec<char> = Vec::with_capacity(text.len() + 1);
        if prefix {
            chars.push(BOUNDARY);
        }
        chars.extend(text.chars().map(|c| if c == ' ' { BOUNDARY } else { c }));

        let mut i = 0;
        while i < chars.len() {
            let longest = self.max_piece_chars.min(chars.len() - i);
            let matched = (1..=longest).rev().find_map(|len| {
                let candidate: String = chars[i..i + len].iter().collect();
                self.lookup.get(&candidate).map(|id| (*id, len))
            });
            match (matched, self.unk) {
                (Some((id, len)), _) => {
                    out.push(id);
                    i += len;
                }
                (None, Some(unk)) => {
                    out.push(unk);
                    i += 1;
                }
                (None, None) => {
                    return Err(BackendError::Tokenization(format!(
                        "no vocabulary entry for {:?}",
                        chars[i]
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Vocabulary for ReferenceVocab {
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
            if let Some(bos) = self.bos {
                ids.push(bos);
            }
        }

        let segments = if parse_special {
            self.split_special(text)
        } else if text.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Text(text)]
        };

        for (idx, segment) in segments.into_iter().enumerate() {
            match segment {
                Segment::Special(id) => ids.push(id),
                Segment::Text(part) => self.encode_text(part, add_special && idx == 0, &mut ids)?,
            }
        }
        Ok(ids)
    }

    fn text_of(&self, token: TokenId) -> Option<&str> {
        usize::try_from(token)
            .ok()
            .and_then(|i| self.pieces.get(i))
            .map(String::as_str)
    }

    fn is_terminal(&self, token: TokenId) -> bool {
        self.terminal.contains(&token)
    }

    fn eos_token(&self) -> Option<TokenId> {
        self.eos
    }
}

/// Parameters shared by every context of one model.
#[derive(Debug, Clone)]
struct Scorer {
    seed: u64,
    n_vocab: usize,
    terminal: Vec<TokenId>,
    suppressed: Vec<TokenId>,
}

impl Scorer {
    fn logits(&self, history: &[TokenId], n_ctx: usize) -> Vec<f32> {
        let prev1 = history.last().copied().unwrap_or(-1);
        let prev2 = history
            .len()
            .checked_sub(2)
            .map(|i| history[i])
            .unwrap_or(-1);
        let state = mix(self.seed ^ mix(i64::from(prev1) as u64)
            ^ mix(i64::from(prev2) as u64).rotate_left(17));
        let bias = TERMINAL_BIAS * history.len() as f32 / n_ctx.max(1) as f32;

        (0..self.n_vocab)
            .map(|v| {
                let token = v as TokenId;
                if self.suppressed.contains(&token) {
                    return f32::NEG_INFINITY;
                }
                let h = mix(state ^ (v as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
                let unit = (h >> 40) as f32 / (1u64 << 24) as f32;
                let logit = unit * 8.0 - 4.0;
                if self.terminal.contains(&token) {
                    logit + bias
                } else {
                    logit
                }
            })
            .collect()
    }
}

/// SplitMix64 finalizer.
fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// A loaded reference model.
pub struct ReferenceModel {
    name: String,
    vocab: ReferenceVocab,
    scorer: Scorer,
}

impl ReferenceModel {
    /// Validate a model description and build its vocabulary.
    pub fn from_file(file: ReferenceModelFile) -> Result<Self> {
        if file.pieces.is_empty() {
            return Err(BackendError::ModelLoad("vocabulary has no pieces".into()));
        }

        let mut index: HashMap<&str, TokenId> = HashMap::with_capacity(file.pieces.len());
        for (i, piece) in file.pieces.iter().enumerate() {
            if piece.is_empty() {
                return Err(BackendError::ModelLoad(format!("piece {i} is empty")));
            }
            let id = TokenId::try_from(i)
                .map_err(|_| BackendError::ModelLoad("vocabulary too large".into()))?;
            if index.insert(piece.as_str(), id).is_some() {
                return Err(BackendError::ModelLoad(format!("duplicate piece {piece:?}")));
            }
        }

        let resolve = |piece: &str| -> Result<TokenId> {
            index
                .get(piece)
                .copied()
                .ok_or_else(|| BackendError::ModelLoad(format!("unknown piece {piece:?}")))
        };

        let mut special = file
            .special
            .iter()
            .map(|p| resolve(p.as_str()).map(|id| (p.clone(), id)))
            .collect::<Result<Vec<_>>>()?;
        special.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        let special_ids: HashSet<TokenId> = special.iter().map(|(_, id)| *id).collect();

        let bos = file.bos.as_deref().map(resolve).transpose()?;
        let eos = file.eos.as_deref().map(resolve).transpose()?;
        let unk = file.unk.as_deref().map(resolve).transpose()?;

        let mut terminal: HashSet<TokenId> = file
            .end_of_generation
            .iter()
            .map(|p| resolve(p.as_str()))
            .collect::<Result<_>>()?;
        terminal.extend(eos);

        let lookup: HashMap<String, TokenId> = file
            .pieces
            .iter()
            .enumerate()
            .filter(|(i, _)| !special_ids.contains(&(*i as TokenId)))
            .map(|(i, p)| (p.clone(), i as TokenId))
            .collect();
        let max_piece_chars = lookup.keys().map(|p| p.chars().count()).max().unwrap_or(1);

        let scorer = Scorer {
            seed: file.seed,
            n_vocab: file.pieces.len(),
            terminal: terminal.iter().copied().collect(),
            suppressed: bos.into_iter().chain(unk).collect(),
        };

        Ok(Self {
            name: file.name,
            vocab: ReferenceVocab {
                pieces: file.pieces,
                lookup,
                special,
                max_piece_chars,
                bos,
                eos,
                unk,
                terminal,
            },
            scorer,
        })
    }

    /// Built-in English demo vocabulary, used when no model file is given.
    pub fn demo() -> Result<Self> {
        let mut pieces: Vec<String> = [
            "<unk>",
            "<s>",
            "</s>",
            "<|im_end|>",
            "<|eot_id|>",
            "\u{2581}",
            "\n",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let words = [
            "Hello", "hello", "world", "the", "a", "is", "I", "you", "it", "and", "to", "of",
            "that", "this", "what", "can", "help", "today", "model", "token", "text", "Rust",
            "User", "Assistant",
        ];
        pieces.extend(words.iter().map(|w| format!("{BOUNDARY}{w}")));
        pieces.extend(["User", "Assistant"].iter().map(|w| w.to_string()));
        pieces.extend(
            ('a'..='z')
                .chain('A'..='Z')
                .chain('0'..='9')
                .chain(".,!?:;'\"-()<>|/_".chars())
                .map(|c| c.to_string()),
        );

        let file = ReferenceModelFile {
            name: "demo".to_string(),
            pieces,
            special: ["<unk>", "<s>", "</s>", "<|im_end|>", "<|eot_id|>"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            bos: Some("<s>".to_string()),
            eos: Some("</s>".to_string()),
            unk: Some("<unk>".to_string()),
            end_of_generation: vec!["<|eot_id|>".to_string()],
            seed: 0,
        };

        Self::from_file(file)
    }
}

impl Model for ReferenceModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn vocab(&self) -> &dyn Vocabulary {
        &self.vocab
    }

    fn init_context(&self, params: &ContextParams) -> Result<Box<dyn InferenceContext>> {
        if params.n_ctx == 0 {
            return Err(BackendError::ContextInit("n_ctx must be positive".into()));
        }
        if params.n_batch == 0 {
            return Err(BackendError::ContextInit("n_batch must be positive".into()));
        }
        tracing::debug!(
            model = %self.name,
            n_ctx = params.n_ctx,
            n_batch = params.n_batch,
            n_threads = params.n_threads,
            "allocated reference context"
        );
        Ok(Box::new(ReferenceContext {
            params: *params,
            scorer: self.scorer.clone(),
            cache: Vec::with_capacity(params.n_ctx),
            output: None,
        }))
    }
}

struct ReferenceContext {
    params: ContextParams,
    scorer: Scorer,
    cache: Vec<TokenId>,
    output: Option<Vec<f32>>,
}

impl InferenceContext for ReferenceContext {
    fn decode_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        let first = chunk.first_position().unwrap_or(self.cache.len());
        if chunk.is_empty() {
            return Err(BackendError::Decode {
                position: first,
                reason: "empty chunk".into(),
            });
        }
        if chunk.len() > self.params.n_batch {
            return Err(BackendError::Decode {
                position: first,
                reason: format!(
                    "chunk of {} tokens exceeds batch width {}",
                    chunk.len(),
                    self.params.n_batch
                ),
            });
        }

        // Validate the whole chunk before touching the cache.
        for (offset, entry) in chunk.entries().iter().enumerate() {
            let expected = self.cache.len() + offset;
            if entry.position != expected {
                return Err(BackendError::Decode {
                    position: entry.position,
                    reason: format!("expected position {expected}"),
                });
            }
            if entry.position >= self.params.n_ctx {
                return Err(BackendError::Decode {
                    position: entry.position,
                    reason: format!("context full ({} positions)", self.params.n_ctx),
                });
            }
            if usize::try_from(entry.token).map_or(true, |t| t >= self.scorer.n_vocab) {
                return Err(BackendError::Decode {
                    position: entry.position,
                    reason: format!("token {} out of vocabulary", entry.token),
                });
            }
        }

        let base = self.cache.len();
        self.cache.extend(chunk.entries().iter().map(|e| e.token));

        self.output = chunk
            .entries()
            .iter()
            .rposition(|e| e.wants_output)
            .map(|last| {
                let end = base + last + 1;
                self.scorer.logits(&self.cache[..end], self.params.n_ctx)
            });
        Ok(())
    }

    fn output_distribution(&self) -> Result<Vec<f32>> {
        self.output
            .clone()
            .ok_or_else(|| BackendError::NoOutput("last chunk requested no output".into()))
    }

    fn clear_cache(&mut self) {
        self.cache.clear();
        self.output = None;
    }
}
