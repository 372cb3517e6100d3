//! # llamagen-sampling
//!
//! Sampler chains for llamagen.
//!
//! A [`SamplerChain`] applies its stages in a fixed order and finishes with a
//! draw:
//!
//! 1. Repetition penalty over a bounded lookback window
//! 2. Top-k truncation
//! 3. Top-p (nucleus) truncation
//! 4. Temperature scaling
//! 5. Seeded categorical draw (or argmax for the greedy strategy)
//!
//! Penalty precedes truncation so already-seen tokens cannot still dominate
//! top-k/top-p; truncation precedes temperature so temperature reshapes only
//! the surviving mass.
//!
//! A [`SamplerPipeline`] holds the two chains used per generation: a colder
//! [`ChainProfile::FirstToken`] chain for the very first token and a warmer
//! [`ChainProfile::SteadyState`] chain for everything after it.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use llamagen_engine::TokenId;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("Invalid logits array")]
    InvalidLogits,
    #[error("Temperature must be > 0 (got {0})")]
    InvalidTemperature(f32),
    #[error("Top-p must be in (0, 1] (got {0})")]
    InvalidTopP(f32),
    #[error("Repetition penalty must be > 0 (got {0})")]
    InvalidPenalty(f32),
    #[error("No candidate tokens survived the {0} stage")]
    EmptyDistribution(&'static str),
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Which chain of a [`SamplerPipeline`] to draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainProfile {
    /// The first sampled token of a generation.
    FirstToken,
    /// Every token after the first.
    SteadyState,
}

impl fmt::Display for ChainProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainProfile::FirstToken => write!(f, "first-token"),
            ChainProfile::SteadyState => write!(f, "steady-state"),
        }
    }
}

/// Final selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingStrategy {
    /// Full stage chain ending in a seeded categorical draw.
    #[default]
    Chain,
    /// Repetition penalty followed by argmax.
    Greedy,
}

/// Sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default)]
    pub strategy: SamplingStrategy,

    /// RNG seed. `None` seeds from the OS.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Top-K: keep only the K highest logits. 0 = disabled.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Top-P (nucleus): keep the smallest set whose cumulative probability
    /// reaches P. 1.0 = disabled.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Repetition penalty (1.0 = none). Values > 1.0 discourage repetition.
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    /// How many recently accepted tokens the penalty looks at.
    #[serde(default = "default_penalty_last_n")]
    pub penalty_last_n: usize,

    /// Temperature of the first-token chain.
    #[serde(default = "default_first_token_temperature")]
    pub first_token_temperature: f32,

    /// Temperature of the steady-state chain.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_top_k() -> usize {
    40
}
fn default_top_p() -> f32 {
    0.9
}
fn default_repetition_penalty() -> f32 {
    1.1
}
fn default_penalty_last_n() -> usize {
    64
}
fn default_first_token_temperature() -> f32 {
    0.4
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            strategy: SamplingStrategy::Chain,
            seed: None,
            top_k: default_top_k(),
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
            penalty_last_n: default_penalty_last_n(),
            first_token_temperature: default_first_token_temperature(),
            temperature: default_temperature(),
        }
    }
}

impl SamplingConfig {
    /// Greedy decoding with no repetition penalty.
    pub fn greedy() -> Self {
        SamplingConfig {
            strategy: SamplingStrategy::Greedy,
            repetition_penalty: 1.0,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_strategy(mut self, strategy: SamplingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_temperatures(mut self, first_token: f32, steady_state: f32) -> Self {
        self.first_token_temperature = first_token;
        self.temperature = steady_state;
        self
    }

    pub fn temperature_for(&self, profile: ChainProfile) -> f32 {
        match profile {
            ChainProfile::FirstToken => self.first_token_temperature,
            ChainProfile::SteadyState => self.temperature,
        }
    }

    /// Seed for one profile; the two chains draw from distinct streams.
    pub fn seed_for(&self, profile: ChainProfile) -> Option<u64> {
        self.seed.map(|s| match profile {
            ChainProfile::FirstToken => s,
            ChainProfile::SteadyState => s.wrapping_add(1),
        })
    }

    pub fn validate(&self) -> SamplingResult<()> {
        if self.strategy == SamplingStrategy::Chain {
            for t in [self.first_token_temperature, self.temperature] {
                if !(t > 0.0) {
                    return Err(SamplingError::InvalidTemperature(t));
                }
            }
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SamplingError::InvalidTopP(self.top_p));
        }
        if !(self.repetition_penalty > 0.0) {
            return Err(SamplingError::InvalidPenalty(self.repetition_penalty));
        }
        Ok(())
    }
}

/// A probability-transforming stage of a chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerStage {
    RepetitionPenalty { penalty: f32, last_n: usize },
    TopK(usize),
    TopP(f32),
    Temperature(f32),
}

impl SamplerStage {
    pub fn name(&self) -> &'static str {
        match self {
            SamplerStage::RepetitionPenalty { .. } => "repetition-penalty",
            SamplerStage::TopK(_) => "top-k",
            SamplerStage::TopP(_) => "top-p",
            SamplerStage::Temperature(_) => "temperature",
        }
    }

    /// Position in the canonical stage order.
    fn rank(&self) -> u8 {
        match self {
            SamplerStage::RepetitionPenalty { .. } => 0,
            SamplerStage::TopK(_) => 1,
            SamplerStage::TopP(_) => 2,
            SamplerStage::Temperature(_) => 3,
        }
    }
}

/// Terminal step of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Draw {
    Categorical,
    Greedy,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: TokenId,
    logit: f32,
}

/// An ordered list of stages plus a seeded terminal draw.
#[derive(Debug, Clone)]
pub struct SamplerChain {
    stages: Vec<SamplerStage>,
    draw: Draw,
    rng: StdRng,
    /// Recently accepted tokens, newest last.
    recent: VecDeque<TokenId>,
    window: usize,
}

impl SamplerChain {
    /// An empty chain ending in a categorical draw.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            stages: Vec::new(),
            draw: Draw::Categorical,
            rng,
            recent: VecDeque::new(),
            window: 0,
        }
    }

    /// An empty chain ending in argmax.
    pub fn greedy() -> Self {
        let mut chain = Self::new(Some(0));
        chain.draw = Draw::Greedy;
        chain
    }

    /// Add a stage, keeping the canonical stage order regardless of the
    /// order stages are added in.
    pub fn with_stage(mut self, stage: SamplerStage) -> Self {
        if let SamplerStage::RepetitionPenalty { last_n, .. } = stage {
            self.window = self.window.max(last_n);
        }
        let at = self
            .stages
            .iter()
            .position(|s| s.rank() > stage.rank())
            .unwrap_or(self.stages.len());
        self.stages.insert(at, stage);
        self
    }

    /// Build the chain for one profile of a configuration.
    pub fn from_config(config: &SamplingConfig, profile: ChainProfile) -> SamplingResult<Self> {
        config.validate()?;

        let penalty = SamplerStage::RepetitionPenalty {
            penalty: config.repetition_penalty,
            last_n: config.penalty_last_n,
        };

        let chain = match config.strategy {
            SamplingStrategy::Greedy => SamplerChain::greedy().with_stage(penalty),
            SamplingStrategy::Chain => SamplerChain::new(config.seed_for(profile))
                .with_stage(penalty)
                .with_stage(SamplerStage::TopK(config.top_k))
                .with_stage(SamplerStage::TopP(config.top_p))
                .with_stage(SamplerStage::Temperature(config.temperature_for(profile))),
        };
        Ok(chain)
    }

    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    pub fn draw(&self) -> Draw {
        self.draw
    }

    /// Record a token that was actually emitted, for the repetition penalty.
    pub fn accept(&mut self, token: TokenId) {
        if self.window == 0 {
            return;
        }
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(token);
    }

    /// Select a token from raw logits.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<TokenId> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }

        let mut candidates: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .map(|(i, &logit)| Candidate {
                id: i as TokenId,
                logit,
            })
            .collect();
        if candidates.is_empty() {
            return Err(SamplingError::EmptyDistribution("input"));
        }

        for stage in &self.stages {
            match *stage {
                SamplerStage::RepetitionPenalty { penalty, last_n } => {
                    apply_repetition_penalty(&mut candidates, &self.recent, penalty, last_n)
                }
                SamplerStage::TopK(k) => apply_top_k(&mut candidates, k),
                SamplerStage::TopP(p) => apply_top_p(&mut candidates, p),
                SamplerStage::Temperature(t) => apply_temperature(&mut candidates, t)?,
            }
            if candidates.is_empty() {
                return Err(SamplingError::EmptyDistribution(stage.name()));
            }
        }

        match self.draw {
            Draw::Greedy => Ok(argmax(&candidates)),
            Draw::Categorical => {
                let probs = softmax(&candidates);
                let dist = WeightedIndex::new(&probs)
                    .map_err(|_| SamplingError::EmptyDistribution("draw"))?;
                Ok(candidates[dist.sample(&mut self.rng)].id)
            }
        }
    }
}

/// Divide positive logits by the penalty and multiply negative ones, so a
/// repeated token always becomes less likely regardless of sign.
fn apply_repetition_penalty(
    candidates: &mut [Candidate],
    recent: &VecDeque<TokenId>,
    penalty: f32,
    last_n: usize,
) {
    if last_n == 0 || (penalty - 1.0).abs() < f32::EPSILON {
        return;
    }
    let seen: HashSet<TokenId> = recent.iter().rev().take(last_n).copied().collect();
    for c in candidates.iter_mut().filter(|c| seen.contains(&c.id)) {
        if c.logit > 0.0 {
            c.logit /= penalty;
        } else {
            c.logit *= penalty;
        }
    }
}

fn sort_descending(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));
}

fn apply_top_k(candidates: &mut Vec<Candidate>, k: usize) {
    if k == 0 || k >= candidates.len() {
        return;
    }
    sort_descending(candidates);
    candidates.truncate(k);
}

fn apply_top_p(candidates: &mut Vec<Candidate>, p: f32) {
    if p >= 1.0 {
        return;
    }
    sort_descending(candidates);
    let probs = softmax(candidates);

    let mut cumsum = 0.0;
    let mut keep = candidates.len();
    for (idx, prob) in probs.iter().enumerate() {
        cumsum += prob;
        if cumsum >= p {
            keep = idx + 1;
            break;
        }
    }
    candidates.truncate(keep);
}

fn apply_temperature(candidates: &mut [Candidate], temperature: f32) -> SamplingResult<()> {
    if !(temperature > 0.0) {
        return Err(SamplingError::InvalidTemperature(temperature));
    }
    for c in candidates.iter_mut() {
        c.logit /= temperature;
    }
    Ok(())
}

fn softmax(candidates: &[Candidate]) -> Vec<f32> {
    let max_logit = candidates
        .iter()
        .map(|c| c.logit)
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = candidates
        .iter()
        .map(|c| (c.logit - max_logit).exp())
        .collect();
    let sum: f32 = exps.iter().sum();

    if sum > 0.0 {
        exps.iter().map(|&e| e / sum).collect()
    } else {
        vec![1.0 / candidates.len() as f32; candidates.len()]
    }
}

fn argmax(candidates: &[Candidate]) -> TokenId {
    candidates
        .iter()
        .max_by(|a, b| a.logit.total_cmp(&b.logit))
        .map(|c| c.id)
        .unwrap_or(0)
}

/// The two chains used by one generation call.
#[derive(Debug, Clone)]
pub struct SamplerPipeline {
    first_token: SamplerChain,
    steady_state: SamplerChain,
}

impl SamplerPipeline {
    pub fn new(config: &SamplingConfig) -> SamplingResult<Self> {
        Ok(Self {
            first_token: SamplerChain::from_config(config, ChainProfile::FirstToken)?,
            steady_state: SamplerChain::from_config(config, ChainProfile::SteadyState)?,
        })
    }

    pub fn chain(&self, profile: ChainProfile) -> &SamplerChain {
        match profile {
            ChainProfile::FirstToken => &self.first_token,
            ChainProfile::SteadyState => &self.steady_state,
        }
    }

    pub fn sample(&mut self, profile: ChainProfile, logits: &[f32]) -> SamplingResult<TokenId> {
        match profile {
            ChainProfile::FirstToken => self.first_token.sample(logits),
            ChainProfile::SteadyState => self.steady_state.sample(logits),
        }
    }

    /// Record an emitted token in both chains' penalty windows.
    pub fn accept(&mut self, token: TokenId) {
        self.first_token.accept(token);
        self.steady_state.accept(token);
    }
}
