//! The generation loop.
//!
//! ```text
//! Idle -> Prefilling -> Sampling <-> Emitting -> Done | Aborted
//! ```
//!
//! Each iteration samples one token (first-token profile on the first step,
//! steady-state afterwards), runs stop detection against the text produced
//! so far, decodes and emits the fragment, then feeds the token back into
//! the session at the next position.
//!
//! Failures after setup never surface as errors: the call ends with a
//! [`FinishReason`] and whatever text was already produced.

use std::fmt;
use std::sync::Arc;

use llamagen_engine::TokenId;
use llamagen_runtime::{InferenceMetrics, InferenceTimer, NoopTelemetry, TelemetryHook};
use llamagen_sampling::{ChainProfile, SamplerPipeline};
use llamagen_tokenizer::{TextDecoder, TokenizeMode};

use crate::config::GenerationConfig;
use crate::error::Result;
use crate::prefill::PrefillScheduler;
use crate::session::Session;
use crate::stop::{StopDetector, StopReason};
use crate::stream::{CallbackFault, StreamControl, TokenSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationPhase {
    Idle,
    Prefilling,
    Sampling,
    Emitting,
    Done,
    Aborted,
}

/// Why a generation call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop(StopReason),
    /// The token budget was used up.
    Length,
    /// Feeding a sampled token back failed, or no logits were available.
    DecodeFailed,
    MissingFragment,
    TokenizationFailed,
    PrefillFailed,
    /// The consumer asked to stop.
    Cancelled,
    /// The consumer failed while receiving a fragment.
    CallbackFault,
}

impl FinishReason {
    pub fn phase(&self) -> GenerationPhase {
        match self {
            FinishReason::Cancelled | FinishReason::CallbackFault => GenerationPhase::Aborted,
            _ => GenerationPhase::Done,
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::Stop(reason) => write!(f, "stopped on {reason}"),
            FinishReason::Length => write!(f, "token budget exhausted"),
            FinishReason::DecodeFailed => write!(f, "decode failed"),
            FinishReason::MissingFragment => write!(f, "missing text fragment"),
            FinishReason::TokenizationFailed => write!(f, "tokenization failed"),
            FinishReason::PrefillFailed => write!(f, "prefill failed"),
            FinishReason::Cancelled => write!(f, "cancelled by consumer"),
            FinishReason::CallbackFault => write!(f, "consumer fault"),
        }
    }
}

/// Per-call accumulator. The terminal phase is reported on the
/// [`GenerationOutcome`].
#[derive(Debug)]
struct GenerationState {
    text: String,
    tokens: Vec<TokenId>,
    phase: GenerationPhase,
}

impl GenerationState {
    fn new() -> Self {
        Self {
            text: String::new(),
            tokens: Vec::new(),
            phase: GenerationPhase::Idle,
        }
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn enter(&mut self, phase: GenerationPhase) {
        tracing::trace!(from = ?self.phase, to = ?phase, "phase");
        self.phase = phase;
    }

    fn push(&mut self, token: TokenId, fragment: &str) {
        self.tokens.push(token);
        self.text.push_str(fragment);
    }

    fn finish(mut self, finish: FinishReason, metrics: InferenceMetrics) -> GenerationOutcome {
        self.enter(finish.phase());
        GenerationOutcome {
            text: self.text,
            tokens: self.tokens,
            finish,
            metrics,
        }
    }
}

/// Result of a streaming generation call.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    /// Raw concatenation of every emitted fragment.
    pub text: String,
    pub tokens: Vec<TokenId>,
    pub finish: FinishReason,
    pub metrics: InferenceMetrics,
}

impl GenerationOutcome {
    pub fn phase(&self) -> GenerationPhase {
        self.finish.phase()
    }

    pub fn is_aborted(&self) -> bool {
        self.phase() == GenerationPhase::Aborted
    }
}

/// Runs generations against sessions with one configuration.
#[derive(Clone)]
pub struct Generator {
    config: GenerationConfig,
    telemetry: Arc<dyn TelemetryHook>,
}

impl Generator {
    pub fn new(config: GenerationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            telemetry: Arc::new(NoopTelemetry),
        })
    }

    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = hook;
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Generate and return the cleaned final text.
    ///
    /// Returns an empty string when the prompt cannot be tokenized or
    /// prefilled.
    pub fn generate(&self, session: &mut Session, prompt: &str, max_tokens: usize) -> Result<String> {
        let mut sink = |_: &str| -> std::result::Result<StreamControl, CallbackFault> {
            Ok(StreamControl::Continue)
        };
        let outcome = self.generate_stream(session, prompt, max_tokens, &mut sink)?;
        Ok(self.config.stop.clean(&outcome.text))
    }

    /// Generate, pushing every raw fragment to `sink` as it is produced.
    ///
    /// The session is reset first. Only a closed or busy session and sampler
    /// defects are reported as `Err`.
    pub fn generate_stream<S>(
        &self,
        session: &mut Session,
        prompt: &str,
        max_tokens: usize,
        sink: &mut S,
    ) -> Result<GenerationOutcome>
    where
        S: TokenSink + ?Sized,
    {
        session.reset()?;
        let mut pipeline = SamplerPipeline::new(&self.config.sampling)?;
        let mut state = GenerationState::new();

        let mode = TokenizeMode::from_structured(self.config.prompt.structured);
        let tokens = match session.tokenizer().tokenize(prompt, mode) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(error = %e, "prompt tokenization failed");
                let timer = InferenceTimer::new(0, Arc::clone(&self.telemetry));
                return Ok(state.finish(FinishReason::TokenizationFailed, timer.finish()));
            }
        };

        state.enter(GenerationPhase::Prefilling);
        let mut timer = InferenceTimer::new(tokens.len(), Arc::clone(&self.telemetry));
        if let Err(e) = PrefillScheduler::for_session(session).prefill(session, &tokens) {
            tracing::warn!(error = %e, "prefill failed");
            return Ok(state.finish(FinishReason::PrefillFailed, timer.finish()));
        }
        timer.mark_prefill_complete();

        let finish = self.decode_loop(session, &mut pipeline, &mut state, &mut timer, sink, max_tokens)?;
        tracing::debug!(
            generated = state.tokens.len(),
            finish = %finish,
            "generation finished"
        );
        Ok(state.finish(finish, timer.finish()))
    }

    fn decode_loop<S>(
        &self,
        session: &mut Session,
        pipeline: &mut SamplerPipeline,
        state: &mut GenerationState,
        timer: &mut InferenceTimer,
        sink: &mut S,
        max_tokens: usize,
    ) -> Result<FinishReason>
    where
        S: TokenSink + ?Sized,
    {
        let tokenizer = session.tokenizer().clone();
        let stop = session.stop_config().clone();
        let decoder = TextDecoder::new(&tokenizer);
        let detector = StopDetector::new(&stop, tokenizer.vocab());

        for step in 0..max_tokens {
            state.enter(GenerationPhase::Sampling);
            let logits = match session.output_distribution() {
                Ok(logits) => logits,
                Err(e) => {
                    tracing::warn!(error = %e, "no output distribution");
                    return Ok(FinishReason::DecodeFailed);
                }
            };

            let profile = if step == 0 {
                ChainProfile::FirstToken
            } else {
                ChainProfile::SteadyState
            };
            let token = pipeline.sample(profile, &logits)?;

            if let Some(reason) = detector.check(token, state.text()) {
                tracing::debug!(token, %reason, step, "stop");
                return Ok(FinishReason::Stop(reason));
            }

            let fragment = match decoder.decode(token) {
                Ok(fragment) => fragment,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot decode sampled token");
                    return Ok(FinishReason::MissingFragment);
                }
            };

            state.enter(GenerationPhase::Emitting);
            state.push(token, &fragment);
            timer.mark_token();
            match sink.on_token(&fragment) {
                Ok(StreamControl::Continue) => {}
                Ok(StreamControl::Stop) => {
                    tracing::debug!(step, "consumer requested stop");
                    return Ok(FinishReason::Cancelled);
                }
                Err(fault) => {
                    tracing::warn!(%fault, "stream consumer fault");
                    return Ok(FinishReason::CallbackFault);
                }
            }

            pipeline.accept(token);
            if let Err(e) = session.feed_token(token) {
                tracing::warn!(error = %e, "token feedback failed");
                return Ok(FinishReason::DecodeFailed);
            }
        }
        Ok(FinishReason::Length)
    }
}
