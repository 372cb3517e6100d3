//! Telemetry hooks for inference performance measurement.
//!
//! Provides:
//! - [`InferenceMetrics`]: TTFT, tokens/sec, and generation summary
//! - [`TelemetryHook`] trait: callback interface for real-time metric reporting
//! - [`InferenceTimer`]: records timestamps and computes metrics
//! - [`NoopTelemetry`] / [`LogTelemetry`] / [`TracingTelemetry`]: built-in hooks

use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Aggregate metrics from a generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceMetrics {
    /// Time from the start of the call until prefill finished, in milliseconds.
    pub ttft_ms: f64,
    /// Tokens generated per second (decode throughput, excludes prefill).
    pub tokens_per_sec: f64,
    /// Number of prompt tokens processed during prefill.
    pub prompt_tokens: usize,
    /// Number of tokens emitted during decode.
    pub generated_tokens: usize,
    /// Total wall-clock time in milliseconds (prefill + decode).
    pub total_time_ms: f64,
}

impl InferenceMetrics {
    /// Metrics for a call that never got past tokenization or prefill.
    pub fn empty() -> Self {
        Self {
            ttft_ms: 0.0,
            tokens_per_sec: 0.0,
            prompt_tokens: 0,
            generated_tokens: 0,
            total_time_ms: 0.0,
        }
    }
}

/// Callback trait for real-time inference telemetry.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called after prefill completes.
    fn on_prefill_complete(&self, _ttft_ms: f64) {}

    /// Called after each emitted token.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Called when generation finishes with the full metrics summary.
    fn on_generation_complete(&self, _metrics: &InferenceMetrics) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Collects the last completed generation's metrics into a retrievable report.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<InferenceMetrics>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve the last completed generation's metrics.
    pub fn last_metrics(&self) -> Option<InferenceMetrics> {
        self.last_report
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(None)
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_generation_complete(&self, metrics: &InferenceMetrics) {
        if let Ok(mut guard) = self.last_report.lock() {
            *guard = Some(metrics.clone());
        }
    }
}

/// Emits `tracing` events for every telemetry callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_prefill_complete(&self, ttft_ms: f64) {
        tracing::debug!(ttft_ms, "prefill complete");
    }

    fn on_token_generated(&self, token_idx: usize, elapsed_ms: f64) {
        tracing::trace!(token_idx, elapsed_ms, "token generated");
    }

    fn on_generation_complete(&self, metrics: &InferenceMetrics) {
        tracing::info!(
            prompt_tokens = metrics.prompt_tokens,
            generated_tokens = metrics.generated_tokens,
            ttft_ms = metrics.ttft_ms,
            tokens_per_sec = metrics.tokens_per_sec,
            "generation complete"
        );
    }
}

/// Records timestamps during inference to compute [`InferenceMetrics`].
///
/// Usage:
/// 1. Call [`InferenceTimer::new`] at generation start
/// 2. Call [`InferenceTimer::mark_prefill_complete`] after prefill
/// 3. Call [`InferenceTimer::mark_token`] after each emitted token
/// 4. Call [`InferenceTimer::finish`] to compute final metrics
pub struct InferenceTimer {
    prompt_tokens: usize,
    start: Instant,
    prefill_end: Option<Instant>,
    token_count: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl InferenceTimer {
    pub fn new(prompt_tokens: usize, hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            prompt_tokens,
            start: Instant::now(),
            prefill_end: None,
            token_count: 0,
            hook,
        }
    }

    pub fn mark_prefill_complete(&mut self) {
        let now = Instant::now();
        self.prefill_end = Some(now);
        let ttft_ms = now.duration_since(self.start).as_secs_f64() * 1000.0;
        self.hook.on_prefill_complete(ttft_ms);
    }

    pub fn mark_token(&mut self) {
        self.token_count += 1;
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.hook.on_token_generated(self.token_count, elapsed_ms);
    }

    /// Finalize and return metrics. Fires `on_generation_complete`.
    pub fn finish(self) -> InferenceMetrics {
        let total_time_ms = self.start.elapsed().as_secs_f64() * 1000.0;

        let ttft_ms = self
            .prefill_end
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        let decode_time_ms = total_time_ms - ttft_ms;
        let tokens_per_sec = if decode_time_ms > 0.0 && self.token_count > 0 {
            self.token_count as f64 / (decode_time_ms / 1000.0)
        } else {
            0.0
        };

        let metrics = InferenceMetrics {
            ttft_ms,
            tokens_per_sec,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.token_count,
            total_time_ms,
        };

        self.hook.on_generation_complete(&metrics);
        metrics
    }
}
