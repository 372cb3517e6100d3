//! Per-conversation backend state.
//!
//! A [`Session`] owns one backend context (the cache) for a shared model and
//! tracks the next position to feed. Positions handed to the backend are
//! contiguous from 0; [`Session::reset`] clears the cache and rewinds the
//! cursor, and must run before the session is used for an unrelated prompt.

use llamagen_engine::{Chunk, ContextParams, InferenceContext, ModelHandle, TokenId};
use llamagen_tokenizer::TokenizerAdapter;

use crate::config::{resolve_threads, GenerationConfig};
use crate::error::{LlamaError, Result};
use crate::stop::StopConfig;

pub struct Session {
    model: ModelHandle,
    tokenizer: TokenizerAdapter,
    context: Option<Box<dyn InferenceContext>>,
    params: ContextParams,
    stop: StopConfig,
    next_pos: usize,
}

impl Session {
    /// Allocate backend state for `model`.
    ///
    /// `thread_hint <= 0` selects the hardware concurrency. On failure the
    /// caller still owns its model handle.
    pub fn open(model: ModelHandle, thread_hint: i32, config: &GenerationConfig) -> Result<Self> {
        let n_threads = resolve_threads(thread_hint);
        tracing::debug!(thread_hint, n_threads, "resolved thread count");

        let params = config.context_params(n_threads);
        let context = model.init_context(&params)?;
        tracing::info!(
            model = model.name(),
            n_ctx = params.n_ctx,
            n_batch = params.n_batch,
            n_threads,
            "context initialized"
        );

        let tokenizer =
            TokenizerAdapter::new(model.clone()).with_add_special(config.prompt.add_special);
        let stop = StopConfig::resolve(&tokenizer, config.stop.clone());
        tracing::debug!(terminal = ?stop.terminal_tokens(), "stop config resolved");

        Ok(Self {
            model,
            tokenizer,
            context: Some(context),
            params,
            stop,
            next_pos: 0,
        })
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn tokenizer(&self) -> &TokenizerAdapter {
        &self.tokenizer
    }

    pub fn stop_config(&self) -> &StopConfig {
        &self.stop
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    /// Position the next fed token will occupy.
    pub fn next_pos(&self) -> usize {
        self.next_pos
    }

    pub fn is_closed(&self) -> bool {
        self.context.is_none()
    }

    /// Invalidate all cached state and rewind to position 0. Idempotent.
    pub fn reset(&mut self) -> Result<()> {
        self.context_mut()?.clear_cache();
        self.next_pos = 0;
        tracing::debug!("cache cleared");
        Ok(())
    }

    /// Release backend resources. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.context.take().is_some() {
            tracing::debug!(model = self.model.name(), "session closed");
        }
    }

    /// Submit one chunk whose first position must equal [`Session::next_pos`].
    /// The cursor only advances when the backend accepts the chunk.
    pub fn decode(&mut self, chunk: &Chunk) -> Result<()> {
        let position = self.next_pos;
        if chunk.first_position() != Some(position) {
            return Err(LlamaError::Decode {
                position,
                reason: format!("{chunk} does not start at the session cursor"),
            });
        }
        self.context_mut()?
            .decode_chunk(chunk)
            .map_err(|e| LlamaError::at_position(e, position))?;
        self.next_pos += chunk.len();
        Ok(())
    }

    /// Feed one sampled token back at the next position, requesting output.
    pub fn feed_token(&mut self, token: TokenId) -> Result<()> {
        let chunk = Chunk::single(token, self.next_pos);
        self.decode(&chunk)
    }

    /// Logits for the last entry that requested output.
    pub fn output_distribution(&self) -> Result<Vec<f32>> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| LlamaError::InvalidSession("session is closed".into()))?;
        context
            .output_distribution()
            .map_err(|e| LlamaError::at_position(e, self.next_pos))
    }

    fn context_mut(&mut self) -> Result<&mut Box<dyn InferenceContext>> {
        self.context
            .as_mut()
            .ok_or_else(|| LlamaError::InvalidSession("session is closed".into()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
