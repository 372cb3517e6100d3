//! Chunked prefill.
//!
//! A prompt is split into consecutive chunks of at most `capacity` tokens.
//! Only the last token of the whole prompt requests output.

use llamagen_engine::{Chunk, ChunkEntry, TokenId};

use crate::error::{LlamaError, Result};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefillScheduler {
    capacity: usize,
}

impl PrefillScheduler {
    /// A zero capacity is treated as 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    /// Scheduler sized to the session's batch width.
    pub fn for_session(session: &Session) -> Self {
        Self::new(session.params().n_batch)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Build the chunks for `tokens` starting at absolute position `start`.
    pub fn plan(&self, tokens: &[TokenId], start: usize) -> Result<Vec<Chunk>> {
        let last = tokens.len().saturating_sub(1);
        let mut chunks = Vec::with_capacity(tokens.len().div_ceil(self.capacity));

        for (chunk_idx, window) in tokens.chunks(self.capacity).enumerate() {
            let mut chunk = Chunk::with_capacity(self.capacity);
            for (offset, &token) in window.iter().enumerate() {
                let index = chunk_idx * self.capacity + offset;
                let position = start + index;
                chunk
                    .push(ChunkEntry {
                        token,
                        position,
                        wants_output: index == last,
                    })
                    .map_err(|e| LlamaError::at_position(e, position))?;
            }
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Feed `tokens` into `session` chunk by chunk.
    ///
    /// Stops at the first failing chunk; the session cursor then sits after
    /// the last chunk the backend accepted.
    pub fn prefill(&self, session: &mut Session, tokens: &[TokenId]) -> Result<()> {
        if tokens.is_empty() {
            return Err(LlamaError::Decode {
                position: session.next_pos(),
                reason: "nothing to prefill".into(),
            });
        }

        let chunks = self.plan(tokens, session.next_pos())?;
        tracing::debug!(
            n_tokens = tokens.len(),
            n_chunks = chunks.len(),
            capacity = self.capacity,
            "prefill"
        );
        for chunk in &chunks {
            tracing::trace!(%chunk, "submitting");
            session.decode(chunk)?;
        }
        Ok(())
    }
}
