//! Streaming sinks.
//!
//! Every consumer of generated text is a [`TokenSink`]: it receives one text
//! increment at a time and answers with [`StreamControl::Continue`] or
//! [`StreamControl::Stop`], or fails with a [`CallbackFault`]. Cancellation
//! is cooperative and checked once per emitted token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

/// Consumer decision after receiving a text increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Stop,
}

/// The consumer failed to produce a decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CallbackFault(pub String);

pub trait TokenSink {
    fn on_token(&mut self, text: &str) -> Result<StreamControl, CallbackFault>;
}

impl<F> TokenSink for F
where
    F: FnMut(&str) -> Result<StreamControl, CallbackFault>,
{
    fn on_token(&mut self, text: &str) -> Result<StreamControl, CallbackFault> {
        self(text)
    }
}

/// Adapts a `text -> bool` callback, where `true` means keep going.
pub struct ContinueWhile<F>(F);

pub fn continue_while<F>(f: F) -> ContinueWhile<F>
where
    F: FnMut(&str) -> bool,
{
    ContinueWhile(f)
}

impl<F> TokenSink for ContinueWhile<F>
where
    F: FnMut(&str) -> bool,
{
    fn on_token(&mut self, text: &str) -> Result<StreamControl, CallbackFault> {
        Ok(if (self.0)(text) {
            StreamControl::Continue
        } else {
            StreamControl::Stop
        })
    }
}

/// Forwards increments over a channel to another thread.
///
/// Every increment is sent before the cancel flag is consulted, so the
/// receiver always sees the fragment that ended the stream. Stops when the
/// receiver hangs up or the shared cancel flag is raised.
pub struct ChannelSink {
    tx: Sender<String>,
    cancelled: Arc<AtomicBool>,
}

impl ChannelSink {
    pub fn new(tx: Sender<String>) -> Self {
        Self {
            tx,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sink plus the receiving end of an unbounded channel.
    pub fn unbounded() -> (Self, Receiver<String>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::new(tx), rx)
    }

    /// Flag that, once set, makes the sink request a stop on the next token.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl TokenSink for ChannelSink {
    fn on_token(&mut self, text: &str) -> Result<StreamControl, CallbackFault> {
        if self.tx.send(text.to_string()).is_err() {
            return Ok(StreamControl::Stop);
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Ok(StreamControl::Stop);
        }
        Ok(StreamControl::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_sink() {
        let mut seen = Vec::new();
        let mut sink = |t: &str| -> Result<StreamControl, CallbackFault> {
            seen.push(t.to_string());
            Ok(StreamControl::Continue)
        };
        assert_eq!(sink.on_token("a"), Ok(StreamControl::Continue));
        assert_eq!(seen, vec!["a"]);
    }

    #[test]
    fn continue_while_maps_bool() {
        let mut count = 0;
        let mut sink = continue_while(|_| {
            count += 1;
            count < 2
        });
        assert_eq!(sink.on_token("x"), Ok(StreamControl::Continue));
        assert_eq!(sink.on_token("y"), Ok(StreamControl::Stop));
    }

    #[test]
    fn channel_sink_delivers_and_cancels() {
        let (mut sink, rx) = ChannelSink::unbounded();
        assert_eq!(sink.on_token("hi"), Ok(StreamControl::Continue));
        assert_eq!(rx.try_recv().unwrap(), "hi");

        sink.cancel_flag().store(true, Ordering::SeqCst);
        assert_eq!(sink.on_token("again"), Ok(StreamControl::Stop));
        assert_eq!(rx.try_recv().unwrap(), "again");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn channel_sink_stops_when_receiver_dropped() {
        let (mut sink, rx) = ChannelSink::unbounded();
        drop(rx);
        assert_eq!(sink.on_token("lost"), Ok(StreamControl::Stop));
    }
}
