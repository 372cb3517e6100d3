//! Host API tests: handle lifecycle, reset isolation and busy sessions.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::*;
use llamagen::{
    CallbackFault, ChannelSink, FinishReason, GenerationConfig, LlamaError, SessionRegistry,
    StreamControl, TokenSink,
};

fn registry_for(model: &llamagen::engine::ModelHandle) -> SessionRegistry {
    let backend = Arc::new(MockBackend::new(Arc::clone(model)));
    SessionRegistry::new(backend, GenerationConfig::default().with_seed(5)).unwrap()
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[test]
fn create_generate_free() {
    let model = MockModel::scripted(&[HELLO, WORLD, EOS]).into_handle();
    let registry = registry_for(&model);

    let handle = registry.create("weights/model.bin", 2).unwrap();
    assert!(registry.contains(handle));
    assert_eq!(registry.len(), 1);

    assert_eq!(registry.generate(handle, "Hello", 5).unwrap(), " Hello world");

    registry.free(handle);
    assert!(registry.is_empty());
    assert!(matches!(
        registry.generate(handle, "Hello", 5),
        Err(LlamaError::InvalidSession(_))
    ));
}

#[test]
fn free_is_idempotent() {
    let model = MockModel::scripted(&[EOS]).into_handle();
    let registry = registry_for(&model);
    let handle = registry.create("model.bin", 1).unwrap();
    registry.free(handle);
    registry.free(handle);
    assert!(matches!(
        registry.reset_cache(handle),
        Err(LlamaError::InvalidSession(_))
    ));
}

#[test]
fn model_load_failure() {
    let model = MockModel::scripted(&[EOS]).into_handle();
    let registry = registry_for(&model);
    assert!(matches!(
        registry.create("missing.bin", 1),
        Err(LlamaError::ModelLoad(_))
    ));
    assert!(registry.is_empty());
}

#[test]
fn context_init_failure_leaves_no_session() {
    let model = MockModel::scripted(&[EOS]).fail_context_init().into_handle();
    let registry = registry_for(&model);
    assert!(matches!(
        registry.create("model.bin", 1),
        Err(LlamaError::ContextInit(_))
    ));
    assert!(registry.is_empty());
    // Only the test and the backend still hold the model.
    assert_eq!(Arc::strong_count(&model), 2);
}

#[test]
fn model_outlives_sessions_that_share_it() {
    let model = MockModel::scripted(&[EOS]).into_handle();
    let registry = registry_for(&model);
    let a = registry.create_with_model(Arc::clone(&model), 1).unwrap();
    let b = registry.create_with_model(Arc::clone(&model), 1).unwrap();
    assert_ne!(a, b);

    // test + backend + one per session (tokenizer adapter included)
    let with_both = Arc::strong_count(&model);
    registry.free(a);
    let with_one = Arc::strong_count(&model);
    assert!(with_one < with_both);
    assert!(registry.generate(b, "Hi", 3).is_ok());

    registry.free(b);
    assert_eq!(Arc::strong_count(&model), 2);
}

// ===========================================================================
// Cache Isolation
// ===========================================================================

#[test]
fn reset_cache_clears_backend_state() {
    let model = MockModel::new(LogitsMode::History);
    let recorder = model.recorder();
    let model = model.into_handle();
    let registry = registry_for(&model);
    let handle = registry.create("model.bin", 1).unwrap();

    let before = recorder.clears();
    registry.reset_cache(handle).unwrap();
    registry.reset_cache(handle).unwrap();
    assert_eq!(recorder.clears(), before + 2);
}

#[test]
fn unrelated_prompts_do_not_leak_across_reset() {
    let shared = MockModel::new(LogitsMode::History).into_handle();
    let registry = registry_for(&shared);
    let reused = registry.create("model.bin", 1).unwrap();
    registry.generate(reused, "first conversation about cats", 8).unwrap();
    registry.reset_cache(reused).unwrap();
    let after_a = registry.generate(reused, "second prompt", 8).unwrap();

    let fresh_model = MockModel::new(LogitsMode::History).into_handle();
    let fresh_registry = registry_for(&fresh_model);
    let fresh = fresh_registry.create("model.bin", 1).unwrap();
    let alone = fresh_registry.generate(fresh, "second prompt", 8).unwrap();

    assert!(!alone.is_empty());
    assert_eq!(after_a, alone);
}

#[test]
fn positions_restart_after_reset() {
    let model = MockModel::scripted(&[HELLO, EOS]);
    let recorder = model.recorder();
    let model = model.into_handle();
    let registry = registry_for(&model);
    let handle = registry.create("model.bin", 1).unwrap();

    registry.generate(handle, "Hi", 4).unwrap();
    recorder.forget();
    registry.generate(handle, "Hi", 4).unwrap();
    assert_eq!(recorder.positions(), vec![0, 1, 2, 3]);
}

// ===========================================================================
// Concurrency
// ===========================================================================

#[test]
fn concurrent_call_on_busy_session_is_rejected() {
    let model = MockModel::scripted(&[HELLO, WORLD, EOS]).into_handle();
    let registry = registry_for(&model);
    let handle = registry.create("model.bin", 1).unwrap();

    let mut nested = None;
    let mut sink = |_: &str| -> Result<StreamControl, CallbackFault> {
        nested = Some(registry.generate(handle, "Hi", 1));
        Ok(StreamControl::Stop)
    };
    let outcome = registry.generate_stream(handle, "Hi", 5, &mut sink).unwrap();

    assert_eq!(outcome.finish, FinishReason::Cancelled);
    assert!(matches!(nested, Some(Err(LlamaError::InvalidSession(_)))));
    // The session is usable again once the first call returns.
    assert!(registry.generate(handle, "Hi", 5).is_ok());
}

#[test]
fn channel_sink_streams_to_another_thread() {
    let model = MockModel::scripted(&[HELLO, WORLD, HELLO, EOS]).into_handle();
    let registry = Arc::new(registry_for(&model));
    let handle = registry.create("model.bin", 1).unwrap();

    let (mut sink, rx) = ChannelSink::unbounded();
    let consumer = std::thread::spawn(move || rx.iter().collect::<String>());

    let outcome = registry
        .generate_stream(handle, "Hi", 10, &mut sink)
        .unwrap();
    drop(sink);

    assert_eq!(consumer.join().unwrap(), outcome.text);
    assert_eq!(outcome.text, " Hello world Hello");
}

#[test]
fn channel_sink_cancel_flag_stops_generation() {
    let model = MockModel::scripted(&[HELLO, WORLD, EOS]).into_handle();
    let registry = registry_for(&model);
    let handle = registry.create("model.bin", 1).unwrap();

    let (mut sink, rx) = ChannelSink::unbounded();
    sink.cancel();
    let outcome = registry.generate_stream(handle, "Hi", 5, &mut sink).unwrap();
    assert_eq!(outcome.finish, FinishReason::Cancelled);
    assert_eq!(outcome.tokens, vec![HELLO]);
    assert_eq!(rx.try_iter().collect::<String>(), outcome.text);
}

#[test]
fn cancelled_channel_stream_reports_only_delivered_text() {
    let model = MockModel::scripted(&[HELLO, WORLD, HELLO, EOS]).into_handle();
    let registry = registry_for(&model);
    let handle = registry.create("model.bin", 1).unwrap();

    let (mut channel, rx) = ChannelSink::unbounded();
    let flag = channel.cancel_flag();
    let mut calls = 0;
    let mut sink = |text: &str| -> Result<StreamControl, CallbackFault> {
        calls += 1;
        if calls == 2 {
            flag.store(true, Ordering::SeqCst);
        }
        channel.on_token(text)
    };
    let outcome = registry.generate_stream(handle, "Hi", 10, &mut sink).unwrap();

    assert_eq!(outcome.finish, FinishReason::Cancelled);
    assert_eq!(rx.try_iter().collect::<String>(), outcome.text);
    assert_eq!(outcome.text, " Hello world");
}

#[test]
fn terminal_tokens_per_session() {
    let model = MockModel::scripted(&[EOS]).into_handle();
    let registry = registry_for(&model);
    let handle = registry.create("model.bin", 1).unwrap();
    assert_eq!(registry.terminal_tokens(handle).unwrap(), vec![EOS, IM_END]);
}
