//! Host-facing session registry.
//!
//! Sessions are addressed by opaque [`SessionHandle`]s. Each session sits
//! behind its own mutex; a call that finds its session busy is rejected
//! instead of waiting. Freeing a handle drops the registry's reference; the
//! session closes once any in-flight call holding it returns, and the model
//! is released with the last session that shares it.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use llamagen_engine::{InferenceBackend, ModelHandle};
use llamagen_runtime::TelemetryHook;
use uuid::Uuid;

use crate::config::GenerationConfig;
use crate::error::{LlamaError, Result};
use crate::generate::{GenerationOutcome, Generator};
use crate::session::Session;
use crate::stream::TokenSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type SharedSession = Arc<Mutex<Session>>;

pub struct SessionRegistry {
    backend: Arc<dyn InferenceBackend>,
    generator: Generator,
    sessions: Mutex<HashMap<SessionHandle, SharedSession>>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: GenerationConfig) -> Result<Self> {
        Ok(Self {
            backend,
            generator: Generator::new(config)?,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.generator = self.generator.with_telemetry(hook);
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        self.generator.config()
    }

    /// Load a model and open a session on it.
    pub fn create(&self, model_path: impl AsRef<Path>, thread_hint: i32) -> Result<SessionHandle> {
        let model = self.backend.load_model(model_path.as_ref())?;
        self.create_with_model(model, thread_hint)
    }

    /// Open a session on an already loaded model.
    pub fn create_with_model(&self, model: ModelHandle, thread_hint: i32) -> Result<SessionHandle> {
        let session = Session::open(model, thread_hint, self.generator.config())?;
        let handle = SessionHandle::new();
        self.table()?
            .insert(handle, Arc::new(Mutex::new(session)));
        tracing::info!(%handle, "session created");
        Ok(handle)
    }

    /// Release a session. Unknown or already freed handles are ignored.
    pub fn free(&self, handle: SessionHandle) {
        let removed = match self.sessions.lock() {
            Ok(mut table) => table.remove(&handle),
            Err(poisoned) => poisoned.into_inner().remove(&handle),
        };
        if removed.is_some() {
            tracing::info!(%handle, "session freed");
        }
    }

    pub fn contains(&self, handle: SessionHandle) -> bool {
        self.table().map(|t| t.contains_key(&handle)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.table().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset_cache(&self, handle: SessionHandle) -> Result<()> {
        self.with_session(handle, |session| session.reset())
    }

    pub fn generate(&self, handle: SessionHandle, prompt: &str, max_tokens: usize) -> Result<String> {
        self.with_session(handle, |session| {
            self.generator.generate(session, prompt, max_tokens)
        })
    }

    pub fn generate_stream<S>(
        &self,
        handle: SessionHandle,
        prompt: &str,
        max_tokens: usize,
        sink: &mut S,
    ) -> Result<GenerationOutcome>
    where
        S: TokenSink + ?Sized,
    {
        self.with_session(handle, |session| {
            self.generator
                .generate_stream(session, prompt, max_tokens, sink)
        })
    }

    /// Terminal tokens resolved for a session.
    pub fn terminal_tokens(&self, handle: SessionHandle) -> Result<Vec<llamagen_engine::TokenId>> {
        self.with_session(handle, |session| {
            Ok(session.stop_config().terminal_tokens().iter().copied().collect())
        })
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<SessionHandle, SharedSession>>> {
        self.sessions
            .lock()
            .map_err(|_| LlamaError::InvalidSession("session table poisoned".into()))
    }

    fn with_session<T>(
        &self,
        handle: SessionHandle,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        let shared = self
            .table()?
            .get(&handle)
            .cloned()
            .ok_or_else(|| LlamaError::InvalidSession(format!("unknown handle {handle}")))?;

        let mut session = match shared.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                return Err(LlamaError::InvalidSession(format!(
                    "session {handle} is busy"
                )))
            }
            Err(TryLockError::Poisoned(_)) => {
                return Err(LlamaError::InvalidSession(format!(
                    "session {handle} is poisoned"
                )))
            }
        };
        f(&mut session)
    }
}
