//! # llamagen-cli
//!
//! Command line front-end: wires the session registry to the reference
//! backend (a JSON vocabulary file, or the built-in demo vocabulary) and
//! prints generated text, either cleaned at the end or streamed raw.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use llamagen::{
    CallbackFault, FinishReason, GenerationConfig, LlamaError, SessionRegistry, StreamControl,
};
use llamagen_engine::{BackendError, InferenceBackend, ModelHandle, TokenId};
use llamagen_runtime::{ReferenceBackend, ReferenceModel, TracingTelemetry};

/// Errors from the command line front-end.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Llama(#[from] LlamaError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CliResult<T> = std::result::Result<T, CliError>;

/// Options for one `generate` invocation.
#[derive(Debug, Clone, Default)]
pub struct GenerateArgs {
    pub prompt: String,
    pub model: Option<PathBuf>,
    pub max_tokens: usize,
    pub threads: i32,
    pub config: Option<PathBuf>,
    pub seed: Option<u64>,
    pub greedy: bool,
    pub stream: bool,
}

/// What a `generate` run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateReport {
    pub text: String,
    /// Only known for streamed runs.
    pub finish: Option<FinishReason>,
}

/// Install a stderr `tracing` subscriber; each `-v` raises the level.
pub fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

/// Load a reference model file, or the demo vocabulary when none is given.
pub fn load_model(path: Option<&Path>) -> CliResult<ModelHandle> {
    match path {
        Some(path) => Ok(ReferenceBackend::new().load_model(path)?),
        None => Ok(Arc::new(ReferenceModel::demo()?)),
    }
}

/// Merge the config file (if any) with command line overrides.
pub fn build_config(args: &GenerateArgs) -> CliResult<GenerationConfig> {
    let mut config = match &args.config {
        Some(path) => GenerationConfig::from_file(path)?,
        None => GenerationConfig::default(),
    };
    if args.greedy {
        config.sampling = llamagen::sampling::SamplingConfig {
            seed: config.sampling.seed,
            ..llamagen::sampling::SamplingConfig::greedy()
        };
    }
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }
    config.validate()?;
    Ok(config)
}

/// Run one generation, writing streamed fragments to `out` as they arrive.
pub fn generate(args: &GenerateArgs, out: &mut dyn Write) -> CliResult<GenerateReport> {
    let config = build_config(args)?;
    let registry = SessionRegistry::new(Arc::new(ReferenceBackend::new()), config)?
        .with_telemetry(Arc::new(TracingTelemetry));
    let model = load_model(args.model.as_deref())?;
    let handle = registry.create_with_model(model, args.threads)?;

    let report = if args.stream {
        let mut sink = |text: &str| -> Result<StreamControl, CallbackFault> {
            out.write_all(text.as_bytes())
                .and_then(|()| out.flush())
                .map(|()| StreamControl::Continue)
                .map_err(|e| CallbackFault(e.to_string()))
        };
        let outcome = registry.generate_stream(handle, &args.prompt, args.max_tokens, &mut sink)?;
        writeln!(out)?;
        GenerateReport {
            text: outcome.text,
            finish: Some(outcome.finish),
        }
    } else {
        let text = registry.generate(handle, &args.prompt, args.max_tokens)?;
        writeln!(out, "{text}")?;
        GenerateReport { text, finish: None }
    };

    registry.free(handle);
    Ok(report)
}

/// Terminal tokens a session on this model would stop on, with their text.
pub fn stop_tokens(model: Option<&Path>) -> CliResult<Vec<(TokenId, String)>> {
    let registry = SessionRegistry::new(
        Arc::new(ReferenceBackend::new()),
        GenerationConfig::default(),
    )?;
    let model = load_model(model)?;
    let vocab_model = Arc::clone(&model);
    let handle = registry.create_with_model(model, 1)?;
    let tokens = registry.terminal_tokens(handle)?;
    registry.free(handle);

    Ok(tokens
        .into_iter()
        .map(|id| {
            let text = vocab_model.vocab().text_of(id).unwrap_or("").to_string();
            (id, text)
        })
        .collect())
}
