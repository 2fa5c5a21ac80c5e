//! Structured logging for dysect.
//!
//! The core reports through `tracing` with a global subscriber installed
//! once at front-end or back-end start. The five dysect reporting
//! levels map onto tracing levels:
//!
//! | dysect  | tracing |
//! |---------|---------|
//! | verbose | TRACE   |
//! | log     | DEBUG   |
//! | info    | INFO    |
//! | warn    | WARN    |
//! | fatal   | ERROR   |
//!
//! `fatal` call sites additionally return a non-OK code to the caller so
//! a probe script can inspect the outcome; that part lives in the error
//! taxonomy, not here.
//!
//! # Correlation fields
//!
//! Use these field names consistently in spans and events:
//! - `probe_id`: backend probe identifier (tree-position hash)
//! - `stream_id`: overlay stream identifier
//! - `proc`: target process id
//! - `mpi_rank`, `backend_rank`: rank context

use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Global flag to track if logging has been initialized.
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-friendly output for interactive use.
    #[default]
    Pretty,
    /// Machine-parseable JSON lines.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error).
    /// Can be overridden by the `RUST_LOG` environment variable.
    pub level: String,

    /// Output format.
    pub format: LogFormat,

    /// Optional path to a log file. When set, log lines are appended to
    /// this file instead of stderr (useful on back-end daemons where
    /// stderr is swallowed by the launcher).
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Error type for logging initialization.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn build_filter(level: &str) -> Result<EnvFilter, LogError> {
    match level {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        other => return Err(LogError::InvalidLevel(other.to_string())),
    }
    // RUST_LOG wins when present.
    Ok(EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string())))
}

/// Initialize the global tracing subscriber.
///
/// Call once per process; a second call returns
/// [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = build_filter(&config.level)?;

    match (&config.file, config.format) {
        (Some(path), format) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            match format {
                LogFormat::Json => {
                    let subscriber = tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json().with_writer(file).with_ansi(false));
                    tracing::subscriber::set_global_default(subscriber)?;
                }
                LogFormat::Pretty => {
                    let subscriber = tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().with_writer(file).with_ansi(false));
                    tracing::subscriber::set_global_default(subscriber)?;
                }
            }
        }
        (None, LogFormat::Json) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stderr));
            tracing::subscriber::set_global_default(subscriber)?;
        }
        (None, LogFormat::Pretty) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr));
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    let _ = LOGGING_INITIALIZED.set(true);
    Ok(())
}
