//! Tracing setup for Undertow
//!
//! Console output follows the chosen level (or `RUST_LOG`); every run also
//! writes a trace-level log file so scheduling decisions can be replayed
//! after the fact.

use std::fs::{File, create_dir_all};
use std::io;
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the per-run log file, overwritten on every start.
pub const LOG_FILE_NAME: &str = "undertow-last-run.log";

/// Errors installing the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Cannot create logs directory {path}: {source}")]
    LogsDirectory { path: PathBuf, source: io::Error },

    #[error("Cannot open log file {path}: {source}")]
    LogFile { path: PathBuf, source: io::Error },

    #[error("Tracing subscriber already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),

    #[error("Invalid log level: {value}")]
    InvalidLevel { value: String },
}

/// Installs the console and file layers.
///
/// Returns the path of the log file written for this run.
///
/// # Errors
///
/// - `TracingError::LogsDirectory` - `logs_dir` cannot be created
/// - `TracingError::LogFile` - The log file cannot be opened for writing
/// - `TracingError::AlreadyInstalled` - A global subscriber is already set
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> Result<PathBuf, TracingError> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_path).map_err(|source| TracingError::LogsDirectory {
        path: logs_path.to_path_buf(),
        source,
    })?;

    let log_file_path = logs_path.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path).map_err(|source| TracingError::LogFile {
        path: log_file_path.clone(),
        source,
    })?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Tracing initialized: console={}, log_file={}",
        console_level,
        log_file_path.display()
    );

    Ok(log_file_path)
}

/// Console verbosity selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl CliLogLevel {
    const ALL: [(CliLogLevel, &'static str, Level); 5] = [
        (CliLogLevel::Error, "error", Level::ERROR),
        (CliLogLevel::Warn, "warn", Level::WARN),
        (CliLogLevel::Info, "info", Level::INFO),
        (CliLogLevel::Debug, "debug", Level::DEBUG),
        (CliLogLevel::Trace, "trace", Level::TRACE),
    ];

    fn entry(self) -> (CliLogLevel, &'static str, Level) {
        Self::ALL
            .into_iter()
            .find(|(level, _, _)| *level == self)
            .unwrap_or(Self::ALL[2])
    }

    pub fn as_tracing_level(self) -> Level {
        self.entry().2
    }

    pub fn as_str(self) -> &'static str {
        self.entry().1
    }
}

impl std::str::FromStr for CliLogLevel {
    type Err = TracingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|(_, name, _)| *name == wanted)
            .map(|(level, _, _)| level)
            .ok_or_else(|| TracingError::InvalidLevel {
                value: s.to_string(),
            })
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
