//! # Logging Utilities
//!
//! Logging for stackcrawl binaries using `tracing`.
//!
//! Events go to stderr so command output on stdout stays clean, optionally
//! mirrored to a file. Both sinks share one filter.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stackcrawl_utils::init_logging;
//!
//! init_logging().expect("Failed to initialize logging");
//! tracing::info!("walker ready");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Filter directives (e.g., `RUST_LOG=debug`, `RUST_LOG=stackcrawl_core=trace`)
//! - `STACKCRAWL_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
//! - `STACKCRAWL_LOG_FILE`: Optional log file. A directory gets a dated file
//!   (`YYYY-MM-DD-stackcrawl.log`); a file path rolls daily.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const FORMAT_VAR: &str = "STACKCRAWL_LOG_FORMAT";
const FILE_VAR: &str = "STACKCRAWL_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default for development)
    #[default]
    Pretty,
    /// JSON format (default for production)
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level
    Debug,
    /// Trace level (per-frame cache traffic)
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Where and how to log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogSettings
{
    /// Output format for every sink.
    pub format: LogFormat,
    /// Fixed level; `None` defers to `RUST_LOG`, then INFO.
    pub level: Option<LogLevel>,
    /// Optional file sink.
    pub file: Option<PathBuf>,
}

impl LogSettings
{
    /// Read settings from the process environment.
    ///
    /// ## Errors
    ///
    /// Returns [`LoggingError::InvalidFormat`] if `STACKCRAWL_LOG_FORMAT`
    /// is set to something unknown.
    pub fn from_env() -> Result<Self, LoggingError>
    {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read settings through `lookup` instead of the process environment.
    ///
    /// ## Errors
    ///
    /// Same as [`LogSettings::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LoggingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let format = match lookup(FORMAT_VAR) {
            Some(value) => value.parse()?,
            None => LogFormat::Pretty,
        };
        let file = lookup(FILE_VAR).filter(|path| !path.is_empty()).map(PathBuf::from);

        Ok(Self {
            format,
            level: None,
            file,
        })
    }

    fn filter(&self) -> EnvFilter
    {
        // Priority: explicit level, then RUST_LOG, then INFO.
        if let Some(level) = self.level {
            EnvFilter::new(Level::from(level).to_string())
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
        }
    }
}

/// Initialize logging with settings from the environment
///
/// ## Example
///
/// ```rust,no_run
/// use stackcrawl_utils::init_logging;
///
/// init_logging().expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if:
/// - Logging is already initialized
/// - `STACKCRAWL_LOG_FORMAT` is invalid
/// - The log file directory cannot be created
pub fn init_logging() -> Result<(), LoggingError>
{
    init_with(&LogSettings::from_env()?)
}

/// Initialize logging with explicit level and format
///
/// The file sink still comes from `STACKCRAWL_LOG_FILE`.
///
/// ## Example
///
/// ```rust,no_run
/// use stackcrawl_utils::{LogFormat, LogLevel, init_logging_with_level};
///
/// init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file logging fails.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<(), LoggingError>
{
    let settings = LogSettings {
        format,
        level: Some(level),
        file: env::var(FILE_VAR).ok().filter(|path| !path.is_empty()).map(PathBuf::from),
    };
    init_with(&settings)
}

/// Install a subscriber built from `settings`.
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file logging fails.
pub fn init_with(settings: &LogSettings) -> Result<(), LoggingError>
{
    let filter = settings.filter();
    let mut layers = vec![console_layer(settings.format, filter.clone())];
    if let Some(path) = &settings.file {
        layers.push(file_layer(path, settings.format, filter)?);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stderr);

    match format {
        LogFormat::Pretty => layer.with_ansi(true).with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn file_layer(path: &Path, format: LogFormat, filter: EnvFilter) -> Result<BoxedLayer, LoggingError>
{
    let appender = if path.is_dir() {
        // The date is already in the name; never roll.
        let file = dated_log_file(path);
        tracing_appender::rolling::never(path, file.file_name().unwrap_or_default())
    } else {
        let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir).map_err(LoggingError::FileError)?;
        tracing_appender::rolling::daily(dir, path.file_name().unwrap_or_default())
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);

    // The writer thread must outlive the subscriber, which lives for the process.
    std::mem::forget(guard);

    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false); // No ANSI in files

    Ok(match format {
        LogFormat::Pretty => layer.with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    })
}

/// `dir/YYYY-MM-DD-stackcrawl.log` for today (UTC).
pub fn dated_log_file(dir: &Path) -> PathBuf
{
    let today = Utc::now().format("%Y-%m-%d");
    dir.join(format!("{today}-stackcrawl.log"))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
    InvalidLevel(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
