//! # Logging Utilities
//!
//! Logging infrastructure for Holdfast using `tracing`.
//!
//! This module provides structured logging with support for:
//! - Pretty output for development and JSON output for collection
//! - Console output on stdout or stderr
//! - Optional file output, rolled daily
//! - Environment variable configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use holdfast_utils::init_logging;
//!
//! // Initialize with default settings (reads from RUST_LOG env var)
//! let _guard = init_logging().expect("Failed to initialize logging");
//!
//! tracing::info!("Agent started");
//! ```
//!
//! Keep the returned [`LoggingGuard`] alive for as long as you log: dropping it
//! flushes and stops the background file writer.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level filter (e.g., `RUST_LOG=debug`, `RUST_LOG=holdfast_core=trace`)
//! - `HOLDFAST_LOG_FORMAT`: Set output format (`json` or `pretty`, default: `pretty`)
//! - `HOLDFAST_LOG_FILE`: Optional log file. A directory gets a dated
//!   `YYYY-MM-DD-holdfast.log` inside it; a file path is rolled daily.
//!
//! ## Control channel mode
//!
//! `holdfast serve` speaks JSON lines on stdout, so it logs through
//! [`init_logging_to_stderr`] to keep the channel clean.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "HOLDFAST_LOG_FORMAT";
/// Environment variable selecting the log file.
pub const LOG_FILE_ENV: &str = "HOLDFAST_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default for development)
    Pretty,
    /// JSON format (for log collection)
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
            _ => Err(LoggingError::InvalidFormat(format!("{s} (use 'pretty' or 'json')"))),
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
    /// Trace level (most verbose)
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
            _ => Err(LoggingError::InvalidLevel(format!(
                "{s} (use 'error', 'warn', 'info', 'debug', or 'trace')"
            ))),
        }
    }
}

/// Where console output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream
{
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// Everything needed to build the subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings
{
    /// Output format
    pub format: LogFormat,
    /// Level used when `RUST_LOG` is unset or invalid
    pub level: Level,
    /// Console stream
    pub console: ConsoleStream,
    /// Optional file output
    pub file: Option<PathBuf>,
}

impl LoggingSettings
{
    /// Settings from `RUST_LOG`, `HOLDFAST_LOG_FORMAT` and `HOLDFAST_LOG_FILE`.
    #[must_use]
    pub fn from_env(console: ConsoleStream) -> Self
    {
        Self::from_lookup(console, |name| env::var(name).ok())
    }

    fn from_lookup(console: ConsoleStream, lookup: impl Fn(&str) -> Option<String>) -> Self
    {
        let format = lookup(LOG_FORMAT_ENV)
            .and_then(|s| LogFormat::from_str(&s).ok())
            .unwrap_or(LogFormat::Pretty);
        let level = lookup("RUST_LOG")
            .and_then(|s| s.parse::<LogLevel>().ok())
            .map_or(Level::INFO, Into::into);
        let file = lookup(LOG_FILE_ENV).filter(|s| !s.is_empty()).map(PathBuf::from);
        Self {
            format,
            level,
            console,
            file,
        }
    }
}

/// Keeps the background file writer alive.
///
/// Dropping the guard flushes pending file output.
#[derive(Debug)]
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard
{
    _file: Option<WorkerGuard>,
}

/// Initialize logging on stdout from the environment
///
/// Reads configuration from environment variables:
/// - `RUST_LOG`: Log level filter (e.g., `debug`, `holdfast_core=debug`)
/// - `HOLDFAST_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
/// - `HOLDFAST_LOG_FILE`: Optional path to log file
///
/// ## Errors
///
/// Returns an error if:
/// - Logging is already initialized
/// - The log file directory cannot be created
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    init_logging_from(LoggingSettings::from_env(ConsoleStream::Stdout))
}

/// Initialize logging on stderr from the environment
///
/// Same configuration as [`init_logging`]; use it when stdout carries data.
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file logging fails.
pub fn init_logging_to_stderr() -> Result<LoggingGuard, LoggingError>
{
    init_logging_from(LoggingSettings::from_env(ConsoleStream::Stderr))
}

/// Initialize logging with explicit level and format
///
/// ## Example
///
/// ```rust,no_run
/// use holdfast_utils::{ConsoleStream, LogFormat, LogLevel, init_logging_with_level};
///
/// let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Pretty, ConsoleStream::Stderr)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file logging fails.
pub fn init_logging_with_level(
    level: LogLevel,
    format: LogFormat,
    console: ConsoleStream,
) -> Result<LoggingGuard, LoggingError>
{
    let mut settings = LoggingSettings::from_env(console);
    settings.level = level.into();
    settings.format = format;
    init_logging_from(settings)
}

/// Initialize logging from explicit settings.
///
/// `RUST_LOG` still wins over `settings.level` when it holds a valid filter,
/// so module-specific directives like `holdfast_core=trace` keep working.
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file logging fails.
pub fn init_logging_from(settings: LoggingSettings) -> Result<LoggingGuard, LoggingError>
{
    let mut layers: Vec<BoxedLayer> = vec![console_layer(&settings)];
    let mut guard = None;

    if let Some(path) = &settings.file {
        let (layer, worker) = file_layer(&settings, path)?;
        layers.push(layer);
        guard = Some(worker);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;

    Ok(LoggingGuard { _file: guard })
}

fn env_filter(level: Level) -> EnvFilter
{
    // RUST_LOG can override the default level with more specific filters
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

fn console_layer(settings: &LoggingSettings) -> BoxedLayer
{
    let base = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());
    let filter = env_filter(settings.level);

    match (settings.format, settings.console) {
        (LogFormat::Pretty, ConsoleStream::Stdout) => base
            .with_ansi(true)
            .with_writer(io::stdout)
            .with_filter(filter)
            .boxed(),
        (LogFormat::Pretty, ConsoleStream::Stderr) => base
            .with_ansi(true)
            .with_writer(io::stderr)
            .with_filter(filter)
            .boxed(),
        (LogFormat::Json, ConsoleStream::Stdout) => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stdout)
            .with_filter(filter)
            .boxed(),
        (LogFormat::Json, ConsoleStream::Stderr) => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .with_filter(filter)
            .boxed(),
    }
}

fn file_layer(settings: &LoggingSettings, path: &Path) -> Result<(BoxedLayer, WorkerGuard), LoggingError>
{
    let appender = if path.is_dir() {
        // Date already in the name, so no rolling
        tracing_appender::rolling::never(path, dated_log_name(Utc::now()))
    } else {
        let directory = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(directory)?;
        tracing_appender::rolling::daily(directory, path.file_name().unwrap_or_default())
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let base = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());
    let filter = env_filter(settings.level);

    let layer = match settings.format {
        LogFormat::Pretty => base.with_ansi(false).with_filter(filter).boxed(),
        LogFormat::Json => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    };
    Ok((layer, guard))
}

/// `YYYY-MM-DD-holdfast.log` for the given day.
fn dated_log_name(now: chrono::DateTime<Utc>) -> String
{
    format!("{}-holdfast.log", now.format("%Y-%m-%d"))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
