//! # Holdfast Utilities
//!
//! Shared utilities, logging and configuration for Holdfast.
//!
//! This crate provides common functionality used across the Holdfast
//! workspace: `tracing` initialisation for the binary and the TOML
//! configuration that sizes the agent and lays out the emulated target.

pub mod config;
pub mod logging;

pub use config::{ConfigError, HoldfastConfig, RegionConfig};
// Re-export commonly used logging functions for convenience
pub use logging::{
    init_logging, init_logging_from, init_logging_to_stderr, init_logging_with_level, ConsoleStream, LogFormat,
    LogLevel, LoggingError, LoggingGuard, LoggingSettings,
};
pub use tracing::{debug, error, info, trace, warn};
