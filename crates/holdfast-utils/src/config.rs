//! # Configuration
//!
//! TOML configuration for the agent and the emulated target.
//!
//! Every field has a default, so an empty file (or no file at all) is a valid
//! configuration:
//!
//! ```toml
//! [freeze]
//! interval_ms = 50
//!
//! [scan]
//! excluded_regions = ["dyld_shared_cache", "[vvar]", "[vsyscall]", "[vdso]"]
//! string_max_length = 256
//! default_page_size = 100
//!
//! [target]
//! architecture = "host"
//! breakpoint_slots = 4
//! watchpoint_slots = 4
//!
//! [[target.regions]]
//! base = 0x10000
//! size = 0x4000
//! protection = "rw-"
//! ```
//!
//! ## Environment overrides
//!
//! - `HOLDFAST_FREEZE_INTERVAL_MS`: freeze loop period
//! - `HOLDFAST_STRING_MAX_LENGTH`: bytes read per string candidate
//!
//! Values are validated after overrides are applied.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "holdfast.toml";
/// Environment override for [`FreezeConfig::interval_ms`].
pub const FREEZE_INTERVAL_ENV: &str = "HOLDFAST_FREEZE_INTERVAL_MS";
/// Environment override for [`ScanConfig::string_max_length`].
pub const STRING_MAX_LENGTH_ENV: &str = "HOLDFAST_STRING_MAX_LENGTH";

/// Architectures accepted by `target.architecture`.
pub const ARCHITECTURES: [&str; 3] = ["host", "arm64", "x86_64"];

/// Complete agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HoldfastConfig
{
    /// Freeze loop settings
    pub freeze: FreezeConfig,
    /// Scan engine settings
    pub scan: ScanConfig,
    /// Emulated target layout
    pub target: TargetConfig,
}

/// `[freeze]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FreezeConfig
{
    /// Period of the freeze loop in milliseconds
    pub interval_ms: u64,
}

impl Default for FreezeConfig
{
    fn default() -> Self
    {
        Self { interval_ms: 50 }
    }
}

impl FreezeConfig
{
    /// The period as a [`Duration`].
    #[must_use]
    pub fn interval(&self) -> Duration
    {
        Duration::from_millis(self.interval_ms)
    }
}

/// `[scan]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig
{
    /// Ranges whose backing file contains any of these are never scanned
    pub excluded_regions: Vec<String>,
    /// Bytes read per candidate in string scans
    pub string_max_length: usize,
    /// Page size for `getScanResults` when the operator gives none
    pub default_page_size: usize,
}

impl Default for ScanConfig
{
    fn default() -> Self
    {
        Self {
            excluded_regions: ["dyld_shared_cache", "[vvar]", "[vsyscall]", "[vdso]"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            string_max_length: 256,
            default_page_size: 100,
        }
    }
}

/// `[target]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig
{
    /// `host`, `arm64` or `x86_64`
    pub architecture: String,
    /// Execution breakpoint slots
    pub breakpoint_slots: usize,
    /// Data watchpoint slots
    pub watchpoint_slots: usize,
    /// Mapped regions; empty means the built-in layout
    pub regions: Vec<RegionConfig>,
}

impl Default for TargetConfig
{
    fn default() -> Self
    {
        Self {
            architecture: "host".to_string(),
            breakpoint_slots: 4,
            watchpoint_slots: 4,
            regions: Vec::new(),
        }
    }
}

/// `[[target.regions]]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionConfig
{
    /// First address
    pub base: u64,
    /// Length in bytes
    pub size: u64,
    /// Protection as `rwx` flags, e.g. `"rw-"`
    #[serde(default = "default_protection")]
    pub protection: String,
    /// Backing file, for file-backed mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_protection() -> String
{
    "rw-".to_string()
}

impl HoldfastConfig
{
    /// Parse and validate a TOML document.
    ///
    /// ## Errors
    ///
    /// - [`ConfigError::Parse`]: malformed TOML or unknown keys
    /// - [`ConfigError::Invalid`]: a value fails validation
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError>
    {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate `path`.
    ///
    /// ## Errors
    ///
    /// - [`ConfigError::Read`]: the file could not be read
    /// - [`ConfigError::Parse`] / [`ConfigError::Invalid`]: see [`HoldfastConfig::from_toml_str`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError>
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load `path`, or `holdfast.toml` if it exists, or the defaults; then apply
    /// environment overrides.
    ///
    /// ## Errors
    ///
    /// See [`HoldfastConfig::load`] and [`HoldfastConfig::apply_env`].
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError>
    {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => Self::load(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `HOLDFAST_*` environment overrides and re-validate.
    ///
    /// ## Errors
    ///
    /// - [`ConfigError::Env`]: an override is not a number
    /// - [`ConfigError::Invalid`]: the overridden configuration fails validation
    pub fn apply_env(&mut self) -> Result<(), ConfigError>
    {
        self.apply_overrides(|name| env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError>
    {
        if let Some(value) = lookup(FREEZE_INTERVAL_ENV) {
            self.freeze.interval_ms = parse_override(FREEZE_INTERVAL_ENV, &value)?;
        }
        if let Some(value) = lookup(STRING_MAX_LENGTH_ENV) {
            self.scan.string_max_length = parse_override(STRING_MAX_LENGTH_ENV, &value)?;
        }
        self.validate()
    }

    /// Check every value.
    ///
    /// ## Errors
    ///
    /// - [`ConfigError::Invalid`]: names the first offending key
    pub fn validate(&self) -> Result<(), ConfigError>
    {
        if self.freeze.interval_ms == 0 {
            return Err(ConfigError::Invalid("freeze.interval_ms must be positive".into()));
        }
        if self.scan.default_page_size == 0 {
            return Err(ConfigError::Invalid("scan.default_page_size must be positive".into()));
        }
        if self.scan.string_max_length == 0 {
            return Err(ConfigError::Invalid("scan.string_max_length must be positive".into()));
        }
        if !ARCHITECTURES.contains(&self.target.architecture.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "target.architecture '{}' is not one of {}",
                self.target.architecture,
                ARCHITECTURES.join(", ")
            )));
        }

        let mut spans: Vec<(u64, u64)> = Vec::with_capacity(self.target.regions.len());
        for region in &self.target.regions {
            if region.size == 0 {
                return Err(ConfigError::Invalid(format!("region at {:#x} has zero size", region.base)));
            }
            if !is_protection(&region.protection) {
                return Err(ConfigError::Invalid(format!(
                    "region at {:#x} has malformed protection '{}' (expected e.g. 'rw-')",
                    region.base, region.protection
                )));
            }
            let end = region.base.checked_add(region.size).ok_or_else(|| {
                ConfigError::Invalid(format!("region at {:#x} wraps the address space", region.base))
            })?;
            if let Some((base, _)) = spans.iter().find(|(base, other_end)| region.base < *other_end && *base < end) {
                return Err(ConfigError::Invalid(format!(
                    "region at {:#x} overlaps region at {base:#x}",
                    region.base
                )));
            }
            spans.push((region.base, end));
        }
        Ok(())
    }

    /// Render as TOML.
    ///
    /// ## Errors
    ///
    /// - [`ConfigError::Serialize`]: a value cannot be represented in TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError>
    {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn is_protection(text: &str) -> bool
{
    let flags = text.as_bytes();
    flags.len() == 3
        && matches!(flags[0], b'r' | b'-')
        && matches!(flags[1], b'w' | b'-')
        && matches!(flags[2], b'x' | b'-')
}

fn parse_override<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError>
{
    value.trim().parse().map_err(|_| ConfigError::Env {
        name,
        value: value.to_string(),
    })
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError
{
    /// The configuration file could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Read
    {
        /// File that failed
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("Invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration cannot be rendered
    #[error("Failed to render configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// An environment override is malformed
    #[error("Invalid value '{value}' for {name}")]
    Env
    {
        /// Variable name
        name: &'static str,
        /// Offending value
        value: String,
    },
}
