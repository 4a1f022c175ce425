//! Configuration for the connwatch consumer
//!
//! Sources, lowest to highest precedence:
//! - built-in defaults
//! - TOML file (`--config` / `CONNWATCH_CONFIG`)
//! - command line flags and their environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// How decoded records are written to stdout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One human-readable line per connection
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Complete consumer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// env_logger filter used when RUST_LOG is unset
    pub log_level: String,

    /// Perf buffer settings
    pub transport: TransportSettings,

    /// Drain loop settings
    pub consumer: ConsumerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            transport: TransportSettings::default(),
            consumer: ConsumerSettings::default(),
        }
    }
}

/// Perf buffer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Pages per CPU ring; must be a power of two
    pub pages: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self { pages: 64 }
    }
}

/// Drain loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Sleep between polls of the per-CPU buffers
    pub poll_interval_ms: u64,

    /// Output format
    pub format: OutputFormat,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            format: OutputFormat::Text,
        }
    }
}

/// Values taken from the command line; `None` keeps the file/default value
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub log_level: Option<String>,
    pub pages: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub format: Option<OutputFormat>,
}

impl Config {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load from `path` if given, otherwise start from defaults; then apply
    /// overrides and validate.
    pub fn resolve(path: Option<&Path>, overrides: Overrides) -> ConfigResult<Self> {
        let base = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        let config = base.with_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(log_level) = overrides.log_level {
            self.log_level = log_level;
        }
        if let Some(pages) = overrides.pages {
            self.transport.pages = pages;
        }
        if let Some(poll_interval_ms) = overrides.poll_interval_ms {
            self.consumer.poll_interval_ms = poll_interval_ms;
        }
        if let Some(format) = overrides.format {
            self.consumer.format = format;
        }
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let pages = self.transport.pages;
        if pages == 0 || !pages.is_power_of_two() {
            return Err(ConfigError::ValidationError(format!(
                "transport.pages must be a non-zero power of two, got {pages}"
            )));
        }
        if self.consumer.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "consumer.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        validate_log_filter(&self.log_level)?;
        Ok(())
    }
}

/// Check an env_logger filter: comma-separated `level` or `module=level`
/// directives, optionally followed by `/regex`. A bare word that is not a
/// level would be taken as a module name and silence everything else, so it
/// is rejected.
fn validate_log_filter(filter: &str) -> ConfigResult<()> {
    let directives = filter.split('/').next().unwrap_or_default();
    if directives.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "log_level must not be empty".to_string(),
        ));
    }
    for directive in directives.split(',').map(str::trim) {
        if directive.is_empty() {
            continue;
        }
        let level = match directive.split_once('=') {
            Some((module, level)) if !module.trim().is_empty() => level.trim(),
            Some(_) => {
                return Err(ConfigError::ValidationError(format!(
                    "log_level directive {directive:?} has no module name"
                )));
            }
            None => directive,
        };
        if level.parse::<log::LevelFilter>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "unknown log level {level:?} in log_level {filter:?}"
            )));
        }
    }
    Ok(())
}
