//! Configuration management for Slotwarden.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SlotwardenError};
use crate::ratelimit::RatePolicy;

/// Prefix for environment overrides, e.g. `SLOTWARDEN__GOVERNOR__LOCK_TIMEOUT_MS`.
const ENV_PREFIX: &str = "SLOTWARDEN";

/// Main configuration for Slotwarden.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotwardenConfig {
    /// Rate limit governor configuration
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Governor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Maximum wait for the per-key lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// How long a held lock survives before it is considered abandoned
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,

    /// Policy for operations without their own rule
    #[serde(default)]
    pub default_policy: RatePolicy,

    /// Path to per-operation policy rules
    pub policies_path: Option<String>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_lease_ms: default_lock_lease_ms(),
            default_policy: RatePolicy::default(),
            policies_path: None,
        }
    }
}

impl GovernorConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_lock_lease_ms() -> u64 {
    10000
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SlotwardenConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SlotwardenConfig =
            serde_yaml::from_str(yaml).map_err(|e| SlotwardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: SlotwardenConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SlotwardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.governor
            .default_policy
            .validate()
            .map_err(|e| SlotwardenError::Config(format!("default_policy: {}", e)))
    }
}
