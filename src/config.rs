//! Configuration management for Bulwark.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BulwarkError, Result};
use crate::ratelimit::{RateConfig, StoreFailureMode, DEFAULT_KEY_PREFIX};
use crate::store::RedisStoreConfig;

/// Prefix for environment overrides, e.g. `BULWARK_LIMITER__STORE_TIMEOUT_MS`.
pub const ENV_PREFIX: &str = "BULWARK";

/// Main configuration for Bulwark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// Limiter configuration
    pub limiter: LimiterConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Behaviour when the counter store is unreachable. Required.
    pub on_store_failure: StoreFailureMode,

    /// Upper bound for one counter store round trip, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Namespace for counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Rate for enabled operations that do not declare one
    #[serde(default)]
    pub default_rate: Option<RateConfig>,

    /// Request attribute holding the requester identity (e.g. `x-api-key`)
    #[serde(default)]
    pub identity_attribute: Option<String>,

    /// Path to the operation rules file
    #[serde(default)]
    pub rules_path: Option<String>,
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Counter store selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Counts kept in this process
    Memory {
        /// How often expired counters are purged; 0 disables purging
        #[serde(default = "default_sweep_interval")]
        sweep_interval_secs: u64,
    },
    /// Counts kept in Redis, shared by all instances
    Redis(RedisStoreConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

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

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl BulwarkConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| BulwarkError::Config(e.to_string()))
    }

    /// Load layered configuration: the optional file first (format taken
    /// from its extension), then `BULWARK_*` environment variables, with
    /// `__` separating nested keys: `BULWARK_LIMITER__STORE_TIMEOUT_MS`
    /// overrides `limiter.store_timeout_ms`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
