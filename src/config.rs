//! Bus configuration.
//!
//! Supports YAML files and environment variable overrides:
//!
//! ```yaml
//! bus:
//!   stream_count: 4
//!   topic_max_size: 1000
//!   max_queue_length: 1000
//!   max_concurrent_deliveries: 64
//!   max_batch_size: 100
//!   reconnect:
//!     - { delay_ms: 0, attempts: 3 }
//!     - { delay_ms: 1000, attempts: 5 }
//! adapter:
//!   type: redis
//!   redis:
//!     url: redis://localhost:6379
//!     key_prefix: scaleout
//! ```

use serde::Deserialize;

use crate::adapter::AdapterConfig;
use crate::utils::retry::BackoffSchedule;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SCALEOUT_CONFIG";
/// Prefix for configuration environment variables (`SCALEOUT__BUS__STREAM_COUNT`).
pub const CONFIG_ENV_PREFIX: &str = "SCALEOUT";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SCALEOUT_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bus sizing and retry behaviour.
    pub bus: BusConfig,
    /// Backing store selection.
    pub adapter: AdapterConfig,
}

/// Bus sizing and retry behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Number of streams (N). Every process sharing a backing store must use
    /// the same value.
    pub stream_count: usize,
    /// Batches retained per key for replay.
    pub topic_max_size: usize,
    /// Sends a stream queues while connecting or buffering.
    pub max_queue_length: usize,
    /// Handlers allowed to run at once across the bus.
    pub max_concurrent_deliveries: usize,
    /// Default cap on batches per delivery.
    pub max_batch_size: usize,
    /// Reconnect schedule for every stream.
    pub reconnect: BackoffSchedule,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            stream_count: 4,
            topic_max_size: 1000,
            max_queue_length: 1000,
            max_concurrent_deliveries: 64,
            max_batch_size: 100,
            reconnect: BackoffSchedule::default(),
        }
    }
}

impl BusConfig {
    /// Reject settings the bus cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("stream_count", self.stream_count),
            ("topic_max_size", self.topic_max_size),
            ("max_queue_length", self.max_queue_length),
            ("max_concurrent_deliveries", self.max_concurrent_deliveries),
            ("max_batch_size", self.max_batch_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("bus.{name} must be at least 1")));
            }
        }
        if self.reconnect.is_empty() {
            return Err(ConfigError::Invalid(
                "bus.reconnect must allow at least one attempt".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.bus.validate()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
