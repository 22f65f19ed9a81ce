//! Configuration management for the data store
//!
//! This module provides environment and file based configuration with
//! support for defaults and validation.

use crate::logging::LogLevel;
use crate::store::atomic_file::write_atomic;
use crate::store::subscription::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Registry-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataStoreConfig {
    /// Directory holding one file per store
    pub data_dir: PathBuf,

    /// Capacity of each subscriber's buffer
    pub subscriber_buffer: usize,

    /// What happens when a subscriber's buffer is full
    pub overflow_policy: OverflowPolicy,

    /// How long teardown waits for each store's in-flight commit
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./datastore"),
            subscriber_buffer: 16,
            overflow_policy: OverflowPolicy::DropOldest,
            close_timeout: Duration::from_secs(5),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl DataStoreConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: DATASTORE_<KEY>
    /// Example: DATASTORE_DATA_DIR=/var/lib/app/datastore
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(data_dir) = env::var("DATASTORE_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(buffer) = env::var("DATASTORE_SUBSCRIBER_BUFFER") {
            config.subscriber_buffer = buffer
                .parse()
                .map_err(|e| invalid("DATASTORE_SUBSCRIBER_BUFFER", e))?;
        }
        if let Ok(policy) = env::var("DATASTORE_OVERFLOW_POLICY") {
            config.overflow_policy = policy
                .parse()
                .map_err(|e| invalid("DATASTORE_OVERFLOW_POLICY", e))?;
        }
        if let Ok(timeout) = env::var("DATASTORE_CLOSE_TIMEOUT") {
            config.close_timeout = humantime_serde::re::humantime::parse_duration(&timeout)
                .map_err(|e| invalid("DATASTORE_CLOSE_TIMEOUT", e))?;
        }

        // Logging config
        if let Ok(level) = env::var("DATASTORE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(json) = env::var("DATASTORE_LOG_JSON") {
            config.logging.json_format = json
                .parse()
                .map_err(|e| invalid("DATASTORE_LOG_JSON", e))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriber_buffer == 0 {
            return Err(ConfigError::ValidationFailed(
                "subscriber_buffer must be greater than 0".to_string(),
            ));
        }

        if self.close_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "close_timeout must be greater than 0".to_string(),
            ));
        }

        self.logging
            .level
            .parse::<LogLevel>()
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;

        write_atomic(path, contents.as_bytes()).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn invalid(var: &'static str, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        reason: err.to_string(),
    }
}
