//! Configuration for the Flowline engine
//!
//! Defaults are overridden from `FLOWLINE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use tracing::{info, warn};

use crate::CoreError;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of pretty output
    #[serde(default)]
    pub json: bool,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Flows processed concurrently by the scheduler
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Reload-and-retry attempts after a checkpoint version conflict
    #[serde(default = "default_max_save_retries")]
    pub max_save_retries: u32,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_worker_pool_size() -> usize {
    16
}

fn default_max_save_retries() -> u32 {
    3
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            max_save_retries: default_max_save_retries(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, CoreError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(size) = lookup("FLOWLINE_WORKER_POOL_SIZE") {
            match size.parse::<usize>() {
                Ok(size) => config.worker_pool_size = size,
                Err(_) => warn!("Invalid FLOWLINE_WORKER_POOL_SIZE value: {}", size),
            }
        }

        if let Some(retries) = lookup("FLOWLINE_MAX_SAVE_RETRIES") {
            match retries.parse::<u32>() {
                Ok(retries) => config.max_save_retries = retries,
                Err(_) => warn!("Invalid FLOWLINE_MAX_SAVE_RETRIES value: {}", retries),
            }
        }

        if let Some(filter) = lookup("FLOWLINE_LOG_FILTER") {
            config.logging.filter = filter;
        }

        if let Some(json) = lookup("FLOWLINE_JSON_LOGS") {
            config.logging.json = json.to_lowercase() == "true" || json == "1";
        }

        if config.worker_pool_size == 0 {
            return Err(CoreError::ConfigurationError(
                "Worker pool size must be at least 1".to_string(),
            ));
        }

        info!(
            worker_pool_size = config.worker_pool_size,
            max_save_retries = config.max_save_retries,
            "Loaded engine configuration"
        );
        Ok(config)
    }
}
