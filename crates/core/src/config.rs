//! Runtime configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name of the task service every context creates.
pub const DEFAULT_SERVICE_NAME: &str = "default";

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Workers kept alive while idle
    pub core_threads: usize,
    /// Upper bound on workers under load
    pub max_threads: usize,
    /// Idle time after which a non-core worker retires (milliseconds)
    pub keep_alive_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_threads: 3,
            max_threads: 10,
            keep_alive_ms: 1000,
        }
    }
}

impl PoolConfig {
    /// Create the default pool configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of core workers.
    pub fn with_core_threads(mut self, n: usize) -> Self {
        self.core_threads = n;
        self
    }

    /// Set the maximum number of workers.
    pub fn with_max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    /// Set the idle timeout for non-core workers.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive_ms = keep_alive.as_millis() as u64;
        self
    }

    /// Idle timeout as a duration.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Reject sizes a pool cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core_threads == 0 {
            return Err(ConfigError::Invalid("core_threads must be at least 1".to_string()));
        }
        if self.max_threads < self.core_threads {
            return Err(ConfigError::Invalid(format!(
                "max_threads ({}) must be >= core_threads ({})",
                self.max_threads, self.core_threads
            )));
        }
        Ok(())
    }
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Pool used by every service the context creates
    pub pool: PoolConfig,
    /// Delay before a blocked UI shows its busy indicator (milliseconds)
    pub busy_indicator_delay_ms: u64,
    /// Name of the implicit service
    pub default_service: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            busy_indicator_delay_ms: 250,
            default_service: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl AppConfig {
    /// Parse and validate JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Busy indicator delay as a duration.
    pub fn busy_indicator_delay(&self) -> Duration {
        Duration::from_millis(self.busy_indicator_delay_ms)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        if self.default_service.trim().is_empty() {
            return Err(ConfigError::Invalid("default_service must not be empty".to_string()));
        }
        Ok(())
    }
}
