//! Sync configuration
//!
//! `SyncConfig` is built either in code through [`SyncConfigBuilder`] or
//! loaded from a TOML file. Environment variables override file values:
//!
//! - `RELIEFSYNC_SERVER_URL` - base URL of the REST backend
//! - `RELIEFSYNC_DATA_DIR` - directory holding the local databases
//!
//! ```toml
//! server_url = "https://relief.example.org/api"
//! cache_ttl_secs = 300
//! default_max_retries = 3
//! sync_interval_secs = 60
//!
//! [backoff]
//! strategy = "exponential"
//! base_ms = 1000
//! max_ms = 300000
//!
//! [[priorities]]
//! entity_type = "needs"
//! priority = 10
//! max_bytes_per_cycle = 1048576
//! min_interval_ms = 0
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::shared::model::SyncPriorityEntry;

/// Default server URL
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";

/// Environment variable overriding `server_url`
pub const ENV_SERVER_URL: &str = "RELIEFSYNC_SERVER_URL";

/// Environment variable overriding `data_dir`
pub const ENV_DATA_DIR: &str = "RELIEFSYNC_DATA_DIR";

/// Retry backoff between sync cycles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Retry on the next cycle
    #[default]
    Immediate,
    /// Fixed delay between attempts
    Fixed {
        /// Delay in milliseconds
        interval_ms: u64,
    },
    /// Doubling delay, capped
    Exponential {
        /// First delay in milliseconds
        base_ms: u64,
        /// Upper bound in milliseconds
        max_ms: u64,
    },
}

/// Sync subsystem configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the REST backend
    pub server_url: String,
    /// Per-request network timeout
    pub request_timeout_ms: u64,
    /// Lifetime of cached GET responses
    pub cache_ttl_secs: u64,
    /// Delivery attempts before a queued write is dropped
    pub default_max_retries: u32,
    /// Directory holding the local databases
    pub data_dir: Option<PathBuf>,
    /// Periodic sync trigger; disabled when unset
    pub sync_interval_secs: Option<u64>,
    /// Let the planner skip low-priority types on slow links
    pub bandwidth_aware: bool,
    /// Path prefixes whose writes the mirror queue captures
    pub mirror_path_prefixes: Vec<String>,
    pub backoff: BackoffConfig,
    /// Priority overrides registered on top of the defaults
    pub priorities: Vec<SyncPriorityEntry>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            request_timeout_ms: 10_000,
            cache_ttl_secs: 300,
            default_max_retries: 3,
            data_dir: None,
            sync_interval_secs: None,
            bandwidth_aware: true,
            mirror_path_prefixes: vec!["/".to_string()],
            backoff: BackoffConfig::Immediate,
            priorities: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Create a new SyncConfigBuilder
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        let mut config: SyncConfig = toml::from_str(&source)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `RELIEFSYNC_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_SERVER_URL) {
            self.server_url = url;
        }
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(self.server_url.clone()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("request_timeout_ms", "must be greater than zero"));
        }
        if self.cache_ttl_secs == 0 {
            return Err(ConfigError::invalid("cache_ttl_secs", "must be greater than zero"));
        }
        if self.default_max_retries == 0 {
            return Err(ConfigError::invalid("default_max_retries", "must be at least 1"));
        }
        if self.sync_interval_secs == Some(0) {
            return Err(ConfigError::invalid("sync_interval_secs", "must be greater than zero"));
        }
        if let BackoffConfig::Exponential { base_ms, max_ms } = self.backoff {
            if base_ms == 0 || max_ms < base_ms {
                return Err(ConfigError::invalid("backoff", "require 0 < base_ms <= max_ms"));
            }
        }
        Ok(())
    }

    /// Get the full URL for an API endpoint
    pub fn api_url(&self, path: &str) -> String {
        let base = self.server_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_ttl_secs as i64)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval_secs.map(Duration::from_secs)
    }

    /// Directory holding the local databases
    ///
    /// Uses the system's data directory when available.
    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => {
                let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
                path.push("reliefsync");
                path
            }
        }
    }

    /// Path of the page-side store (outbox, cache, conflicts, local data)
    pub fn store_path(&self) -> PathBuf {
        self.data_dir().join("local.db")
    }

    /// Path of the mirror queue's own database
    pub fn mirror_path(&self) -> PathBuf {
        self.data_dir().join("mirror.db")
    }
}

/// Builder for SyncConfig
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    /// Set the server URL
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = url.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.cache_ttl_secs = secs;
        self
    }

    pub fn default_max_retries(mut self, retries: u32) -> Self {
        self.config.default_max_retries = retries;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    pub fn sync_interval_secs(mut self, secs: u64) -> Self {
        self.config.sync_interval_secs = Some(secs);
        self
    }

    pub fn bandwidth_aware(mut self, enabled: bool) -> Self {
        self.config.bandwidth_aware = enabled;
        self
    }

    pub fn mirror_path_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.config.mirror_path_prefixes = prefixes;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn priority(mut self, entry: SyncPriorityEntry) -> Self {
        self.config.priorities.push(entry);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<SyncConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid value for '{field}': {message}")]
    Invalid { field: &'static str, message: String },
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}
