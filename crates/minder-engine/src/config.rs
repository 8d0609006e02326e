//! Engine configuration parsing.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service::CacheTtl;

/// Errors raised loading or validating configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The parsed values are out of range.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Property cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Topic router settings.
    #[serde(default)]
    pub router: RouterConfig,
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.router.queue_depth == 0 {
            return Err(ConfigError::Validation(
                "router.queue_depth must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Property cache settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cached property rows older than this are refetched. Negative
    /// values disable the cache entirely.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
}

impl CacheConfig {
    /// The configured TTL as the service expects it.
    #[must_use]
    pub fn ttl(&self) -> CacheTtl {
        CacheTtl::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

/// Topic router settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Per-subscriber queue depth.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Block each publish until every subscriber acknowledged. Slower,
    /// deterministic; meant for tests and small deployments.
    #[serde(default)]
    pub wait_for_ack: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            wait_for_ack: false,
        }
    }
}

const fn default_ttl_secs() -> i64 {
    300
}

const fn default_queue_depth() -> usize {
    64
}
