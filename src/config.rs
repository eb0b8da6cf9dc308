use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::resilience::RetryConfig;

/// Top-level configuration for the relay. Every section has sensible
/// defaults; a config file only needs to name what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub max_workers: usize,
    pub error_history_limit: usize,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub health: HealthConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            error_history_limit: 1000,
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
        }
    }
}

impl RelayConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).await?;
        let config: RelayConfig = toml::from_str(&contents)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::config("max_workers must be at least 1"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::config("breaker.failure_threshold must be at least 1"));
        }
        if self.retry.exponential_base < 1.0 {
            return Err(Error::config("retry.exponential_base must be >= 1.0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::config("retry.base_delay_ms must not exceed retry.max_delay_ms"));
        }
        if self.cache.capacity == 0 {
            return Err(Error::config("cache.capacity must be at least 1"));
        }
        if self.health.check_interval_secs == 0 {
            return Err(Error::config("health.check_interval_secs must be at least 1"));
        }
        Ok(())
    }
}
