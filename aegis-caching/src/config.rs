//! Cache configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{CacheError, CacheResult};

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied by `set` when no explicit TTL is given
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Maximum number of entries held at once
    pub max_size: usize,

    /// Interval of the background expiry sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Side-store mirroring
    pub persistence: PersistenceConfig,
}

/// Persistence configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Mirror the cache to a file side store
    pub enabled: bool,

    /// File the cache is mirrored to
    pub path: Option<PathBuf>,

    /// Format version tag; payloads with another tag are discarded
    pub format_version: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_size: 1000,
            sweep_interval: Duration::from_secs(60),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            format_version: 1,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with the given TTL and capacity
    pub fn new(default_ttl: Duration, max_size: usize) -> Self {
        Self {
            default_ttl,
            max_size,
            ..Self::default()
        }
    }

    /// Small, short-lived cache for local development
    pub fn development() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            max_size: 100,
            sweep_interval: Duration::from_secs(10),
            persistence: PersistenceConfig::default(),
        }
    }

    /// Larger cache with a longer TTL
    pub fn production() -> Self {
        Self {
            default_ttl: Duration::from_secs(900),
            max_size: 10_000,
            sweep_interval: Duration::from_secs(60),
            persistence: PersistenceConfig::default(),
        }
    }

    /// Check the configuration for values the store cannot work with
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_size == 0 {
            return Err(CacheError::InvalidConfiguration(
                "max_size must be greater than 0".to_string(),
            ));
        }

        if self.default_ttl.is_zero() {
            return Err(CacheError::InvalidConfiguration(
                "default_ttl must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(CacheError::InvalidConfiguration(
                "sweep_interval must be greater than 0".to_string(),
            ));
        }

        if self.persistence.enabled && self.persistence.path.is_none() {
            return Err(CacheError::InvalidConfiguration(
                "persistence.path is required when persistence is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl, Duration::from_millis(300_000));
        assert_eq!(config.max_size, 1000);
        assert!(!config.persistence.enabled);
        assert_eq!(config.persistence.format_version, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = CacheConfig::default();
        config.max_size = 0;
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidConfiguration(_))
        ));

        let mut config = CacheConfig::default();
        config.persistence.enabled = true;
        assert!(config.validate().is_err());

        config.persistence.path = Some(PathBuf::from("/tmp/aegis-cache.json"));
        assert!(config.validate().is_ok());
    }
}
