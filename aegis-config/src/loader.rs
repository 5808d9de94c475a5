//! Configuration loading and environment variable handling

use log::debug;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::domains::logging::{LogLevel, LoggingConfig};
use crate::domains::resilience::ResilienceConfig;
use crate::domains::{cache::CacheConfig, AegisConfig};
use crate::error::{ConfigError, ConfigResult};

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with the `AEGIS` prefix
    pub fn new() -> Self {
        Self {
            prefix: "AEGIS".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<AegisConfig> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        self.from_yaml_str(&content)
    }

    /// Load configuration from YAML text with environment overrides
    pub fn from_yaml_str(&self, yaml: &str) -> ConfigResult<AegisConfig> {
        let mut config: AegisConfig = serde_yaml::from_str(yaml)?;
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<AegisConfig> {
        let mut config = AegisConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load from `config_path` if given, otherwise from the environment
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<AegisConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    fn apply_env_overrides(&self, config: &mut AegisConfig) -> ConfigResult<()> {
        self.apply_resilience_overrides(&mut config.resilience)?;
        self.apply_cache_overrides(&mut config.cache)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    fn apply_resilience_overrides(&self, config: &mut ResilienceConfig) -> ConfigResult<()> {
        if let Some(max_attempts) = self.parse_env_var("RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = max_attempts;
        }

        if let Some(base_delay) = self.env_millis("RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = base_delay;
        }

        if let Some(threshold) = self.parse_env_var("CIRCUIT_FAILURE_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = threshold;
        }

        if let Some(reset_timeout) = self.env_millis("CIRCUIT_RESET_TIMEOUT_MS")? {
            config.circuit_breaker.reset_timeout = reset_timeout;
        }

        if let Some(timeout) = self.env_millis("TIMEOUT_MS")? {
            config.timeout.get_or_insert_with(Default::default).timeout = timeout;
        }

        Ok(())
    }

    fn apply_cache_overrides(&self, config: &mut CacheConfig) -> ConfigResult<()> {
        if let Some(max_size) = self.parse_env_var("CACHE_MAX_SIZE")? {
            config.max_size = max_size;
        }

        if let Some(default_ttl) = self.env_millis("CACHE_DEFAULT_TTL_MS")? {
            config.default_ttl = default_ttl;
        }

        Ok(())
    }

    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        Ok(())
    }

    fn env_millis(&self, name: &str) -> ConfigResult<Option<Duration>> {
        Ok(self.parse_env_var::<u64>(name)?.map(Duration::from_millis))
    }

    fn parse_env_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| {
                    ConfigError::EnvError(format!("Invalid {}_{}: {}", self.prefix, name, e))
                }),
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
