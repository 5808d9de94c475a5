//! Domain-specific configuration modules

pub mod cache;
pub mod logging;
pub mod resilience;

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::Validatable;

/// Main Aegis configuration combining all domains
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AegisConfig {
    /// Retry, circuit breaker, rate limit and timeout layers
    pub resilience: resilience::ResilienceConfig,

    /// Response cache
    pub cache: cache::CacheConfig,

    /// Logging
    pub logging: logging::LoggingConfig,
}

impl AegisConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.resilience.validate()?;
        Validatable::validate(&self.cache)?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = AegisConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
