//! Resilience configuration

use aegis_resilience::{
    CircuitBreakerConfig, RateLimitConfig, ResilientExecutor, RetryPolicy, RunOptions,
    TimeoutConfig,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::{
    validate_duration, validate_positive, validate_required_string, Validatable,
};

/// Layers applied around outbound calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Retry policy
    pub retry: RetryPolicy,

    /// Circuit breaker thresholds
    pub circuit_breaker: CircuitBreakerConfig,

    /// Key calls are tracked under by the circuit breaker
    pub circuit_key: String,

    /// Retry through an open circuit instead of failing fast
    pub retry_on_open_circuit: bool,

    /// Optional throttle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    /// Optional per-attempt deadline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            circuit_key: "ai-service".to_string(),
            retry_on_open_circuit: false,
            rate_limit: None,
            timeout: Some(TimeoutConfig::default()),
        }
    }
}

impl ResilienceConfig {
    /// Build an executor whose circuits use the configured thresholds
    pub fn executor(&self) -> ResilientExecutor {
        ResilientExecutor::new(self.circuit_breaker.clone())
    }

    /// Per-call options for [`ResilientExecutor::run`]
    pub fn run_options(&self) -> RunOptions {
        let mut options = RunOptions::new()
            .with_retry(self.retry.clone())
            .with_circuit_breaker(self.circuit_key.clone())
            .retry_on_open_circuit(self.retry_on_open_circuit);

        if let Some(rate_limit) = &self.rate_limit {
            options = options.with_rate_limit(rate_limit.clone());
        }
        if let Some(timeout) = &self.timeout {
            options = options.with_timeout(timeout.timeout);
        }
        options
    }
}

impl Validatable for ResilienceConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        validate_required_string(&self.circuit_key, "circuit_key", self.domain_name())?;

        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        if let Some(timeout) = &self.timeout {
            timeout.validate()?;
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "resilience"
    }
}

impl Validatable for RetryPolicy {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.max_attempts, "max_attempts", self.domain_name())?;

        if self.base_delay > self.max_delay {
            return Err(self.validation_error(format!(
                "base_delay ({:?}) cannot exceed max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }

        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(self.validation_error(format!(
                "backoff_factor must be at least 1.0, got {}",
                self.backoff_factor
            )));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "resilience.retry"
    }
}

impl Validatable for CircuitBreakerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.failure_threshold, "failure_threshold", self.domain_name())?;
        validate_duration(self.reset_timeout, "reset_timeout", self.domain_name())
    }

    fn domain_name(&self) -> &'static str {
        "resilience.circuit_breaker"
    }
}

impl Validatable for RateLimitConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.key, "key", self.domain_name())?;
        validate_positive(self.max_requests, "max_requests", self.domain_name())?;
        validate_duration(self.window, "window", self.domain_name())
    }

    fn domain_name(&self) -> &'static str {
        "resilience.rate_limit"
    }
}

impl Validatable for TimeoutConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_duration(self.timeout, "timeout", self.domain_name())
    }

    fn domain_name(&self) -> &'static str {
        "resilience.timeout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(1000));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.timeout, Some(TimeoutConfig::new(Duration::from_secs(30))));
    }

    #[test]
    fn test_invalid_values() {
        let mut config = ResilienceConfig::default();
        config.retry.backoff_factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        config.retry.base_delay = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        config.rate_limit = Some(RateLimitConfig::new("ai", 0, Duration::from_secs(1)));
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        config.circuit_breaker.reset_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_run_options() {
        let mut config = ResilienceConfig::default();
        config.rate_limit = Some(RateLimitConfig::per_second("ai", 10));
        config.timeout = None;

        let options = config.run_options();
        assert_eq!(options.circuit_breaker.as_deref(), Some("ai-service"));
        assert_eq!(options.retry, Some(RetryPolicy::default()));
        assert_eq!(options.rate_limit, config.rate_limit);
        assert_eq!(options.timeout, None);
        assert!(!options.retry_on_open_circuit);
    }
}
