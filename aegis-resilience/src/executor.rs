//! Composition of the resilience primitives around one operation
//!
//! Layers are applied only for the options supplied, in a fixed order:
//!
//! ```text
//! Retry( CircuitBreaker( RateLimiter( Timeout( operation ))))
//! ```
//!
//! Retry is outermost, so every attempt passes through the breaker check,
//! the rate limiter and the deadline again.

use log::debug;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{CircuitError, RateLimitError, ResilienceError, Retryable};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::timeout::with_cancellable_timeout;

/// Per-call layering options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Retry policy; attempts are made once when absent
    pub retry: Option<RetryPolicy>,

    /// Circuit key to guard the call with
    pub circuit_breaker: Option<String>,

    /// Sliding window limit applied to every attempt
    pub rate_limit: Option<RateLimitConfig>,

    /// Deadline for every attempt
    pub timeout: Option<Duration>,

    /// Keep retrying while the circuit is open instead of failing fast
    pub retry_on_open_circuit: bool,
}

impl RunOptions {
    /// Options with no layers
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry failed attempts with the given policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Guard attempts with the circuit for `key`
    pub fn with_circuit_breaker(mut self, key: impl Into<String>) -> Self {
        self.circuit_breaker = Some(key.into());
        self
    }

    /// Throttle attempts through the rate limiter
    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Bound every attempt by a deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Opt into retrying through an open circuit
    pub fn retry_on_open_circuit(mut self, enabled: bool) -> Self {
        self.retry_on_open_circuit = enabled;
        self
    }
}

/// Resilient executor owning the keyed breaker and limiter state
///
/// Clones share state, independent instances do not.
#[derive(Clone, Default)]
pub struct ResilientExecutor {
    circuit_breaker: CircuitBreaker,
    rate_limiter: RateLimiter,
}

impl ResilientExecutor {
    /// Create an executor whose circuits use `config`
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_components(CircuitBreaker::new(config), RateLimiter::new())
    }

    /// Create an executor from existing components
    pub fn with_components(circuit_breaker: CircuitBreaker, rate_limiter: RateLimiter) -> Self {
        Self {
            circuit_breaker,
            rate_limiter,
        }
    }

    /// The circuit breaker used for `RunOptions::circuit_breaker` keys
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// The rate limiter used for `RunOptions::rate_limit`
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Run an operation through the configured layers
    pub async fn run<F, Fut, T, E>(
        &self,
        operation: F,
        options: &RunOptions,
    ) -> Result<T, ResilienceError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display + 'static,
    {
        self.run_cancellable(|_token| operation(), options).await
    }

    /// Run a token-aware operation through the configured layers
    ///
    /// Each attempt gets its own token, cancelled when that attempt's
    /// deadline fires.
    pub async fn run_cancellable<F, Fut, T, E>(
        &self,
        operation: F,
        options: &RunOptions,
    ) -> Result<T, ResilienceError<E>>
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display + 'static,
    {
        if let Some(limit) = &options.rate_limit {
            validate_rate_limit(limit)?;
        }

        let operation = &operation;
        match &options.retry {
            None => self.attempt(operation, options).await,
            Some(policy) => {
                let retry_on_open = options.retry_on_open_circuit;
                let retry = RetryExecutor::with_predicate(
                    policy.clone(),
                    move |error: &ResilienceError<E>| match error {
                        ResilienceError::Operation(error) => error.is_retryable(),
                        ResilienceError::CircuitOpen(_) => retry_on_open,
                        ResilienceError::Timeout(_) => true,
                        ResilienceError::RateLimit(RateLimitError::RateLimited { .. }) => true,
                        ResilienceError::RateLimit(RateLimitError::InvalidConfig { .. }) => false,
                    },
                );

                retry.run(|| self.attempt(operation, options)).await
            }
        }
    }

    /// One attempt: breaker check, rate limit, then the deadline race
    async fn attempt<F, Fut, T, E>(
        &self,
        operation: &F,
        options: &RunOptions,
    ) -> Result<T, ResilienceError<E>>
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match &options.circuit_breaker {
            Some(key) => self
                .circuit_breaker
                .wrap(key, || self.limited(operation, options))
                .await
                .map_err(|error| match error {
                    CircuitError::Open(open) => {
                        debug!("Call rejected by open circuit '{}'", open.key);
                        ResilienceError::CircuitOpen(open)
                    }
                    CircuitError::Operation(inner) => inner,
                }),
            None => self.limited(operation, options).await,
        }
    }

    async fn limited<F, Fut, T, E>(
        &self,
        operation: &F,
        options: &RunOptions,
    ) -> Result<T, ResilienceError<E>>
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(limit) = &options.rate_limit {
            self.rate_limiter.acquire_with(limit).await?;
        }

        match options.timeout {
            Some(timeout) => with_cancellable_timeout(|token| operation(token), timeout)
                .await?
                .map_err(ResilienceError::Operation),
            None => operation(CancellationToken::new())
                .await
                .map_err(ResilienceError::Operation),
        }
    }
}

fn validate_rate_limit(limit: &RateLimitConfig) -> Result<(), RateLimitError> {
    if limit.max_requests == 0 || limit.window.is_zero() {
        return Err(RateLimitError::InvalidConfig {
            key: limit.key.clone(),
            reason: format!(
                "max_requests ({}) and window ({:?}) must both be greater than 0",
                limit.max_requests, limit.window
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerBuilder, CircuitState};
    use crate::error::FailureKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    struct ServiceError {
        status: u16,
    }

    impl Display for ServiceError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "service returned {}", self.status)
        }
    }

    impl Retryable for ServiceError {
        fn status_code(&self) -> Option<u16> {
            Some(self.status)
        }
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_base_delay(Duration::from_millis(100))
            .with_backoff_factor(1.0)
            .with_jitter(false)
    }

    #[tokio::test]
    async fn test_no_options_passes_through() {
        let executor = ResilientExecutor::default();

        let result = executor
            .run(|| async { Ok::<_, ServiceError>("answer") }, &RunOptions::new())
            .await;

        assert_eq!(result.unwrap(), "answer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_under_retry() {
        let executor = ResilientExecutor::with_components(
            CircuitBreakerBuilder::new()
                .failure_threshold(2)
                .reset_timeout(Duration::from_secs(60))
                .build(),
            RateLimiter::new(),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let options = RunOptions::new()
            .with_retry(quick_policy(5))
            .with_circuit_breaker("ai");

        let result: Result<(), _> = executor
            .run(
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(ServiceError { status: 503 })
                    }
                },
                &options,
            )
            .await;

        let error = result.unwrap_err();
        assert!(error.is_circuit_open());
        assert_eq!(error.kind(), FailureKind::CircuitOpen);
        assert!(error.is_service_unavailable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_through_open_circuit_when_opted_in() {
        let executor = ResilientExecutor::new(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(150),
        });
        let calls = Arc::new(AtomicU32::new(0));
        let options = RunOptions::new()
            .with_retry(quick_policy(5))
            .with_circuit_breaker("ai")
            .retry_on_open_circuit(true);

        let result = executor
            .run(
                || {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(ServiceError { status: 502 })
                        } else {
                            Ok("recovered")
                        }
                    }
                },
                &options,
            )
            .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(executor.circuit_breaker().state("ai"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_gets_its_own_deadline() {
        let executor = ResilientExecutor::default();
        let calls = Arc::new(AtomicU32::new(0));
        let options = RunOptions::new()
            .with_retry(quick_policy(2))
            .with_timeout(Duration::from_millis(50));

        let result = executor
            .run(
                || {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        Ok::<_, ServiceError>("fast")
                    }
                },
                &options,
            )
            .await;

        assert_eq!(result.unwrap(), "fast");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_distinctly() {
        let executor = ResilientExecutor::default();
        let options = RunOptions::new().with_timeout(Duration::from_millis(10));

        let result = executor
            .run(
                || async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok::<_, ServiceError>(())
                },
                &options,
            )
            .await;

        let error = result.unwrap_err();
        assert!(error.is_timeout());
        assert!(error.is_service_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_count_as_circuit_failures() {
        let executor = ResilientExecutor::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        });
        let options = RunOptions::new()
            .with_circuit_breaker("ai")
            .with_timeout(Duration::from_millis(10));

        let first = executor
            .run(
                || async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok::<_, ServiceError>(())
                },
                &options,
            )
            .await;
        assert!(first.unwrap_err().is_timeout());
        assert!(executor.circuit_breaker().is_open("ai"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_applies_to_every_attempt() {
        let executor = ResilientExecutor::default();
        let calls = Arc::new(AtomicU32::new(0));
        let options = RunOptions::new()
            .with_retry(quick_policy(3).with_base_delay(Duration::from_millis(10)))
            .with_rate_limit(RateLimitConfig::new("ai", 1, Duration::from_millis(100)));
        let start = Instant::now();

        let result = executor
            .run(
                || {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(ServiceError { status: 429 })
                        } else {
                            Ok(())
                        }
                    }
                },
                &options,
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_invalid_rate_limit_never_invokes_operation() {
        let executor = ResilientExecutor::default();
        let calls = Arc::new(AtomicU32::new(0));
        let options = RunOptions::new()
            .with_retry(quick_policy(3))
            .with_rate_limit(RateLimitConfig::new("ai", 0, Duration::from_secs(1)));

        let result = executor
            .run(
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ServiceError>(())
                    }
                },
                &options,
            )
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::RateLimit(RateLimitError::InvalidConfig { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_fails_on_first_attempt() {
        let executor = ResilientExecutor::default();
        let calls = Arc::new(AtomicU32::new(0));
        let options = RunOptions::new().with_retry(quick_policy(4));

        let result: Result<(), _> = executor
            .run(
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(ServiceError { status: 400 })
                    }
                },
                &options,
            )
            .await;

        let error = result.unwrap_err();
        assert_eq!(error.kind(), FailureKind::NonRetryable);
        assert_eq!(error.into_operation_error(), Some(ServiceError { status: 400 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_independent_executors_do_not_share_circuits() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        };
        let first = ResilientExecutor::new(config.clone());
        let second = ResilientExecutor::new(config);
        let options = RunOptions::new().with_circuit_breaker("ai");

        let _ = first
            .run(|| async { Err::<(), _>(ServiceError { status: 500 }) }, &options)
            .await;

        assert!(first.circuit_breaker().is_open("ai"));
        assert!(!second.circuit_breaker().is_open("ai"));
    }
}
