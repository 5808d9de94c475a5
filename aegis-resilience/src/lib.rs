//! Resilience patterns for outbound AI service calls
//!
//! This crate provides retry with backoff, a keyed circuit breaker, a
//! sliding window rate limiter, deadline guards, and the
//! [`ResilientExecutor`] that layers them around a single async operation.

pub mod backoff;
pub mod circuit_breaker;
pub mod error;
pub mod executor;
pub mod rate_limiter;
pub mod retry;
pub mod timeout;

// Re-export commonly used types
pub use backoff::BackoffCalculator;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig, CircuitMetrics, CircuitPermit,
    CircuitState,
};
pub use error::{
    CircuitError, CircuitOpenError, FailureKind, RateLimitError, ResilienceError, Retryable,
    TimeoutError,
};
pub use executor::{ResilientExecutor, RunOptions};
pub use rate_limiter::{RateLimitConfig, RateLimitStatus, RateLimiter};
pub use retry::{RetryExecutor, RetryOutcome, RetryPolicy};
pub use timeout::{with_cancellable_timeout, with_timeout, TimeoutConfig, TimeoutGuard};

// Re-exported so callers of `run_cancellable` need no direct dependency
pub use tokio_util::sync::CancellationToken;
