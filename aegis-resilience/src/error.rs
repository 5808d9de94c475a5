//! Error taxonomy shared by the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// HTTP status codes the default retry predicate treats as transient
pub const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Check whether an HTTP status code is considered transient
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status)
}

/// Trait for errors that can be retried
///
/// The default `is_retryable` implements the standard predicate: connectivity
/// failures and HTTP 408/429/500/502/503/504 are retryable, everything else
/// fails on the first attempt. Implementors usually only provide
/// `status_code` and `is_connectivity_error`.
pub trait Retryable {
    /// HTTP status code attached to this error, if any
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Whether the error came from the connection itself (DNS, reset, refused)
    fn is_connectivity_error(&self) -> bool {
        false
    }

    /// Whether this error is retryable
    fn is_retryable(&self) -> bool {
        self.is_connectivity_error() || self.status_code().is_some_and(is_retryable_status)
    }
}

/// Classification of a failure as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retryable per the predicate
    Transient,
    /// Fast failure while the breaker is open
    CircuitOpen,
    /// Deadline exceeded
    Timeout,
    /// Rejected by the predicate, surfaced on the first attempt
    NonRetryable,
}

/// Returned when a call is rejected because the circuit for its key is open
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker '{key}' is open")]
pub struct CircuitOpenError {
    /// Circuit key that rejected the call
    pub key: String,
    /// Time until the breaker becomes eligible for a probe, if known
    pub retry_after: Option<Duration>,
}

/// Returned when an operation does not finish before its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Operation timed out after {after:?}")]
pub struct TimeoutError {
    /// The deadline that was exceeded
    pub after: Duration,
}

/// Rate limiter errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// The limit parameters can never admit a call
    #[error("Invalid rate limit for '{key}': {reason}")]
    InvalidConfig { key: String, reason: String },

    /// The window is full (reject mode only)
    #[error("Rate limit exceeded for '{key}', retry after {retry_after:?}")]
    RateLimited { key: String, retry_after: Duration },
}

/// Error returned by [`CircuitBreaker::wrap`](crate::CircuitBreaker::wrap)
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The breaker rejected the call without invoking the operation
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    /// The operation ran and failed
    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitError<E> {
    /// Get the operation error if the operation ran
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            CircuitError::Operation(error) => Some(error),
            CircuitError::Open(_) => None,
        }
    }

    /// Check if the call was rejected by an open circuit
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open(_))
    }
}

/// Error returned by [`ResilientExecutor::run`](crate::ResilientExecutor::run)
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The wrapped operation failed
    #[error("{0}")]
    Operation(E),

    /// The circuit breaker rejected the call
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The operation exceeded its deadline
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The rate limiter could not admit the call
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

impl<E: Retryable> ResilienceError<E> {
    /// Map this error onto the caller-facing taxonomy
    pub fn kind(&self) -> FailureKind {
        match self {
            ResilienceError::Operation(error) if error.is_retryable() => FailureKind::Transient,
            ResilienceError::Operation(_) => FailureKind::NonRetryable,
            ResilienceError::CircuitOpen(_) => FailureKind::CircuitOpen,
            ResilienceError::Timeout(_) => FailureKind::Timeout,
            ResilienceError::RateLimit(RateLimitError::RateLimited { .. }) => {
                FailureKind::Transient
            }
            ResilienceError::RateLimit(RateLimitError::InvalidConfig { .. }) => {
                FailureKind::NonRetryable
            }
        }
    }
}

impl<E> ResilienceError<E> {
    /// Whether the caller should present this as "service unavailable"
    pub fn is_service_unavailable(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen(_) | ResilienceError::Timeout(_)
        )
    }

    /// Check if this represents a circuit breaker open error
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen(_))
    }

    /// Check if this represents a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ResilienceError::Timeout(_))
    }

    /// Get the underlying operation error if present
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            ResilienceError::Operation(error) => Some(error),
            _ => None,
        }
    }
}

impl<E> From<CircuitError<E>> for ResilienceError<E> {
    fn from(error: CircuitError<E>) -> Self {
        match error {
            CircuitError::Open(open) => ResilienceError::CircuitOpen(open),
            CircuitError::Operation(error) => ResilienceError::Operation(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct HttpError(u16);

    impl Retryable for HttpError {
        fn status_code(&self) -> Option<u16> {
            Some(self.0)
        }
    }

    #[test]
    fn test_default_predicate_statuses() {
        for status in RETRYABLE_STATUS_CODES {
            assert!(HttpError(status).is_retryable(), "{} should retry", status);
        }
        for status in [400, 401, 403, 404, 422, 501] {
            assert!(!HttpError(status).is_retryable(), "{} should not retry", status);
        }
    }

    #[test]
    fn test_failure_kind_mapping() {
        let transient: ResilienceError<HttpError> = ResilienceError::Operation(HttpError(503));
        assert_eq!(transient.kind(), FailureKind::Transient);

        let fatal: ResilienceError<HttpError> = ResilienceError::Operation(HttpError(400));
        assert_eq!(fatal.kind(), FailureKind::NonRetryable);
        assert!(!fatal.is_service_unavailable());

        let open: ResilienceError<HttpError> = CircuitOpenError {
            key: "ai".to_string(),
            retry_after: None,
        }
        .into();
        assert_eq!(open.kind(), FailureKind::CircuitOpen);
        assert!(open.is_service_unavailable());

        let timeout: ResilienceError<HttpError> = TimeoutError {
            after: Duration::from_secs(1),
        }
        .into();
        assert_eq!(timeout.kind(), FailureKind::Timeout);
        assert!(timeout.is_service_unavailable());
    }
}
