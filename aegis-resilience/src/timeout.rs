//! Deadline guards for async operations
//!
//! # Cancellation
//!
//! [`with_timeout`] races the operation against a timer. When the timer wins
//! the operation's future is dropped, so it stops at its next suspension
//! point, but anything it already dispatched keeps going: a request already
//! on the wire still reaches the service, and tasks it spawned keep running
//! and may produce side effects after the guard has reported
//! [`TimeoutError`]. Operations that need to stop that work should use
//! [`with_cancellable_timeout`] and observe the token they are handed.

use log::warn;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::TimeoutError;

/// Timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for a single attempt
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    /// Create a timeout configuration
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// Race `operation` against a `timeout` deadline
///
/// See the module documentation for what happens to the operation when the
/// deadline fires first.
pub async fn with_timeout<Fut, T>(operation: Fut, timeout: Duration) -> Result<T, TimeoutError>
where
    Fut: Future<Output = T>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(value) => Ok(value),
        Err(_) => {
            warn!("Operation timed out after {:?}", timeout);
            Err(TimeoutError { after: timeout })
        }
    }
}

/// Race an operation against a deadline, cancelling its token when it fires
///
/// The operation receives a child of a fresh [`CancellationToken`]. When the
/// deadline passes the token is cancelled before [`TimeoutError`] is
/// returned, so work the operation handed the token to (spawned tasks,
/// streaming readers) can stop cooperatively.
pub async fn with_cancellable_timeout<F, Fut, T>(
    operation: F,
    timeout: Duration,
) -> Result<T, TimeoutError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = T>,
{
    let token = CancellationToken::new();
    // Cancels on timeout, and also if this future is itself dropped mid-wait
    let guard = token.clone().drop_guard();

    match with_timeout(operation(token.child_token()), timeout).await {
        Ok(value) => {
            guard.disarm();
            Ok(value)
        }
        Err(error) => {
            drop(guard);
            Err(error)
        }
    }
}

/// Stateless deadline guard bound to a [`TimeoutConfig`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutGuard {
    config: TimeoutConfig,
}

impl TimeoutGuard {
    /// Create a guard with the given configuration
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// The configured deadline
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Run an operation under the configured deadline
    pub async fn run<Fut, T>(&self, operation: Fut) -> Result<T, TimeoutError>
    where
        Fut: Future<Output = T>,
    {
        with_timeout(operation, self.config.timeout).await
    }

    /// Run a token-aware operation under the configured deadline
    pub async fn run_cancellable<F, Fut, T>(&self, operation: F) -> Result<T, TimeoutError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        with_cancellable_timeout(operation, self.config.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_completes_before_deadline() {
        let result = with_timeout(
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                "done"
            },
            Duration::from_millis(50),
        )
        .await;

        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let result = with_timeout(
            tokio::time::sleep(Duration::from_secs(5)),
            Duration::from_millis(50),
        )
        .await;

        assert_eq!(
            result.unwrap_err(),
            TimeoutError {
                after: Duration::from_millis(50)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_work_outlives_plain_timeout() {
        let side_effect = Arc::new(AtomicBool::new(false));
        let flag = side_effect.clone();

        let result = with_timeout(
            async move {
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    flag.store(true, Ordering::SeqCst);
                });
                handle.await.ok();
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(side_effect.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellable_timeout_cancels_token() {
        let side_effect = Arc::new(AtomicBool::new(false));
        let flag = side_effect.clone();

        let guard = TimeoutGuard::new(TimeoutConfig::new(Duration::from_millis(10)));
        let result = guard
            .run_cancellable(|token| async move {
                let handle = tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {
                            flag.store(true, Ordering::SeqCst);
                        }
                    }
                });
                handle.await.ok();
            })
            .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!side_effect.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_token_not_cancelled_on_success() {
        let observed = with_cancellable_timeout(
            |token| async move { token.is_cancelled() },
            Duration::from_secs(1),
        )
        .await;

        assert!(!observed.unwrap());
    }
}
