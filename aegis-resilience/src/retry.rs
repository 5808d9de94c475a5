//! Retry policy and executor

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::backoff::BackoffCalculator;
use crate::error::Retryable;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay after every failed attempt
    pub backoff_factor: f64,

    /// Whether to scale delays by a random factor in `[0.5, 1.0)`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a conservative retry policy for critical operations
    pub fn conservative() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_factor: 1.5,
            jitter: true,
        }
    }

    /// Create an aggressive retry policy for fast operations
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.2,
            jitter: true,
        }
    }

    /// Single attempt, never retried
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base delay
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the maximum delay
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the backoff factor
    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.calculator().calculate_delay(attempt)
    }

    fn calculator(&self) -> BackoffCalculator {
        BackoffCalculator::new(
            self.base_delay,
            self.max_delay,
            self.backoff_factor,
            self.jitter,
        )
    }
}

/// Predicate deciding whether an error should be retried
pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Hook invoked after the backoff delay, before the next attempt
pub type RetryHook<E> = Arc<dyn Fn(u32, &E) + Send + Sync>;

/// Result of a retried execution
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Data of the successful attempt, or the last observed error
    pub result: Result<T, E>,

    /// Number of attempts made
    pub attempts: u32,

    /// Wall time spent, including backoff delays
    pub elapsed: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    /// Whether the operation eventually succeeded
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Discard the bookkeeping and return the result
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Retry executor
pub struct RetryExecutor<E> {
    policy: RetryPolicy,
    predicate: RetryPredicate<E>,
    on_retry: Option<RetryHook<E>>,
}

impl<E> Clone for RetryExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            predicate: self.predicate.clone(),
            on_retry: self.on_retry.clone(),
        }
    }
}

impl<E: Retryable + 'static> RetryExecutor<E> {
    /// Create a new retry executor using the error's own retry classification
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_predicate(policy, |error: &E| error.is_retryable())
    }

    /// Create with default policy
    pub fn with_default_policy() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl<E> RetryExecutor<E> {
    /// Create a retry executor with a custom retry predicate
    pub fn with_predicate<P>(policy: RetryPolicy, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            policy,
            predicate: Arc::new(predicate),
            on_retry: None,
        }
    }

    /// Register a hook called with the failed attempt number before each retry
    pub fn on_retry<H>(mut self, hook: H) -> Self
    where
        H: Fn(u32, &E) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// The policy this executor runs with
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether the predicate allows retrying this error
    pub fn should_retry(&self, error: &E) -> bool {
        (self.predicate)(error)
    }

    /// Execute a function with retry logic
    pub async fn execute<F, Fut, T>(&self, mut f: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_with_context(|_attempt| f()).await
    }

    /// Execute and return the data or the last observed error
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute(f).await.into_result()
    }

    /// Execute a function with retry logic and attempt context
    pub async fn execute_with_context<F, Fut, T>(&self, mut f: F) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!("Executing attempt {} of {}", attempt, max_attempts);

            match f(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        info!("Operation succeeded after {} attempts", attempt);
                    }
                    return RetryOutcome {
                        result: Ok(result),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    };
                }
                Err(error) => {
                    if attempt >= max_attempts {
                        warn!("Operation failed after {} attempts: {}", attempt, error);
                        return RetryOutcome {
                            result: Err(error),
                            attempts: attempt,
                            elapsed: started.elapsed(),
                        };
                    }

                    if !self.should_retry(&error) {
                        warn!("Operation failed with non-retryable error: {}", error);
                        return RetryOutcome {
                            result: Err(error),
                            attempts: attempt,
                            elapsed: started.elapsed(),
                        };
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}",
                        attempt, error, delay
                    );
                    sleep(delay).await;

                    if let Some(hook) = &self.on_retry {
                        hook(attempt, &error);
                    }

                    attempt += 1;
                }
            }
        }
    }
}
