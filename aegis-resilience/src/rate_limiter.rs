//! Sliding window rate limiter
//!
//! Keeps the instants of admitted calls per key. `acquire` throttles: when
//! the trailing window is full it sleeps until the oldest call leaves the
//! window and checks again. `try_acquire` is the reject-mode variant.

use log::debug;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::error::RateLimitError;

/// Rate limiter configuration for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Key the window is tracked under
    pub key: String,

    /// Maximum calls admitted within the window
    pub max_requests: u32,

    /// Length of the trailing window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl RateLimitConfig {
    /// Create a new rate limit configuration
    pub fn new(key: impl Into<String>, max_requests: u32, window: Duration) -> Self {
        Self {
            key: key.into(),
            max_requests,
            window,
        }
    }

    /// Create rate limit for requests per second
    pub fn per_second(key: impl Into<String>, max_requests: u32) -> Self {
        Self::new(key, max_requests, Duration::from_secs(1))
    }

    /// Create rate limit for requests per minute
    pub fn per_minute(key: impl Into<String>, max_requests: u32) -> Self {
        Self::new(key, max_requests, Duration::from_secs(60))
    }
}

/// Snapshot of a key's window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Calls currently inside the window
    pub current_requests: u32,

    /// Calls that can still be admitted right now
    pub remaining: u32,

    /// Time until the oldest call leaves the window
    pub reset_after: Option<Duration>,
}

#[derive(Debug, Default)]
struct RateWindow {
    timestamps: VecDeque<Instant>,
    window: Duration,
}

impl RateWindow {
    /// Drop instants that are no longer inside `[now - window, now)`
    fn prune(&mut self, now: Instant, window: Duration) {
        self.window = window;
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn wait_time(&self, now: Instant, window: Duration) -> Duration {
        self.timestamps
            .front()
            .map(|&oldest| window.saturating_sub(now.duration_since(oldest)))
            .unwrap_or(Duration::ZERO)
    }

    fn try_record(
        &mut self,
        now: Instant,
        max_requests: u32,
        window: Duration,
    ) -> Result<(), Duration> {
        self.prune(now, window);

        if self.timestamps.len() < max_requests as usize {
            self.timestamps.push_back(now);
            Ok(())
        } else {
            Err(self.wait_time(now, window))
        }
    }
}

/// Keyed sliding window rate limiter
#[derive(Clone, Default)]
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<String, Arc<Mutex<RateWindow>>>>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a call for `key` fits in the window, then record it
    pub async fn acquire(
        &self,
        key: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<(), RateLimitError> {
        validate(key, max_requests, window)?;
        let state = self.window(key);

        loop {
            let wait = match state.lock().try_record(Instant::now(), max_requests, window) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            debug!(
                "Rate limit for '{}' reached ({} per {:?}), waiting {:?}",
                key, max_requests, window, wait
            );
            sleep(wait).await;
        }
    }

    /// Throttle using a [`RateLimitConfig`]
    pub async fn acquire_with(&self, config: &RateLimitConfig) -> Result<(), RateLimitError> {
        self.acquire(&config.key, config.max_requests, config.window)
            .await
    }

    /// Record a call if it fits in the window, otherwise reject immediately
    pub fn try_acquire(
        &self,
        key: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<(), RateLimitError> {
        validate(key, max_requests, window)?;

        self.window(key)
            .lock()
            .try_record(Instant::now(), max_requests, window)
            .map_err(|retry_after| RateLimitError::RateLimited {
                key: key.to_string(),
                retry_after,
            })
    }

    /// Get current rate limit status for a key
    pub fn status(&self, key: &str, max_requests: u32, window: Duration) -> RateLimitStatus {
        let state = self.window(key);
        let mut state = state.lock();
        let now = Instant::now();
        state.prune(now, window);

        let current_requests = state.timestamps.len() as u32;
        RateLimitStatus {
            current_requests,
            remaining: max_requests.saturating_sub(current_requests),
            reset_after: state
                .timestamps
                .front()
                .map(|_| state.wait_time(now, window)),
        }
    }

    /// Forget keys whose window has emptied, returning how many were removed
    pub fn remove_idle(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.write();
        let before = windows.len();

        windows.retain(|_, state| {
            let mut state = state.lock();
            let window = state.window;
            state.prune(now, window);
            !state.timestamps.is_empty()
        });

        before - windows.len()
    }

    fn window(&self, key: &str) -> Arc<Mutex<RateWindow>> {
        if let Some(state) = self.windows.read().get(key) {
            return state.clone();
        }

        self.windows
            .write()
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}

fn validate(key: &str, max_requests: u32, window: Duration) -> Result<(), RateLimitError> {
    if max_requests == 0 {
        return Err(RateLimitError::InvalidConfig {
            key: key.to_string(),
            reason: "max_requests must be greater than 0".to_string(),
        });
    }

    if window.is_zero() {
        return Err(RateLimitError::InvalidConfig {
            key: key.to_string(),
            reason: "window must be greater than 0".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_third_call_waits_for_window() {
        let limiter = RateLimiter::new();
        let window = Duration::from_millis(100);
        let start = Instant::now();

        limiter.acquire("ai", 2, window).await.unwrap();
        limiter.acquire("ai", 2, window).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire("ai", 2, window).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(100));

        // The two t=0 calls have left the window, so one more slot is free
        limiter.acquire("ai", 2, window).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_exceed_limit() {
        let limiter = RateLimiter::new();
        let window = Duration::from_millis(100);
        let admitted = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire("ai", 2, window).await.unwrap();
                admitted.lock().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut admitted = admitted.lock().clone();
        admitted.sort();
        assert_eq!(admitted.len(), 6);
        for trio in admitted.windows(3) {
            // Any three admissions span at least a full window
            assert!(trio[2].duration_since(trio[0]) >= window);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(1);

        limiter.try_acquire("a", 1, window).unwrap();
        assert!(limiter.try_acquire("a", 1, window).is_err());
        assert!(limiter.try_acquire("b", 1, window).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_rejects_with_retry_after() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::new("ai", 1, Duration::from_millis(100));

        limiter.acquire_with(&config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let error = limiter
            .try_acquire(&config.key, config.max_requests, config.window)
            .unwrap_err();
        assert_eq!(
            error,
            RateLimitError::RateLimited {
                key: "ai".to_string(),
                retry_after: Duration::from_millis(70),
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_parameters_are_rejected() {
        let limiter = RateLimiter::new();

        let zero_requests = limiter.acquire("ai", 0, Duration::from_secs(1)).await;
        assert!(matches!(
            zero_requests,
            Err(RateLimitError::InvalidConfig { .. })
        ));

        let zero_window = limiter.acquire("ai", 5, Duration::ZERO).await;
        assert!(matches!(zero_window, Err(RateLimitError::InvalidConfig { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_and_idle_cleanup() {
        let limiter = RateLimiter::new();
        let window = Duration::from_millis(100);

        limiter.try_acquire("ai", 3, window).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        limiter.try_acquire("ai", 3, window).unwrap();

        let status = limiter.status("ai", 3, window);
        assert_eq!(status.current_requests, 2);
        assert_eq!(status.remaining, 1);
        assert_eq!(status.reset_after, Some(Duration::from_millis(60)));

        assert_eq!(limiter.remove_idle(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(limiter.remove_idle(), 1);
    }
}
