//! Keyed circuit breaker
//!
//! Each key owns an independent `Closed -> Open -> HalfOpen` state machine.
//! Records are created lazily on first use and live as long as the breaker.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{CircuitError, CircuitOpenError};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, a single probe request is allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time to wait after the last failure before allowing a probe
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-key circuit metrics
#[derive(Debug, Clone, Default)]
pub struct CircuitMetrics {
    /// Total number of calls that reached the operation
    pub total_requests: u64,
    /// Number of successful calls
    pub total_successes: u64,
    /// Number of failed calls
    pub total_failures: u64,
    /// Number of calls rejected due to open circuit
    pub total_rejected: u64,
    /// Current consecutive failures
    pub consecutive_failures: u32,
    /// Last failure time
    pub last_failure_time: Option<Instant>,
    /// Last success time
    pub last_success_time: Option<Instant>,
    /// Last state change time
    pub last_state_change: Option<Instant>,
}

/// Admission handed out by [`CircuitBreaker::try_acquire`]
///
/// The permit goes back to the breaker with the call's outcome. Outcomes of
/// permits issued before the circuit last changed state, or of a probe that
/// was superseded, only update the totals in [`CircuitMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "report the outcome with record_success or record_failure"]
pub struct CircuitPermit {
    epoch: u64,
    probe: bool,
}

impl CircuitPermit {
    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

/// State machine for a single key
#[derive(Debug)]
struct CircuitRecord {
    key: String,
    state: CircuitState,
    /// Bumped on every transition and every probe admission
    epoch: u64,
    probe_started_at: Option<Instant>,
    metrics: CircuitMetrics,
}

impl CircuitRecord {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: CircuitState::Closed,
            epoch: 0,
            probe_started_at: None,
            metrics: CircuitMetrics::default(),
        }
    }

    fn permit(&self, probe: bool) -> CircuitPermit {
        CircuitPermit {
            epoch: self.epoch,
            probe,
        }
    }

    fn is_current(&self, permit: CircuitPermit) -> bool {
        permit.epoch == self.epoch
    }

    fn update_state(&mut self, config: &CircuitBreakerConfig) {
        if self.state == CircuitState::Open {
            if let Some(last_failure) = self.metrics.last_failure_time {
                if last_failure.elapsed() >= config.reset_timeout {
                    self.transition_to_half_open();
                }
            }
        }
    }

    /// A probe whose caller was abandoned without reporting back frees its
    /// slot after another `reset_timeout`
    fn probe_slot_free(&self, config: &CircuitBreakerConfig) -> bool {
        self.probe_started_at
            .is_none_or(|started| started.elapsed() >= config.reset_timeout)
    }

    fn retry_after(&self, config: &CircuitBreakerConfig) -> Option<Duration> {
        self.metrics
            .last_failure_time
            .map(|last| config.reset_timeout.saturating_sub(last.elapsed()))
    }

    fn transition_to_open(&mut self) {
        self.epoch += 1;
        self.state = CircuitState::Open;
        self.probe_started_at = None;
        self.metrics.last_state_change = Some(Instant::now());
        log::warn!(
            "Circuit breaker '{}' opened after {} consecutive failures",
            self.key,
            self.metrics.consecutive_failures
        );
    }

    fn transition_to_closed(&mut self) {
        self.epoch += 1;
        self.state = CircuitState::Closed;
        self.probe_started_at = None;
        self.metrics.consecutive_failures = 0;
        self.metrics.last_state_change = Some(Instant::now());
        log::info!("Circuit breaker '{}' closed after successful probe", self.key);
    }

    fn transition_to_half_open(&mut self) {
        self.epoch += 1;
        self.state = CircuitState::HalfOpen;
        self.probe_started_at = None;
        self.metrics.last_state_change = Some(Instant::now());
        log::info!("Circuit breaker '{}' transitioned to half-open state", self.key);
    }
}

/// Thread-safe keyed circuit breaker
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    records: Arc<RwLock<HashMap<String, Arc<Mutex<CircuitRecord>>>>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// The configuration shared by every key
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run an operation through the circuit for `key`
    ///
    /// While the circuit is open the operation is not invoked and
    /// [`CircuitError::Open`] is returned.
    pub async fn wrap<F, Fut, T, E>(&self, key: &str, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire(key)?;

        match operation().await {
            Ok(value) => {
                self.record_success(key, permit);
                Ok(value)
            }
            Err(error) => {
                self.record_failure(key, permit);
                Err(CircuitError::Operation(error))
            }
        }
    }

    /// Ask permission to call the operation for `key`
    ///
    /// In half-open state the first caller becomes the probe; everybody else
    /// is rejected until the probe reports back through `record_success` or
    /// `record_failure` with its permit.
    pub fn try_acquire(&self, key: &str) -> Result<CircuitPermit, CircuitOpenError> {
        let record = self.record(key);
        let mut record = record.lock();
        record.update_state(&self.config);

        match record.state {
            CircuitState::Closed => Ok(record.permit(false)),
            CircuitState::HalfOpen if record.probe_slot_free(&self.config) => {
                record.epoch += 1;
                record.probe_started_at = Some(Instant::now());
                log::debug!("Circuit breaker '{}' admitting probe call", key);
                Ok(record.permit(true))
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                record.metrics.total_rejected += 1;
                Err(CircuitOpenError {
                    key: key.to_string(),
                    retry_after: record.retry_after(&self.config),
                })
            }
        }
    }

    /// Record a successful operation admitted with `permit`
    pub fn record_success(&self, key: &str, permit: CircuitPermit) {
        let record = self.record(key);
        let mut record = record.lock();
        record.update_state(&self.config);

        record.metrics.total_requests += 1;
        record.metrics.total_successes += 1;
        record.metrics.last_success_time = Some(Instant::now());

        if !record.is_current(permit) {
            log::debug!("Circuit breaker '{}' ignoring stale success", key);
            return;
        }

        match record.state {
            CircuitState::HalfOpen => record.transition_to_closed(),
            CircuitState::Closed => record.metrics.consecutive_failures = 0,
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation admitted with `permit`
    pub fn record_failure(&self, key: &str, permit: CircuitPermit) {
        let record = self.record(key);
        let mut record = record.lock();
        record.update_state(&self.config);

        record.metrics.total_requests += 1;
        record.metrics.total_failures += 1;

        if !record.is_current(permit) {
            log::debug!("Circuit breaker '{}' ignoring stale failure", key);
            return;
        }

        record.metrics.last_failure_time = Some(Instant::now());
        record.metrics.consecutive_failures += 1;

        match record.state {
            CircuitState::Closed => {
                if record.metrics.consecutive_failures >= self.config.failure_threshold {
                    record.transition_to_open();
                }
            }
            CircuitState::HalfOpen => record.transition_to_open(),
            CircuitState::Open => {}
        }
    }

    /// Get the current state for `key`
    pub fn state(&self, key: &str) -> CircuitState {
        let record = self.record(key);
        let mut record = record.lock();
        record.update_state(&self.config);
        record.state
    }

    /// Check if calls for `key` would currently be rejected
    pub fn is_open(&self, key: &str) -> bool {
        self.state(key) == CircuitState::Open
    }

    /// Get current metrics for `key`
    pub fn metrics(&self, key: &str) -> CircuitMetrics {
        self.record(key).lock().metrics.clone()
    }

    /// Keys that have been used so far
    pub fn keys(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }

    /// Reset the circuit for `key` to closed state
    pub fn reset(&self, key: &str) {
        let record = self.record(key);
        let mut record = record.lock();
        record.state = CircuitState::Closed;
        record.epoch += 1;
        record.probe_started_at = None;
        record.metrics = CircuitMetrics {
            last_state_change: Some(Instant::now()),
            ..CircuitMetrics::default()
        };
    }

    /// Reset every circuit
    pub fn reset_all(&self) {
        for key in self.keys() {
            self.reset(&key);
        }
    }

    fn record(&self, key: &str) -> Arc<Mutex<CircuitRecord>> {
        if let Some(record) = self.records.read().get(key) {
            return record.clone();
        }

        self.records
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitRecord::new(key))))
            .clone()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Builder for circuit breaker configuration
pub struct CircuitBreakerBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: CircuitBreakerConfig::default(),
        }
    }

    /// Set failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Set cooldown before a probe is allowed
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    /// Build the circuit breaker
    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker::new(self.config)
    }
}

impl Default for CircuitBreakerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
