//! Backoff delay calculation for retry policies

use rand::Rng;
use std::time::Duration;

/// Lower bound of the jitter scale factor
pub const JITTER_FLOOR: f64 = 0.5;

/// Exponential backoff calculator
///
/// `delay(attempt) = min(max_delay, base_delay * factor^(attempt - 1))`,
/// optionally scaled by a random factor in `[0.5, 1.0)`.
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    base_delay: Duration,
    max_delay: Duration,
    factor: f64,
    jitter: bool,
}

impl BackoffCalculator {
    /// Create a new backoff calculator
    pub fn new(base_delay: Duration, max_delay: Duration, factor: f64, jitter: bool) -> Self {
        Self {
            base_delay,
            max_delay,
            factor,
            jitter,
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let capped = self.base_delay_for(attempt);

        if self.jitter {
            apply_jitter(capped)
        } else {
            capped
        }
    }

    /// Delay for an attempt before jitter is applied, already capped
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = self.factor.max(0.0).powi(exponent);
        let nanos = self.base_delay.as_nanos() as f64 * multiplier;
        let max_nanos = self.max_delay.as_nanos() as f64;

        // Comparing as f64 keeps huge exponents from overflowing the Duration
        if !nanos.is_finite() || nanos >= max_nanos {
            self.max_delay
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

/// Scale a delay by a random factor in `[JITTER_FLOOR, 1.0)`
pub fn apply_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor = rng.gen_range(JITTER_FLOOR..1.0);
    Duration::from_nanos((delay.as_nanos() as f64 * jitter_factor) as u64)
}
