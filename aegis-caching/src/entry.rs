//! Cached values and their metadata

use std::time::Duration;
use tokio::time::Instant;

/// Trait for types that can be cached
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// Cache entry with metadata
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached value
    pub value: V,

    /// When the entry was stored
    pub created_at: Instant,

    /// How long the entry stays visible after `created_at`
    pub ttl: Duration,

    /// Last time the entry was read or written
    pub last_accessed: Instant,

    /// Number of reads
    pub access_count: u64,

    /// Recency rank; a larger value was touched more recently
    pub(crate) access_tick: u64,
}

impl<V> CacheEntry<V> {
    /// Create a new entry stored at `now`
    pub fn new(value: V, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            created_at: now,
            ttl,
            last_accessed: now,
            access_count: 0,
            access_tick: 0,
        }
    }

    /// Check if the entry has outlived its TTL at `now`
    ///
    /// An entry is still visible at exactly `created_at + ttl`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Time left before the entry expires
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.created_at))
    }

    /// Age of the entry at `now`
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub(crate) fn touch(&mut self, now: Instant, tick: u64) {
        self.last_accessed = now;
        self.access_count += 1;
        self.access_tick = tick;
    }
}
