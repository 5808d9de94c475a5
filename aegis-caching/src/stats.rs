//! Cache statistics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,

    /// Number of cache misses, including reads of expired entries
    pub misses: u64,

    /// Number of stored values
    pub puts: u64,

    /// Entries removed to make room
    pub evictions: u64,

    /// Entries removed because their TTL elapsed
    pub expirations: u64,

    /// Current number of entries
    pub entry_count: usize,

    /// Hit rate (0.0 to 1.0)
    pub hit_rate: f64,
}

/// Thread-safe statistics collector
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl StatsCollector {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: usize) {
        self.expirations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entry_count: usize) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            hits,
            misses,
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entry_count,
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}
