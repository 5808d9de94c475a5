//! Serialized form of a cache snapshot

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::entry::CacheEntry;

/// Versioned snapshot of the live entries of a cache
///
/// Times are wall-clock milliseconds since the Unix epoch so a payload stays
/// meaningful across process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPayload<V> {
    /// Format version tag
    pub version: u32,

    /// When the snapshot was taken
    pub saved_at_ms: i64,

    /// Entries that were live when the snapshot was taken
    pub entries: Vec<PersistedEntry<V>>,
}

/// One entry of a [`PersistedPayload`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at_ms: i64,
    pub ttl_ms: u64,
    pub last_accessed_ms: i64,
}

/// Only the version tag, read before the entries are trusted
#[derive(Debug, Deserialize)]
pub(crate) struct PayloadHeader {
    pub version: u32,
}

impl<V: Clone> PersistedPayload<V> {
    /// Snapshot the unexpired entries of `entries`
    pub fn capture(
        version: u32,
        entries: &HashMap<String, CacheEntry<V>>,
        now: Instant,
        now_ms: i64,
    ) -> Self {
        let entries = entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, entry)| {
                let idle = now.saturating_duration_since(entry.last_accessed);
                PersistedEntry {
                    key: key.clone(),
                    value: entry.value.clone(),
                    created_at_ms: now_ms - millis(entry.age(now)),
                    ttl_ms: entry.ttl.as_millis().min(u64::MAX as u128) as u64,
                    last_accessed_ms: now_ms - millis(idle),
                }
            })
            .collect();

        Self {
            version,
            saved_at_ms: now_ms,
            entries,
        }
    }
}

impl<V> PersistedPayload<V> {
    /// Rebuild live entries, least recently accessed first
    ///
    /// Entries that had already expired when the snapshot was taken, or that
    /// expired since, are dropped. A restored entry keeps only the lifetime
    /// it had left.
    pub fn restore(self, now: Instant, now_ms: i64) -> Vec<(String, CacheEntry<V>)> {
        let saved_at_ms = self.saved_at_ms;
        let mut live: Vec<_> = self
            .entries
            .into_iter()
            .filter(|entry| elapsed_ms(entry.created_at_ms, saved_at_ms) <= entry.ttl_ms)
            .filter(|entry| elapsed_ms(entry.created_at_ms, now_ms) <= entry.ttl_ms)
            .collect();
        live.sort_by_key(|entry| entry.last_accessed_ms);

        live.into_iter()
            .map(|persisted| {
                let age = elapsed_ms(persisted.created_at_ms, now_ms);
                let remaining = Duration::from_millis(persisted.ttl_ms - age);
                let idle = Duration::from_millis(elapsed_ms(persisted.last_accessed_ms, now_ms));

                let mut entry = CacheEntry::new(persisted.value, remaining, now);
                entry.last_accessed = now.checked_sub(idle).unwrap_or(now);
                (persisted.key, entry)
            })
            .collect()
    }
}

fn millis(duration: Duration) -> i64 {
    duration.as_millis().min(i64::MAX as u128) as i64
}

fn elapsed_ms(from_ms: i64, to_ms: i64) -> u64 {
    to_ms.saturating_sub(from_ms).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted(
        key: &str,
        created_at_ms: i64,
        ttl_ms: u64,
        last_accessed_ms: i64,
    ) -> PersistedEntry<String> {
        PersistedEntry {
            key: key.to_string(),
            value: key.to_uppercase(),
            created_at_ms,
            ttl_ms,
            last_accessed_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_drops_expired_and_keeps_remaining_ttl() {
        let payload = PersistedPayload {
            version: 1,
            saved_at_ms: 10_000,
            entries: vec![
                // expired before the snapshot was taken
                persisted("stale", 1_000, 5_000, 2_000),
                // alive at save time, expired by now
                persisted("lapsed", 9_000, 2_000, 9_500),
                persisted("fresh", 9_500, 10_000, 9_900),
                persisted("older", 9_000, 10_000, 9_100),
            ],
        };

        let now = Instant::now();
        let restored = payload.restore(now, 12_000);
        let keys: Vec<_> = restored.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["older", "fresh"]);

        let (_, fresh) = &restored[1];
        assert_eq!(fresh.value, "FRESH");
        assert_eq!(fresh.remaining_ttl(now), Duration::from_millis(7_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_skips_expired_entries() {
        let start = Instant::now();
        let mut entries = HashMap::new();
        entries.insert("short".to_string(), CacheEntry::new(1, Duration::from_millis(10), start));
        entries.insert("long".to_string(), CacheEntry::new(2, Duration::from_secs(10), start));

        tokio::time::advance(Duration::from_millis(100)).await;
        let payload = PersistedPayload::capture(3, &entries, Instant::now(), 50_000);

        assert_eq!(payload.version, 3);
        assert_eq!(payload.entries.len(), 1);
        let entry = &payload.entries[0];
        assert_eq!(entry.key, "long");
        assert_eq!(entry.value, 2);
        assert_eq!(entry.created_at_ms, 49_900);
        assert_eq!(entry.ttl_ms, 10_000);
    }
}
