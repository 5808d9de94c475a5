//! Persistence strategies for [`CacheStore`](crate::CacheStore)
//!
//! A store is generic over a [`PersistenceStrategy`]. [`NoPersistence`]
//! keeps everything in memory. [`WriteThrough`] hydrates from a
//! [`SideStore`] when the store is built and mirrors the full map back after
//! every mutation. Mirroring is best effort: failures are logged and the
//! cache call still succeeds.
//!
//! Mirroring happens in two steps. [`PersistenceStrategy::capture`] runs
//! under the store's write lock and only clones the live entries.
//! [`PersistenceStrategy::persist`] runs after the lock is released. Inside a
//! tokio runtime [`WriteThrough`] hands the write to the blocking pool, and a
//! single drain writes the newest pending snapshot, so a snapshot never
//! overwrites a later one.

mod payload;
mod side_store;

pub use payload::{PersistedEntry, PersistedPayload};
pub use side_store::{FileSideStore, MemorySideStore, SideStore};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::PersistenceConfig;
use crate::entry::{CacheEntry, CacheValue};
use crate::errors::{CacheError, CacheResult};
use payload::PayloadHeader;

/// Entries captured under the store's lock, waiting to be mirrored
#[derive(Debug, Clone)]
pub struct Snapshot<V> {
    /// Position in mutation order
    pub sequence: u64,
    pub payload: PersistedPayload<V>,
}

/// How a store loads and mirrors its contents
pub trait PersistenceStrategy<V>: Send + Sync + 'static {
    /// Entries to seed a new store with, least recently accessed first
    fn hydrate(&self) -> Vec<(String, CacheEntry<V>)>;

    /// Capture the current map, `None` when nothing is mirrored
    ///
    /// Called with the store's write lock held; must not block.
    fn capture(&self, entries: &HashMap<String, CacheEntry<V>>) -> Option<Snapshot<V>>;

    /// Mirror a captured snapshot; called after the store's lock is released
    fn persist(&self, snapshot: Snapshot<V>);

    /// Wait until every snapshot captured so far is mirrored or superseded
    fn flush(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

impl<V, P> PersistenceStrategy<V> for Box<P>
where
    P: PersistenceStrategy<V> + ?Sized,
{
    fn hydrate(&self) -> Vec<(String, CacheEntry<V>)> {
        (**self).hydrate()
    }

    fn capture(&self, entries: &HashMap<String, CacheEntry<V>>) -> Option<Snapshot<V>> {
        (**self).capture(entries)
    }

    fn persist(&self, snapshot: Snapshot<V>) {
        (**self).persist(snapshot)
    }

    fn flush(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        (**self).flush()
    }
}

/// Purely in-memory store
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPersistence;

impl<V> PersistenceStrategy<V> for NoPersistence {
    fn hydrate(&self) -> Vec<(String, CacheEntry<V>)> {
        Vec::new()
    }

    fn capture(&self, _entries: &HashMap<String, CacheEntry<V>>) -> Option<Snapshot<V>> {
        None
    }

    fn persist(&self, _snapshot: Snapshot<V>) {}
}

/// Mirror every mutation to a [`SideStore`] as a versioned JSON payload
///
/// Clones share the same side store and write queue.
pub struct WriteThrough<S> {
    mirror: Arc<Mirror<S>>,
}

impl<S> Clone for WriteThrough<S> {
    fn clone(&self) -> Self {
        Self {
            mirror: self.mirror.clone(),
        }
    }
}

struct Mirror<S> {
    side_store: S,
    version: u32,
    /// Last sequence handed out by `capture`
    sequence: AtomicU64,
    queue: Mutex<MirrorQueue>,
    /// Highest sequence written or given up on
    saved: watch::Sender<u64>,
}

#[derive(Default)]
struct MirrorQueue {
    pending: Option<(u64, Vec<u8>)>,
    draining: bool,
}

impl<S: SideStore> Mirror<S> {
    fn enqueue(self: &Arc<Self>, sequence: u64, bytes: Vec<u8>) {
        {
            let mut queue = self.queue.lock();
            if queue.pending.as_ref().is_some_and(|(pending, _)| *pending > sequence) {
                return;
            }
            queue.pending = Some((sequence, bytes));
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let mirror = self.clone();
                handle.spawn_blocking(move || mirror.drain());
            }
            Err(_) => self.drain(),
        }
    }

    fn drain(&self) {
        loop {
            let (sequence, bytes) = {
                let mut queue = self.queue.lock();
                match queue.pending.take() {
                    Some(next) => next,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            if sequence <= *self.saved.borrow() {
                debug!("Skipping superseded cache snapshot {}", sequence);
                continue;
            }
            if let Err(err) = self.side_store.save(&bytes) {
                warn!("Failed to persist cache snapshot {}: {}", sequence, err);
            }
            self.mark_saved(sequence);
        }
    }

    fn mark_saved(&self, sequence: u64) {
        self.saved.send_if_modified(|saved| {
            if sequence > *saved {
                *saved = sequence;
                true
            } else {
                false
            }
        });
    }
}

impl<S: SideStore> WriteThrough<S> {
    /// Mirror to `side_store`, tagging payloads with `version`
    pub fn new(side_store: S, version: u32) -> Self {
        let (saved, _) = watch::channel(0);
        Self {
            mirror: Arc::new(Mirror {
                side_store,
                version,
                sequence: AtomicU64::new(0),
                queue: Mutex::new(MirrorQueue::default()),
                saved,
            }),
        }
    }

    /// The underlying side store
    pub fn side_store(&self) -> &S {
        &self.mirror.side_store
    }

    /// Format version written and accepted
    pub fn version(&self) -> u32 {
        self.mirror.version
    }

    /// Read the stored payload, rejecting one written under another version
    pub fn load_payload<V: DeserializeOwned>(&self) -> CacheResult<Option<PersistedPayload<V>>> {
        let Some(bytes) = self.mirror.side_store.load()? else {
            return Ok(None);
        };

        let header: PayloadHeader = serde_json::from_slice(&bytes)?;
        if header.version != self.mirror.version {
            return Err(CacheError::VersionMismatch {
                expected: self.mirror.version,
                found: header.version,
            });
        }

        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Wait until every snapshot captured so far is written or superseded
    pub async fn flush(&self) {
        let target = self.mirror.sequence.load(Ordering::SeqCst);
        let mut saved = self.mirror.saved.subscribe();

        loop {
            let current = *saved.borrow_and_update();
            if current >= target || saved.changed().await.is_err() {
                break;
            }
        }
    }
}

impl<V, S> PersistenceStrategy<V> for WriteThrough<S>
where
    V: CacheValue + Serialize + DeserializeOwned,
    S: SideStore,
{
    fn hydrate(&self) -> Vec<(String, CacheEntry<V>)> {
        match self.load_payload::<V>() {
            Ok(Some(payload)) => {
                let restored = payload.restore(Instant::now(), now_ms());
                info!("Hydrated {} cache entries from side store", restored.len());
                restored
            }
            Ok(None) => Vec::new(),
            Err(err @ CacheError::VersionMismatch { .. }) => {
                warn!("Discarding persisted cache: {}", err);
                Vec::new()
            }
            Err(err) => {
                warn!("Discarding unreadable persisted cache: {}", err);
                Vec::new()
            }
        }
    }

    fn capture(&self, entries: &HashMap<String, CacheEntry<V>>) -> Option<Snapshot<V>> {
        let sequence = self.mirror.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let payload =
            PersistedPayload::capture(self.mirror.version, entries, Instant::now(), now_ms());
        Some(Snapshot { sequence, payload })
    }

    fn persist(&self, snapshot: Snapshot<V>) {
        match serde_json::to_vec(&snapshot.payload) {
            Ok(bytes) => self.mirror.enqueue(snapshot.sequence, bytes),
            Err(err) => {
                warn!(
                    "Failed to serialize cache ({} entries): {}",
                    snapshot.payload.entries.len(),
                    err
                );
                self.mirror.mark_saved(snapshot.sequence);
            }
        }
    }

    fn flush(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(WriteThrough::<S>::flush(self))
    }
}

/// Build the strategy a [`PersistenceConfig`] asks for
pub fn strategy_from_config<V>(config: &PersistenceConfig) -> Box<dyn PersistenceStrategy<V>>
where
    V: CacheValue + Serialize + DeserializeOwned,
{
    match (config.enabled, &config.path) {
        (true, Some(path)) => Box::new(WriteThrough::new(
            FileSideStore::new(path.clone()),
            config.format_version,
        )),
        (true, None) => {
            warn!("Cache persistence enabled without a path, keeping the cache in memory");
            Box::new(NoPersistence)
        }
        (false, _) => Box::new(NoPersistence),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entries(key: &str, value: &str) -> HashMap<String, CacheEntry<String>> {
        let mut entries = HashMap::new();
        entries.insert(
            key.to_string(),
            CacheEntry::new(value.to_string(), Duration::from_secs(60), Instant::now()),
        );
        entries
    }

    #[tokio::test]
    async fn test_version_mismatch_is_reported() {
        let side_store =
            MemorySideStore::with_payload(r#"{"version":1,"saved_at_ms":0,"entries":[]}"#);
        let strategy = WriteThrough::new(side_store, 2);

        let error = strategy.load_payload::<String>().unwrap_err();
        assert!(matches!(
            error,
            CacheError::VersionMismatch {
                expected: 2,
                found: 1
            }
        ));
        assert!(PersistenceStrategy::<String>::hydrate(&strategy).is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_discarded() {
        let strategy = WriteThrough::new(MemorySideStore::with_payload("not json"), 1);
        assert!(PersistenceStrategy::<String>::hydrate(&strategy).is_empty());
    }

    #[tokio::test]
    async fn test_persist_then_hydrate() {
        let side_store = MemorySideStore::new();
        let strategy = WriteThrough::new(side_store.clone(), 1);

        let snapshot = strategy.capture(&entries("ai:summary", "cached")).unwrap();
        strategy.persist(snapshot);
        strategy.flush().await;
        assert!(side_store.contents().is_some());

        let restored: Vec<(String, CacheEntry<String>)> = strategy.hydrate();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].0, "ai:summary");
        assert_eq!(restored[0].1.value, "cached");
    }

    #[tokio::test]
    async fn test_older_snapshot_never_replaces_newer() {
        let side_store = MemorySideStore::new();
        let strategy = WriteThrough::new(side_store.clone(), 1);

        let older = strategy.capture(&entries("k", "older")).unwrap();
        let newer = strategy.capture(&entries("k", "newer")).unwrap();
        assert!(older.sequence < newer.sequence);

        strategy.persist(newer);
        strategy.flush().await;
        strategy.persist(older);
        strategy.flush().await;

        let restored: Vec<(String, CacheEntry<String>)> = strategy.hydrate();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].1.value, "newer");
    }

    #[test]
    fn test_persist_outside_runtime_writes_inline() {
        let side_store = MemorySideStore::new();
        let strategy = WriteThrough::new(side_store.clone(), 1);

        let snapshot = strategy.capture(&entries("k", "v")).unwrap();
        strategy.persist(snapshot);
        assert!(side_store.contents().is_some());
    }

    #[test]
    fn test_strategy_from_config() {
        let disabled = PersistenceConfig::default();
        let strategy = strategy_from_config::<u32>(&disabled);
        assert!(strategy.hydrate().is_empty());
        assert!(strategy.capture(&HashMap::new()).is_none());
    }
}
