//! TTL + LRU key-value store
//!
//! Every mutation happens under one write lock on the entry map, so
//! capacity checks, eviction and insertion see the same size. Expired
//! entries are dropped lazily when read and in bulk by [`CacheStore::purge_expired`],
//! which the optional sweeper task runs on a fixed interval.
//!
//! Persistence only captures a snapshot while the lock is held; writing it
//! out happens after the lock is released.

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, CacheValue};
use crate::errors::CacheResult;
use crate::namespace::CacheNamespace;
use crate::pattern::KeyPattern;
use crate::persistence::{NoPersistence, PersistenceStrategy, Snapshot, WriteThrough};
use crate::stats::{CacheStats, StatsCollector};

/// Cache mirrored to a side store after every mutation
pub type PersistentCacheStore<V, S> = CacheStore<V, WriteThrough<S>>;

/// TTL-bounded, size-bounded cache keyed by strings
///
/// Clones share the same entries, so a store can be handed to several tasks.
pub struct CacheStore<V, P = NoPersistence> {
    inner: Arc<StoreInner<V, P>>,
}

struct StoreInner<V, P> {
    config: CacheConfig,
    state: RwLock<StoreState<V>>,
    in_flight: Mutex<HashMap<String, Flight<V>>>,
    persistence: P,
    stats: StatsCollector,
}

/// Shared computation for one key and the callers attached to it
struct Flight<V> {
    cell: Arc<OnceCell<V>>,
    members: usize,
}

/// A caller's membership in the computation for a key
///
/// Dropping it, including when the caller is cancelled mid-computation,
/// detaches the caller. The slot is released once the value is settled or
/// nobody is left to take over.
struct InFlight<'a, V, P> {
    inner: &'a StoreInner<V, P>,
    key: &'a str,
    cell: Arc<OnceCell<V>>,
}

impl<'a, V, P> InFlight<'a, V, P> {
    fn join(inner: &'a StoreInner<V, P>, key: &'a str) -> Self {
        let mut in_flight = inner.in_flight.lock();
        let flight = in_flight.entry(key.to_string()).or_insert_with(|| Flight {
            cell: Arc::new(OnceCell::new()),
            members: 0,
        });
        flight.members += 1;
        let cell = flight.cell.clone();
        drop(in_flight);

        Self { inner, key, cell }
    }
}

impl<V, P> Drop for InFlight<'_, V, P> {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight.lock();
        let Some(flight) = in_flight.get_mut(self.key) else {
            return;
        };
        if !Arc::ptr_eq(&flight.cell, &self.cell) {
            return;
        }

        flight.members -= 1;
        if flight.members == 0 || flight.cell.initialized() {
            in_flight.remove(self.key);
        }
    }
}

struct StoreState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    tick: u64,
}

impl<V> StoreState<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        before - self.entries.len()
    }

    fn evict_least_recent(&mut self) -> Option<String> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.access_tick)
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&key);
        Some(key)
    }
}

impl<V, P> Clone for CacheStore<V, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: CacheValue> CacheStore<V> {
    /// Create an in-memory store
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        Self::with_persistence(config, NoPersistence)
    }
}

impl<V: CacheValue> Default for CacheStore<V> {
    fn default() -> Self {
        Self::build(CacheConfig::default(), NoPersistence)
    }
}

impl<V, P> CacheStore<V, P>
where
    V: CacheValue,
    P: PersistenceStrategy<V>,
{
    /// Create a store that loads from and mirrors to `persistence`
    ///
    /// Entries restored from the strategy beyond `max_size` are evicted,
    /// least recently accessed first.
    pub fn with_persistence(config: CacheConfig, persistence: P) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self::build(config, persistence))
    }

    fn build(config: CacheConfig, persistence: P) -> Self {
        let mut state = StoreState {
            entries: HashMap::new(),
            tick: 0,
        };

        for (key, mut entry) in persistence.hydrate() {
            entry.access_tick = state.next_tick();
            state.entries.insert(key, entry);
        }
        while state.entries.len() > config.max_size {
            state.evict_least_recent();
        }
        if !state.entries.is_empty() {
            info!("Cache starting with {} restored entries", state.entries.len());
        }

        Self {
            inner: Arc::new(StoreInner {
                config,
                state: RwLock::new(state),
                in_flight: Mutex::new(HashMap::new()),
                persistence,
                stats: StatsCollector::default(),
            }),
        }
    }

    /// Store configuration
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Persistence strategy the store mirrors through
    pub fn persistence(&self) -> &P {
        &self.inner.persistence
    }

    /// Get a value, or `None` if it is missing or expired
    pub fn get(&self, key: &str) -> Option<V> {
        let mut state = self.inner.state.write();
        let now = Instant::now();
        let tick = state.next_tick();

        let expired = match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.touch(now, tick);
                self.inner.stats.record_hit();
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            state.entries.remove(key);
            self.inner.stats.record_expirations(1);
            debug!("Cache entry '{}' expired", key);
        }
        self.inner.stats.record_miss();
        None
    }

    /// Store a value under the default TTL
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.inner.config.default_ttl);
    }

    /// Store a value with an explicit TTL
    ///
    /// Inserting a new key into a full store first drops expired entries,
    /// then evicts the least recently accessed ones until there is room.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let max_size = self.inner.config.max_size;
        let mut state = self.inner.state.write();
        let now = Instant::now();

        if !state.entries.contains_key(&key) && state.entries.len() >= max_size {
            let expired = state.purge_expired(now);
            self.inner.stats.record_expirations(expired);

            while state.entries.len() >= max_size {
                match state.evict_least_recent() {
                    Some(evicted) => {
                        self.inner.stats.record_eviction();
                        debug!("Evicted cache entry '{}'", evicted);
                    }
                    None => break,
                }
            }
        }

        let mut entry = CacheEntry::new(value, ttl, now);
        entry.access_tick = state.next_tick();
        state.entries.insert(key, entry);
        self.inner.stats.record_put();

        let snapshot = self.inner.persistence.capture(&state.entries);
        drop(state);
        self.mirror(snapshot);
    }

    /// Return the cached value or compute, store and return it
    ///
    /// Concurrent misses on the same key share one computation: the first
    /// caller runs `factory` and the others wait for its result. A failed
    /// computation is returned to the caller that ran it and is never cached;
    /// a waiting caller then runs its own factory. `ttl` falls back to the
    /// configured default.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let flight = InFlight::join(self.inner.as_ref(), key);
        let result = flight
            .cell
            .get_or_try_init(|| async {
                // Another computation may have stored the value after our miss
                if let Some(value) = self.fresh(key) {
                    return Ok(value);
                }

                debug!("Cache miss for '{}', computing value", key);
                let value = factory().await?;
                let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
                self.set_with_ttl(key, value.clone(), ttl);
                Ok::<V, E>(value)
            })
            .await
            .cloned();

        drop(flight);
        result
    }

    /// Synchronous variant of [`get_or_set`](Self::get_or_set)
    pub fn get_or_set_sync<F>(&self, key: &str, ttl: Option<Duration>, factory: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(key) {
            return value;
        }

        let value = factory();
        self.set_with_ttl(key, value.clone(), ttl.unwrap_or(self.inner.config.default_ttl));
        value
    }

    /// Remove a key, returning whether it was present
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.inner.state.write();
        if state.entries.remove(key).is_none() {
            return false;
        }

        let snapshot = self.inner.persistence.capture(&state.entries);
        drop(state);
        self.mirror(snapshot);
        true
    }

    /// Remove every entry
    pub fn clear(&self) {
        let mut state = self.inner.state.write();
        state.entries.clear();
        let snapshot = self.inner.persistence.capture(&state.entries);
        drop(state);
        self.mirror(snapshot);
    }

    /// Remove every key matching `pattern`, returning how many were removed
    pub fn invalidate_pattern(&self, pattern: &KeyPattern) -> usize {
        self.remove_where(|key| pattern.matches(key))
    }

    /// Check if a live entry exists without touching its recency
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .state
            .read()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .state
            .read()
            .entries
            .values()
            .filter(|entry| !entry.is_expired_at(now))
            .count()
    }

    /// Check if there are no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.keys_where(|_| true)
    }

    /// Hit, miss, eviction and expiry counters
    pub fn stats(&self) -> CacheStats {
        let entry_count = self.inner.state.read().entries.len();
        self.inner.stats.snapshot(entry_count)
    }

    /// Key-prefix view over this store
    pub fn namespace(&self, prefix: &str) -> CacheNamespace<V, P> {
        CacheNamespace::new(self.clone(), prefix)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut state = self.inner.state.write();
        let expired = state.purge_expired(Instant::now());
        if expired == 0 {
            return 0;
        }

        self.inner.stats.record_expirations(expired);
        debug!("Purged {} expired cache entries", expired);
        let snapshot = self.inner.persistence.capture(&state.entries);
        drop(state);
        self.mirror(snapshot);
        expired
    }

    /// Wait until every mutation so far has been mirrored
    pub async fn flush(&self) {
        self.inner.persistence.flush().await;
    }

    /// Spawn a task that purges expired entries every `interval`
    ///
    /// The task only holds a weak reference and stops once every clone of
    /// the store has been dropped.
    pub fn start_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(&self.inner);
        tokio::spawn(sweep(store, interval.max(Duration::from_millis(1))))
    }

    pub(crate) fn remove_where(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut state = self.inner.state.write();
        let before = state.entries.len();
        state.entries.retain(|key, _| !predicate(key));
        let removed = before - state.entries.len();
        if removed == 0 {
            return 0;
        }

        let snapshot = self.inner.persistence.capture(&state.entries);
        drop(state);
        self.mirror(snapshot);
        removed
    }

    pub(crate) fn keys_where(&self, predicate: impl Fn(&str) -> bool) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .inner
            .state
            .read()
            .entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired_at(now) && predicate(key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Read a live value without counting a lookup or touching recency
    fn fresh(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.inner
            .state
            .read()
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.value.clone())
    }

    fn mirror(&self, snapshot: Option<Snapshot<V>>) {
        if let Some(snapshot) = snapshot {
            self.inner.persistence.persist(snapshot);
        }
    }
}

async fn sweep<V, P>(store: Weak<StoreInner<V, P>>, interval: Duration)
where
    V: CacheValue,
    P: PersistenceStrategy<V>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = store.upgrade() else {
            debug!("Cache dropped, stopping sweeper");
            break;
        };
        CacheStore { inner }.purge_expired();
    }
}
