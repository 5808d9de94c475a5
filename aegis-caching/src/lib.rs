//! Response caching for Aegis
//!
//! [`CacheStore`] is a TTL + LRU key-value store with namespaces, pattern
//! invalidation, a background expiry sweep and single-flight
//! [`get_or_set`](CacheStore::get_or_set). Persistence is pluggable: the
//! default keeps everything in memory, [`WriteThrough`] mirrors the store to
//! a [`SideStore`] and hydrates from it on construction.

pub mod config;
pub mod entry;
pub mod errors;
pub mod namespace;
pub mod pattern;
pub mod persistence;
pub mod stats;
pub mod store;

pub use config::{CacheConfig, PersistenceConfig};
pub use entry::{CacheEntry, CacheValue};
pub use errors::{CacheError, CacheResult};
pub use namespace::CacheNamespace;
pub use pattern::KeyPattern;
pub use persistence::{
    strategy_from_config, FileSideStore, MemorySideStore, NoPersistence, PersistedPayload,
    PersistenceStrategy, SideStore, Snapshot, WriteThrough,
};
pub use stats::CacheStats;
pub use store::{CacheStore, PersistentCacheStore};

/// Create a store from configuration, mirroring to a file when persistence is enabled
pub fn create_cache<V>(
    config: CacheConfig,
) -> CacheResult<CacheStore<V, Box<dyn PersistenceStrategy<V>>>>
where
    V: CacheValue + serde::Serialize + serde::de::DeserializeOwned,
{
    let strategy = strategy_from_config(&config.persistence);
    CacheStore::with_persistence(config, strategy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_cache_with_file_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::default();
        config.persistence.enabled = true;
        config.persistence.path = Some(dir.path().join("cache.json"));

        let cache = create_cache::<String>(config.clone()).unwrap();
        cache.set("ai:summary", "cached".to_string());
        cache.flush().await;
        drop(cache);

        let restored = create_cache::<String>(config).unwrap();
        assert_eq!(restored.get("ai:summary"), Some("cached".to_string()));
    }
}
