//! Key-prefix views over a shared store

use std::future::Future;
use std::time::Duration;

use crate::entry::CacheValue;
use crate::pattern::KeyPattern;
use crate::persistence::{NoPersistence, PersistenceStrategy};
use crate::store::CacheStore;

/// Separator between a namespace prefix and the key
pub const NAMESPACE_SEPARATOR: char = ':';

/// A region of a [`CacheStore`] whose keys all start with `"<prefix>:"`
///
/// Namespaces share the physical store and its capacity bound, but each
/// can be cleared on its own. Keys passed to and returned from a namespace
/// are unprefixed.
pub struct CacheNamespace<V, P = NoPersistence> {
    store: CacheStore<V, P>,
    prefix: String,
}

impl<V, P> Clone for CacheNamespace<V, P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            prefix: self.prefix.clone(),
        }
    }
}

impl<V, P> CacheNamespace<V, P>
where
    V: CacheValue,
    P: PersistenceStrategy<V>,
{
    pub(crate) fn new(store: CacheStore<V, P>, name: &str) -> Self {
        Self {
            store,
            prefix: format!("{name}{NAMESPACE_SEPARATOR}"),
        }
    }

    /// Full prefix including the trailing separator
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The underlying store
    pub fn store(&self) -> &CacheStore<V, P> {
        &self.store
    }

    /// Physical key for `key`
    pub fn qualify(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Nested namespace, e.g. `"a"` then `"b"` gives keys under `"a:b:"`
    pub fn namespace(&self, name: &str) -> CacheNamespace<V, P> {
        CacheNamespace {
            store: self.store.clone(),
            prefix: format!("{}{name}{NAMESPACE_SEPARATOR}", self.prefix),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.store.get(&self.qualify(key))
    }

    pub fn set(&self, key: &str, value: V) {
        self.store.set(self.qualify(key), value);
    }

    pub fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        self.store.set_with_ttl(self.qualify(key), value, ttl);
    }

    /// See [`CacheStore::get_or_set`]
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
        self.store.get_or_set(&self.qualify(key), ttl, factory).await
    }

    pub fn get_or_set_sync<F>(&self, key: &str, ttl: Option<Duration>, factory: F) -> V
    where
        F: FnOnce() -> V,
    {
        self.store.get_or_set_sync(&self.qualify(key), ttl, factory)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.store.delete(&self.qualify(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.contains(&self.qualify(key))
    }

    /// Remove every key in this namespace, including nested ones
    pub fn clear(&self) -> usize {
        self.store.remove_where(|key| key.starts_with(&self.prefix))
    }

    /// Remove keys of this namespace whose unprefixed form matches `pattern`
    pub fn invalidate_pattern(&self, pattern: &KeyPattern) -> usize {
        self.store.remove_where(|key| {
            key.strip_prefix(&self.prefix)
                .is_some_and(|local| pattern.matches(local))
        })
    }

    /// Live keys of this namespace, unprefixed and sorted
    pub fn keys(&self) -> Vec<String> {
        self.store
            .keys_where(|key| key.starts_with(&self.prefix))
            .into_iter()
            .map(|key| key[self.prefix.len()..].to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
