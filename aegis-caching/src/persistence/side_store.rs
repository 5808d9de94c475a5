//! Durable side stores for persisted cache payloads

use log::debug;
use parking_lot::RwLock;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::CacheResult;

/// Opaque byte storage a persisted payload is mirrored to
pub trait SideStore: Send + Sync + 'static {
    /// Read the stored payload, `None` if nothing was saved yet
    fn load(&self) -> CacheResult<Option<Vec<u8>>>;

    /// Replace the stored payload
    fn save(&self, payload: &[u8]) -> CacheResult<()>;

    /// Remove the stored payload
    fn clear(&self) -> CacheResult<()>;
}

/// In-memory side store; clones share the same slot
#[derive(Debug, Clone, Default)]
pub struct MemorySideStore {
    slot: Arc<RwLock<Option<Vec<u8>>>>,
}

impl MemorySideStore {
    /// Create an empty side store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a side store already holding `payload`
    pub fn with_payload(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(payload.into()))),
        }
    }

    /// Copy of the stored payload
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.slot.read().clone()
    }
}

impl SideStore for MemorySideStore {
    fn load(&self) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.contents())
    }

    fn save(&self, payload: &[u8]) -> CacheResult<()> {
        *self.slot.write() = Some(payload.to_vec());
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        *self.slot.write() = None;
        Ok(())
    }
}

/// Side store backed by a single JSON file
///
/// Saves go to a sibling `.tmp` file that is then renamed over the target, so
/// a reader never sees a half-written payload.
#[derive(Debug, Clone)]
pub struct FileSideStore {
    path: PathBuf,
}

impl FileSideStore {
    /// Create a side store writing to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl SideStore for FileSideStore {
    fn load(&self) -> CacheResult<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, payload: &[u8]) -> CacheResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let temp = self.temp_path();
        std::fs::write(&temp, payload)?;
        std::fs::rename(&temp, &self.path)?;
        debug!("Persisted {} bytes to {}", payload.len(), self.path.display());
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_side_store_is_shared_between_clones() {
        let store = MemorySideStore::new();
        let other = store.clone();

        store.save(b"{}").unwrap();
        assert_eq!(other.load().unwrap(), Some(b"{}".to_vec()));

        other.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_file_side_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSideStore::new(dir.path().join("nested").join("cache.json"));

        assert_eq!(store.load().unwrap(), None);

        store.save(b"first").unwrap();
        store.save(b"second").unwrap();
        assert_eq!(store.load().unwrap(), Some(b"second".to_vec()));
        assert!(!store.temp_path().exists());

        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
