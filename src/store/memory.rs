// In-memory content store with optional capacity eviction.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{AccessIndex, ContentStore, StoreError};
use crate::key::ContentKey;

#[derive(Debug, Default)]
struct Inner {
    blobs: FxHashMap<ContentKey, Vec<u8>>,
    access: AccessIndex,
    deleted: FxHashSet<ContentKey>,
    total: u64,
}

impl Inner {
    fn remove(&mut self, key: &ContentKey) -> bool {
        match self.blobs.remove(key) {
            Some(blob) => {
                self.total -= blob.len() as u64;
                self.access.remove(key);
                true
            }
            None => false,
        }
    }
}

/// Blob store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    inner: Mutex<Inner>,
    capacity: Option<u64>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that evicts least recently accessed blobs above `bytes`.
    pub fn with_capacity(bytes: u64) -> Self {
        Self {
            inner: Mutex::default(),
            capacity: Some(bytes),
        }
    }

    /// Remove `key` as if the store had evicted it.
    pub fn evict(&self, key: &ContentKey) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.remove(key);
        if removed {
            inner.deleted.insert(*key);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStore for MemoryContentStore {
    fn has_content(&self, key: &ContentKey) -> bool {
        self.inner.lock().blobs.contains_key(key)
    }

    fn store_content(&self, data: &[u8]) -> Result<ContentKey, StoreError> {
        let key = ContentKey::from_content(data);
        let mut inner = self.inner.lock();
        if !inner.blobs.contains_key(&key) {
            inner.total += data.len() as u64;
            inner.blobs.insert(key, data.to_vec());
            inner.deleted.remove(&key);
        }
        inner.access.touch(key);

        if let Some(capacity) = self.capacity {
            while inner.total > capacity {
                let Some(oldest) = inner.access.oldest() else {
                    break;
                };
                if oldest == key {
                    break;
                }
                log::debug!("evicting {oldest} to stay under {capacity} bytes");
                inner.remove(&oldest);
                inner.deleted.insert(oldest);
            }
        }
        Ok(key)
    }

    fn read_content(&self, key: &ContentKey) -> Result<Option<Vec<u8>>, StoreError> {
        let mut inner = self.inner.lock();
        let blob = inner.blobs.get(key).cloned();
        if blob.is_some() {
            inner.access.touch(*key);
        }
        Ok(blob)
    }

    fn content_keys(&self) -> Vec<(ContentKey, u64)> {
        let inner = self.inner.lock();
        inner
            .blobs
            .iter()
            .map(|(k, v)| (*k, v.len() as u64))
            .collect()
    }

    fn take_deleted(&self) -> FxHashSet<ContentKey> {
        std::mem::take(&mut self.inner.lock().deleted)
    }

    fn drop_content(&self, key: &ContentKey) -> Result<(), StoreError> {
        self.inner.lock().remove(key);
        Ok(())
    }

    fn mark_accessed(&self, key: &ContentKey) {
        let mut inner = self.inner.lock();
        if inner.blobs.contains_key(key) {
            inner.access.touch(*key);
        }
    }

    fn total_size(&self) -> u64 {
        self.inner.lock().total
    }
}
