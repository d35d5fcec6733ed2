// Content-addressed blob storage behind the cache server.
//
// The cache server never looks inside blobs. It asks whether content
// exists, learns which keys the store dropped on its own (capacity
// eviction), and tells it which blobs are no longer referenced.

use std::collections::BTreeMap;
use std::io;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::key::ContentKey;

mod memory;
pub use memory::MemoryContentStore;

#[cfg(feature = "fs-store")]
mod fs;
#[cfg(feature = "fs-store")]
pub use fs::FsContentStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("content store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("stored content for {key} is corrupt: {reason}")]
    Corrupt { key: ContentKey, reason: String },
}

/// Blob store consulted by the cache server.
pub trait ContentStore: Send + Sync {
    fn has_content(&self, key: &ContentKey) -> bool;

    /// Store `data` under its SHA-256 and return the key.
    fn store_content(&self, data: &[u8]) -> Result<ContentKey, StoreError>;

    /// Read content back, `None` when absent.
    fn read_content(&self, key: &ContentKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Every stored key with its stored size.
    fn content_keys(&self) -> Vec<(ContentKey, u64)>;

    /// Keys the store removed on its own since the previous call.
    fn take_deleted(&self) -> FxHashSet<ContentKey>;

    /// Remove content the cache no longer references.
    fn drop_content(&self, key: &ContentKey) -> Result<(), StoreError>;

    /// Refresh the eviction order of `key`.
    fn mark_accessed(&self, key: &ContentKey);

    /// Total bytes held.
    fn total_size(&self) -> u64;
}

/// Least-recently-accessed ordering shared by the stores.
#[derive(Debug, Default)]
pub(crate) struct AccessIndex {
    tick: u64,
    by_key: FxHashMap<ContentKey, u64>,
    by_tick: BTreeMap<u64, ContentKey>,
}

impl AccessIndex {
    pub(crate) fn touch(&mut self, key: ContentKey) {
        self.tick += 1;
        if let Some(old) = self.by_key.insert(key, self.tick) {
            self.by_tick.remove(&old);
        }
        self.by_tick.insert(self.tick, key);
    }

    pub(crate) fn remove(&mut self, key: &ContentKey) {
        if let Some(tick) = self.by_key.remove(key) {
            self.by_tick.remove(&tick);
        }
    }

    /// Least recently accessed key.
    pub(crate) fn oldest(&self) -> Option<ContentKey> {
        self.by_tick.values().next().copied()
    }
}
