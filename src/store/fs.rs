// Directory-backed content store.
//
// Blobs live zlib compressed at `<root>/<first two hex digits>/<hex key>`.
// The index of sizes and access order is rebuilt by scanning on open.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{AccessIndex, ContentStore, StoreError};
use crate::key::ContentKey;

#[derive(Debug, Default)]
struct Index {
    sizes: FxHashMap<ContentKey, u64>,
    access: AccessIndex,
    deleted: FxHashSet<ContentKey>,
    total: u64,
}

impl Index {
    fn insert(&mut self, key: ContentKey, size: u64) {
        if let Some(old) = self.sizes.insert(key, size) {
            self.total -= old;
        }
        self.total += size;
        self.access.touch(key);
    }

    fn remove(&mut self, key: &ContentKey) -> bool {
        match self.sizes.remove(key) {
            Some(size) => {
                self.total -= size;
                self.access.remove(key);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
pub struct FsContentStore {
    root: PathBuf,
    capacity: Option<u64>,
    index: Mutex<Index>,
}

impl FsContentStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, capacity: Option<u64>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let mut index = Index::default();
        let mut found = Vec::new();
        for shard in fs::read_dir(&root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(shard.path())? {
                let file = file?;
                let name = file.file_name();
                let Some(key) = name.to_str().and_then(ContentKey::from_hex) else {
                    log::warn!("ignoring stray file {}", file.path().display());
                    continue;
                };
                let meta = file.metadata()?;
                found.push((meta.modified().ok(), key, meta.len()));
            }
        }
        // Oldest modification first so eviction order survives a restart.
        found.sort_by_key(|(modified, _, _)| *modified);
        for (_, key, size) in found {
            index.insert(key, size);
        }
        log::info!(
            "content store at {} holds {} blobs ({} bytes)",
            root.display(),
            index.sizes.len(),
            index.total
        );
        Ok(Self {
            root,
            capacity,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &ContentKey) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }

    fn evict_over_capacity(&self, index: &mut Index, keep: &ContentKey) {
        let Some(capacity) = self.capacity else {
            return;
        };
        while index.total > capacity {
            let Some(oldest) = index.access.oldest() else {
                break;
            };
            if oldest == *keep {
                break;
            }
            if let Err(e) = fs::remove_file(self.blob_path(&oldest))
                && e.kind() != io::ErrorKind::NotFound
            {
                log::warn!("failed to evict {oldest}: {e}");
                break;
            }
            index.remove(&oldest);
            index.deleted.insert(oldest);
        }
    }
}

impl ContentStore for FsContentStore {
    fn has_content(&self, key: &ContentKey) -> bool {
        self.index.lock().sizes.contains_key(key)
    }

    fn store_content(&self, data: &[u8]) -> Result<ContentKey, StoreError> {
        let key = ContentKey::from_content(data);
        if self.has_content(&key) {
            self.mark_accessed(&key);
            return Ok(key);
        }

        let path = self.blob_path(&key);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&compressed)?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;

        let mut index = self.index.lock();
        index.insert(key, compressed.len() as u64);
        index.deleted.remove(&key);
        self.evict_over_capacity(&mut index, &key);
        Ok(key)
    }

    fn read_content(&self, key: &ContentKey) -> Result<Option<Vec<u8>>, StoreError> {
        let compressed = match fs::read(self.blob_path(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        ZlibDecoder::new(compressed.as_slice())
            .read_to_end(&mut data)
            .map_err(|e| StoreError::Corrupt {
                key: *key,
                reason: format!("zlib decompression failed: {e}"),
            })?;
        if ContentKey::from_content(&data) != *key {
            return Err(StoreError::Corrupt {
                key: *key,
                reason: "content hash mismatch".into(),
            });
        }
        self.mark_accessed(key);
        Ok(Some(data))
    }

    fn content_keys(&self) -> Vec<(ContentKey, u64)> {
        let index = self.index.lock();
        index.sizes.iter().map(|(k, s)| (*k, *s)).collect()
    }

    fn take_deleted(&self) -> FxHashSet<ContentKey> {
        std::mem::take(&mut self.index.lock().deleted)
    }

    fn drop_content(&self, key: &ContentKey) -> Result<(), StoreError> {
        match fs::remove_file(self.blob_path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.index.lock().remove(key);
        Ok(())
    }

    fn mark_accessed(&self, key: &ContentKey) {
        let mut index = self.index.lock();
        if index.sizes.contains_key(key) {
            index.access.touch(*key);
        }
    }

    fn total_size(&self) -> u64 {
        self.index.lock().total
    }
}
