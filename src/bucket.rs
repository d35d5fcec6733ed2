// One cache partition: path table, content-key table and the records
// stored under each cache key.
//
// Lock order is `tables` before `records` before any single record. The
// server never holds a bucket lock while taking a connection lock.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::binary::{BinaryReader, BinaryWriter, ReadError};
use crate::entries::{CHECK_ALL_INPUTS, CacheEntries, EntriesError, decode};
use crate::key::{BucketId, CacheKey, ContentKey};
use crate::table::{
    BitArray, CompactContentKeyTable, CompactPathTable, ContentTableError, PathTableError,
};

/// Version written at the head of every bucket file.
pub const BUCKET_VERSION: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum BucketError {
    #[error("bucket I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("truncated bucket data: {0}")]
    Read(#[from] ReadError),
    #[error("bucket file version {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("bucket checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("{0} trailing bytes after last record")]
    TrailingBytes(usize),
    #[error(transparent)]
    Path(#[from] PathTableError),
    #[error(transparent)]
    Content(#[from] ContentTableError),
    #[error("record {key}: {source}")]
    Entries {
        key: CacheKey,
        #[source]
        source: EntriesError,
    },
}

/// The two interning tables of a bucket, guarded together.
#[derive(Debug, Clone)]
pub struct Tables {
    pub paths: CompactPathTable,
    pub keys: CompactContentKeyTable,
}

pub type Record = Arc<RwLock<CacheEntries>>;

/// Size changes made by [`CacheBucket::rebuild_tables`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub path_bytes_before: u32,
    pub path_bytes_after: u32,
    pub key_bytes_before: u32,
    pub key_bytes_after: u32,
    pub dropped_records: usize,
}

#[derive(Debug)]
pub struct CacheBucket {
    id: BucketId,
    tables: RwLock<Tables>,
    records: RwLock<FxHashMap<CacheKey, Record>>,
    /// Milliseconds since database creation.
    last_used_time: AtomicU64,
    oldest_used_time: AtomicU64,
    needs_save: AtomicBool,
}

impl CacheBucket {
    pub fn new(id: BucketId) -> Self {
        Self::with_tables(
            id,
            Tables {
                paths: CompactPathTable::with_common_segments(
                    id.is_case_insensitive(),
                    id.version(),
                ),
                keys: CompactContentKeyTable::new(),
            },
            FxHashMap::default(),
        )
    }

    fn with_tables(id: BucketId, tables: Tables, records: FxHashMap<CacheKey, Record>) -> Self {
        Self {
            id,
            tables: RwLock::new(tables),
            records: RwLock::new(records),
            last_used_time: AtomicU64::new(0),
            oldest_used_time: AtomicU64::new(0),
            needs_save: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> BucketId {
        self.id
    }

    pub fn tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read()
    }

    /// Intern `(path, content key)` pairs, returning their content-key
    /// table offsets in the same order.
    pub fn intern(&self, items: &[(String, ContentKey)]) -> Result<Vec<u32>, BucketError> {
        let mut tables = self.tables.write();
        let mut out = Vec::with_capacity(items.len());
        for (path, key) in items {
            let path_offset = tables.paths.add(path)?;
            out.push(tables.keys.add(*key, path_offset)?);
        }
        if !items.is_empty() {
            self.mark_dirty();
        }
        Ok(out)
    }

    pub fn record(&self, key: &CacheKey) -> Option<Record> {
        self.records.read().get(key).cloned()
    }

    pub fn record_or_insert(&self, key: CacheKey) -> Record {
        if let Some(record) = self.record(&key) {
            return record;
        }
        self.records.write().entry(key).or_default().clone()
    }

    pub fn remove_record(&self, key: &CacheKey) -> Option<Record> {
        self.records.write().remove(key)
    }

    /// Snapshot of every record, sorted by key.
    pub fn records(&self) -> Vec<(CacheKey, Record)> {
        let mut out: Vec<(CacheKey, Record)> = self
            .records
            .read()
            .iter()
            .map(|(k, r)| (*k, r.clone()))
            .collect();
        out.sort_unstable_by_key(|(k, _)| *k);
        out
    }

    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    pub fn entry_count(&self) -> usize {
        self.records.read().values().map(|r| r.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn touch(&self, now: u64) {
        self.last_used_time.fetch_max(now, Ordering::Relaxed);
    }

    pub fn last_used_time(&self) -> u64 {
        self.last_used_time.load(Ordering::Relaxed)
    }

    /// Oldest last-touched time of any entry, as of the last load or
    /// maintenance.
    pub fn oldest_used_time(&self) -> u64 {
        self.oldest_used_time.load(Ordering::Relaxed)
    }

    pub fn refresh_oldest_used_time(&self) {
        let oldest = self
            .records
            .read()
            .values()
            .flat_map(|r| {
                let r = r.read();
                r.entries.iter().map(|e| e.last_touched()).min()
            })
            .min()
            .unwrap_or(0);
        self.oldest_used_time.store(oldest, Ordering::Relaxed);
    }

    pub fn mark_dirty(&self) {
        self.needs_save.store(true, Ordering::Release);
    }

    pub fn needs_save(&self) -> bool {
        self.needs_save.load(Ordering::Acquire)
    }

    /// Check every record; returns one line per broken record.
    pub fn validate(&self) -> Vec<String> {
        let starts = match self.tables.read().keys.record_offsets() {
            Ok(starts) => starts,
            Err(e) => return vec![format!("content-key table unreadable: {e}")],
        };
        let mut problems = Vec::new();
        for (key, record) in self.records() {
            let record = record.read();
            if let Err(e) = record.validate() {
                problems.push(format!("{key}: {e}"));
                continue;
            }
            match referenced_offsets(&record) {
                Ok(offsets) => {
                    if let Some(offset) = offsets
                        .into_iter()
                        .find(|o| starts.binary_search(o).is_err())
                    {
                        problems.push(format!(
                            "{key}: offset {offset} is not a content-key table record"
                        ));
                    }
                }
                Err(e) => problems.push(format!("{key}: {e}")),
            }
        }
        problems
    }

    // -----------------------------------------------------------------------
    // Table rebuild
    // -----------------------------------------------------------------------

    /// Rebuild both tables keeping only offsets referenced by records, then
    /// rewrite every record through the resulting offset map.
    ///
    /// Records that reference undecodable offsets or fail to remap are
    /// dropped and logged.
    pub fn rebuild_tables(&self) -> Result<RebuildStats, BucketError> {
        let mut tables = self.tables.write();
        let records = self.records();
        let key_size = tables.keys.size();
        let starts = tables.keys.record_offsets()?;

        let mut referenced: Vec<(CacheKey, Record, Vec<u32>)> = Vec::with_capacity(records.len());
        let mut dropped: Vec<CacheKey> = Vec::new();
        let mut used = BitArray::new(key_size);
        for (key, record) in records {
            let offsets = referenced_offsets(&record.read());
            match offsets {
                Ok(offsets) if offsets.iter().all(|o| starts.binary_search(o).is_ok()) => {
                    offsets.iter().for_each(|&o| {
                        used.set(o);
                    });
                    referenced.push((key, record, offsets));
                }
                Ok(_) => {
                    log::error!(
                        "bucket {}: record {key} references offsets that are not table records",
                        self.id
                    );
                    dropped.push(key);
                }
                Err(e) => {
                    log::error!("bucket {}: record {key} is corrupt: {e}", self.id);
                    dropped.push(key);
                }
            }
        }

        let mut paths = CompactPathTable::with_common_segments(
            self.id.is_case_insensitive(),
            self.id.version(),
        );
        let mut keys = CompactContentKeyTable::new();
        let mut memo = FxHashMap::default();
        let mut old_to_new = FxHashMap::default();
        let mut unreadable = FxHashSet::default();
        for offset in used.iter() {
            let copied = tables
                .keys
                .get_path_and_key(offset)
                .map_err(BucketError::from)
                .and_then(|(path, key)| {
                    let path = paths.add_from(&tables.paths, path, &mut memo)?;
                    Ok(keys.add(key, path)?)
                });
            match copied {
                Ok(new) => {
                    old_to_new.insert(offset, new);
                }
                Err(e) => {
                    log::warn!("bucket {}: offset {offset} unreadable: {e}", self.id);
                    unreadable.insert(offset);
                }
            }
        }

        let survivors: Vec<(CacheKey, Record)> = referenced
            .into_iter()
            .filter_map(|(key, record, offsets)| {
                if offsets.iter().any(|o| unreadable.contains(o)) {
                    dropped.push(key);
                    None
                } else {
                    Some((key, record))
                }
            })
            .collect();

        let failed: Vec<CacheKey> = survivors
            .par_iter()
            .filter_map(|(key, record)| match record.write().update_entries(&old_to_new) {
                Ok(()) => None,
                Err(e) => {
                    log::error!("bucket {}: record {key} failed to remap: {e}", self.id);
                    Some(*key)
                }
            })
            .collect();
        dropped.extend(failed);

        if !dropped.is_empty() {
            let mut map = self.records.write();
            for key in &dropped {
                map.remove(key);
            }
        }

        let stats = RebuildStats {
            path_bytes_before: tables.paths.size(),
            path_bytes_after: paths.size(),
            key_bytes_before: key_size,
            key_bytes_after: keys.size(),
            dropped_records: dropped.len(),
        };
        *tables = Tables { paths, keys };
        self.mark_dirty();
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn file_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.id.0.to_string())
    }

    /// Serialize the bucket with its trailing checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let tables = self.tables.read();
        let records = self.records();
        let mut w = BinaryWriter::new();
        w.write_u32(BUCKET_VERSION);
        w.write_u32(tables.paths.size());
        w.write_bytes(tables.paths.memory());
        w.write_u32(tables.keys.size());
        w.write_bytes(tables.keys.memory());
        w.write_u32(records.len() as u32);
        for (key, record) in &records {
            key.write(&mut w);
            record.read().write_disk(&mut w);
        }
        let checksum = adler32(w.as_slice());
        w.write_u32(checksum);
        w.into_inner()
    }

    pub fn from_bytes(id: BucketId, bytes: &[u8], validate: bool) -> Result<Self, BucketError> {
        let Some(body_len) = bytes.len().checked_sub(4) else {
            return Err(ReadError::UnexpectedEnd {
                position: 0,
                needed: 4,
                available: bytes.len(),
            }
            .into());
        };
        let (body, trailer) = bytes.split_at(body_len);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = adler32(body);
        if stored != computed {
            return Err(BucketError::ChecksumMismatch { stored, computed });
        }

        let mut r = BinaryReader::new(body);
        let version = r.read_u32()?;
        if version != BUCKET_VERSION {
            return Err(BucketError::VersionMismatch {
                found: version,
                expected: BUCKET_VERSION,
            });
        }
        let path_size = r.read_u32()? as usize;
        let paths = CompactPathTable::from_memory(
            r.read_bytes(path_size)?.to_vec(),
            id.is_case_insensitive(),
            id.version(),
        )?;
        let key_size = r.read_u32()? as usize;
        let keys = CompactContentKeyTable::from_memory(r.read_bytes(key_size)?.to_vec())?;

        let count = r.read_u32()?;
        let mut records = FxHashMap::default();
        for _ in 0..count {
            let key = CacheKey::read(&mut r)?;
            let entries = CacheEntries::read_disk(&mut r)
                .map_err(|source| BucketError::Entries { key, source })?;
            if validate {
                entries
                    .validate()
                    .map_err(|source| BucketError::Entries { key, source })?;
            }
            records.insert(key, Arc::new(RwLock::new(entries)));
        }
        if !r.is_empty() {
            return Err(BucketError::TrailingBytes(r.remaining()));
        }

        let bucket = Self::with_tables(id, Tables { paths, keys }, records);
        bucket.refresh_oldest_used_time();
        let last_used = bucket
            .records
            .read()
            .values()
            .flat_map(|r| r.read().entries.iter().map(|e| e.last_touched()).max())
            .max()
            .unwrap_or(0);
        bucket.touch(last_used);
        Ok(bucket)
    }

    pub fn load(id: BucketId, path: &Path, validate: bool) -> Result<Self, BucketError> {
        Self::from_bytes(id, &fs::read(path)?, validate)
    }

    /// Write the bucket atomically into `dir`, or delete its file when the
    /// bucket holds no records.
    pub fn save(&self, dir: &Path) -> Result<(), BucketError> {
        let path = self.file_path(dir);
        self.needs_save.store(false, Ordering::Release);
        if self.is_empty() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }
        let bytes = self.to_bytes();
        let result = write_atomic(dir, &path, &bytes);
        if result.is_err() {
            self.mark_dirty();
        }
        result.map_err(BucketError::from)
    }
}

/// Every content-key offset a record refers to, ascending and unique.
fn referenced_offsets(record: &CacheEntries) -> Result<Vec<u32>, EntriesError> {
    let mut out = decode("shared inputs", &record.shared_inputs)?;
    for entry in &record.entries {
        out.extend(decode("extra inputs", &entry.extra_inputs)?);
        out.extend(entry.output_offsets()?);
    }
    out.extend(
        record
            .inputs_that_are_outputs
            .iter()
            .filter(|&&o| o != CHECK_ALL_INPUTS),
    );
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

pub(crate) fn adler32(data: &[u8]) -> u32 {
    let mut hasher = simd_adler32::Adler32::new();
    hasher.write(data);
    hasher.finish()
}

pub(crate) fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::varint;
    use crate::key::BucketFlags;

    fn bucket() -> CacheBucket {
        CacheBucket::new(BucketId::new(7, 2, BucketFlags::empty()))
    }

    fn key(s: &str) -> ContentKey {
        ContentKey::from_content(s.as_bytes())
    }

    fn store(bucket: &CacheBucket, cmd: &str, inputs: &[&str], outputs: &[&str]) -> CacheKey {
        let items: Vec<(String, ContentKey)> = inputs
            .iter()
            .chain(outputs)
            .map(|p| (p.to_string(), key(p)))
            .collect();
        let offsets = bucket.intern(&items).unwrap();
        let (ins, outs) = offsets.split_at(inputs.len());
        let mut ins = ins.to_vec();
        ins.sort_unstable();
        let mut outs = outs.to_vec();
        outs.sort_unstable();

        let cache_key = CacheKey::from_command(cmd);
        let record = bucket.record_or_insert(cache_key);
        let mut record = record.write();
        let mut entry = record.build_inputs(&ins).unwrap();
        entry.outputs = varint::encode_all(&outs);
        record.push_front(entry);
        cache_key
    }

    fn flattened_paths(bucket: &CacheBucket, cache_key: &CacheKey) -> Vec<Vec<String>> {
        let record = bucket.record(cache_key).unwrap();
        let record = record.read();
        let tables = bucket.tables();
        record
            .entries
            .iter()
            .map(|e| {
                let mut paths: Vec<String> = record
                    .flatten(e)
                    .unwrap()
                    .into_iter()
                    .map(|o| tables.keys.get_path_string_and_key(&tables.paths, o).unwrap().0)
                    .collect();
                paths.sort();
                paths
            })
            .collect()
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let b = bucket();
        let k = store(&b, "cl a.cpp", &["/src/a.cpp", "/inc/a.h"], &["/out/a.obj"]);
        store(&b, "cl a.cpp", &["/src/a.cpp", "/inc/b.h"], &["/out/a.obj"]);
        b.save(dir.path()).unwrap();
        assert!(!b.needs_save());

        let loaded = CacheBucket::load(b.id(), &b.file_path(dir.path()), true).unwrap();
        assert_eq!(loaded.record_count(), 1);
        assert_eq!(loaded.entry_count(), 2);
        assert_eq!(flattened_paths(&loaded, &k), flattened_paths(&b, &k));
        assert!(loaded.validate().is_empty());
    }

    #[test]
    fn corrupt_file_is_rejected() {
        let b = bucket();
        store(&b, "cmd", &["/a"], &["/b"]);
        let mut bytes = b.to_bytes();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(matches!(
            CacheBucket::from_bytes(b.id(), &bytes, true),
            Err(BucketError::ChecksumMismatch { .. })
        ));
        assert!(CacheBucket::from_bytes(b.id(), &bytes[..3], true).is_err());
    }

    #[test]
    fn empty_bucket_deletes_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let b = bucket();
        let k = store(&b, "cmd", &["/a"], &["/b"]);
        b.save(dir.path()).unwrap();
        assert!(b.file_path(dir.path()).exists());
        b.remove_record(&k);
        b.save(dir.path()).unwrap();
        assert!(!b.file_path(dir.path()).exists());
    }

    #[test]
    fn rebuild_drops_unreferenced_content() {
        let b = bucket();
        let k = store(&b, "keep", &["/src/k.cpp", "/inc/common.h"], &["/out/k.obj"]);
        let gone = store(&b, "drop", &["/src/d.cpp", "/inc/other.h"], &["/out/d.obj"]);
        let before = flattened_paths(&b, &k);
        b.remove_record(&gone);

        let stats = b.rebuild_tables().unwrap();
        assert!(stats.key_bytes_after < stats.key_bytes_before);
        assert!(stats.path_bytes_after < stats.path_bytes_before);
        assert_eq!(stats.dropped_records, 0);
        assert_eq!(flattened_paths(&b, &k), before);
        assert_eq!(b.tables().keys.record_count(), 3);
        assert!(b.validate().is_empty());
    }

    #[test]
    fn rebuild_drops_corrupt_record() {
        let b = bucket();
        let good = store(&b, "good", &["/a"], &["/b"]);
        let bad = store(&b, "bad", &["/c"], &["/d"]);
        b.record(&bad).unwrap().write().entries[0].outputs = varint::encode_all(&[1_000_000]);
        assert_eq!(b.validate().len(), 1);

        let stats = b.rebuild_tables().unwrap();
        assert_eq!(stats.dropped_records, 1);
        assert!(b.record(&bad).is_none());
        assert!(b.record(&good).is_some());
        assert!(b.validate().is_empty());
    }

    #[test]
    fn offset_inside_a_record_is_rejected() {
        let b = bucket();
        let good = store(&b, "good", &["/a"], &["/b"]);
        let bad = store(&b, "bad", &["/c"], &["/d"]);
        // Offset 1 lies inside the first record, past its path varint.
        b.record(&bad).unwrap().write().entries[0].outputs = varint::encode_all(&[1]);
        let problems = b.validate();
        assert_eq!(problems.len(), 1, "{problems:?}");
        assert!(problems[0].contains("offset 1"), "{problems:?}");

        let stats = b.rebuild_tables().unwrap();
        assert_eq!(stats.dropped_records, 1);
        assert!(b.record(&bad).is_none());
        assert!(b.record(&good).is_some());
        assert!(b.validate().is_empty());
    }

    #[test]
    fn case_insensitive_bucket_folds_paths() {
        let b = bucket();
        let offsets = b
            .intern(&[
                ("/Src/A.cpp".into(), key("x")),
                ("/src/a.CPP".into(), key("x")),
            ])
            .unwrap();
        assert_eq!(offsets[0], offsets[1]);

        let sensitive = CacheBucket::new(BucketId::new(7, 2, BucketFlags::CASE_SENSITIVE));
        let offsets = sensitive
            .intern(&[
                ("/Src/A.cpp".into(), key("x")),
                ("/src/a.CPP".into(), key("x")),
            ])
            .unwrap();
        assert_ne!(offsets[0], offsets[1]);
    }
}
