// On-disk database: `cachedb` plus one file per bucket under `buckets/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use super::{CacheServer, CacheServerConfig, ServerError};
use crate::binary::{BinaryReader, BinaryWriter};
use crate::bucket::{CacheBucket, adler32, write_atomic};
use crate::clock::Clock;
use crate::key::BucketId;

pub(crate) const DB_VERSION: u32 = 1;
pub(crate) const DB_FILE: &str = "cachedb";
const BUCKETS_DIR: &str = "buckets";

pub(super) fn buckets_dir(root: &Path) -> PathBuf {
    root.join(BUCKETS_DIR)
}

/// Outcome of [`CacheServer::save`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveStats {
    pub written: usize,
    pub failed: usize,
}

fn encode_db(creation_time: u64) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_u32(DB_VERSION);
    w.write_u64(creation_time);
    let checksum = adler32(w.as_slice());
    w.write_u32(checksum);
    w.into_inner()
}

fn decode_db(bytes: &[u8]) -> Result<u64, String> {
    let mut r = BinaryReader::new(bytes);
    let version = r.read_u32().map_err(|e| e.to_string())?;
    if version != DB_VERSION {
        return Err(format!("version {version}, expected {DB_VERSION}"));
    }
    let creation_time = r.read_u64().map_err(|e| e.to_string())?;
    let stored = r.read_u32().map_err(|e| e.to_string())?;
    let computed = adler32(&bytes[..12]);
    if stored != computed {
        return Err(format!("checksum {stored:#010x}, computed {computed:#010x}"));
    }
    if !r.is_empty() {
        return Err(format!("{} trailing bytes", r.remaining()));
    }
    Ok(creation_time)
}

/// Remove every bucket file, keeping the directory.
fn clear_buckets_dir(dir: &Path) -> io::Result<()> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                fs::remove_file(entry?.path())?;
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Load the database under `root`, starting fresh when it is missing or
/// unreadable. Corrupt buckets are logged, deleted and skipped.
pub(super) fn load(
    root: &Path,
    config: &CacheServerConfig,
    clock: &dyn Clock,
    pool: &rayon::ThreadPool,
) -> Result<(u64, FxHashMap<BucketId, Arc<CacheBucket>>), ServerError> {
    fs::create_dir_all(root)?;
    let db_path = root.join(DB_FILE);
    let dir = buckets_dir(root);

    let creation_time = match fs::read(&db_path) {
        Ok(bytes) => match decode_db(&bytes) {
            Ok(t) => Some(t),
            Err(reason) => {
                log::warn!("{}: {reason}; starting with an empty cache", db_path.display());
                None
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let Some(creation_time) = creation_time else {
        clear_buckets_dir(&dir)?;
        let now = clock.now_ms();
        write_atomic(root, &db_path, &encode_db(now))?;
        log::info!("created cache database in {}", root.display());
        return Ok((now, FxHashMap::default()));
    };

    let mut files = Vec::new();
    match fs::read_dir(&dir) {
        Ok(entries) => {
            for entry in entries {
                let path = entry?.path();
                let id = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.parse::<u64>().ok());
                match id {
                    Some(id) => files.push((BucketId(id), path)),
                    None => {
                        log::debug!("removing stray file {}", path.display());
                        fs::remove_file(&path)?;
                    }
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let loaded: Vec<Option<(BucketId, Arc<CacheBucket>)>> = pool.install(|| {
        files
            .par_iter()
            .map(|(id, path)| match CacheBucket::load(*id, path, config.validate_on_load) {
                Ok(bucket) => Some((*id, Arc::new(bucket))),
                Err(e) => {
                    log::error!("bucket {id}: failed to load {}: {e}", path.display());
                    if let Err(e) = fs::remove_file(path) {
                        log::error!("bucket {id}: failed to delete {}: {e}", path.display());
                    }
                    None
                }
            })
            .collect()
    });

    let buckets: FxHashMap<BucketId, Arc<CacheBucket>> = loaded.into_iter().flatten().collect();
    let entries: usize = buckets.values().map(|b| b.entry_count()).sum();
    log::info!(
        "loaded {} buckets with {entries} entries from {}",
        buckets.len(),
        root.display()
    );
    Ok((creation_time, buckets))
}

impl CacheServer {
    /// Write dirty buckets and the database file. A bucket that fails to
    /// save is logged and stays dirty.
    pub fn save(&self) -> Result<SaveStats, ServerError> {
        let Some(root) = self.root_dir() else {
            return Ok(SaveStats::default());
        };
        let dir = buckets_dir(root);
        fs::create_dir_all(&dir)?;

        let buckets = self.buckets();
        let mut stats = SaveStats::default();
        for bucket in buckets.iter().filter(|b| b.needs_save()) {
            match bucket.save(&dir) {
                Ok(()) => stats.written += 1,
                Err(e) => {
                    stats.failed += 1;
                    log::error!("bucket {}: save failed: {e}", bucket.id());
                }
            }
        }

        // Files of buckets that no longer exist.
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            if !buckets.iter().any(|b| b.id().0 == id) {
                log::debug!("removing stale bucket file {}", path.display());
                fs::remove_file(&path)?;
            }
        }

        let creation_time = self.creation_time.load(Ordering::Relaxed);
        write_atomic(root, &root.join(DB_FILE), &encode_db(creation_time))?;
        log::debug!("saved {} buckets", stats.written);
        Ok(stats)
    }
}
