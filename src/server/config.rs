// Cache server tuning.

use std::path::PathBuf;
use std::time::Duration;

/// Largest fetch response a client accepts.
pub const DEFAULT_FETCH_RESPONSE_CAP: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct CacheServerConfig {
    /// Directory holding `cachedb` and `buckets/`. `None` keeps everything
    /// in memory.
    pub root_dir: Option<PathBuf>,
    /// Entries neither created nor used within this window are deleted.
    /// `None` disables expiry.
    pub expiration: Option<Duration>,
    /// Content-key table size above which a bucket's expiry is shortened.
    /// Zero disables the cap.
    pub bucket_content_table_max_size: u64,
    /// Delete entries whose inputs were outputs of deleted content.
    pub check_inputs_for_deleted_content: bool,
    /// Adds after which periodic maintenance runs.
    pub maintenance_add_threshold: u64,
    pub fetch_response_cap: usize,
    pub maintenance_workers: usize,
    pub validate_on_load: bool,
    /// Replace an entry with identical inputs but different outputs.
    pub replace_on_output_mismatch: bool,
}

impl Default for CacheServerConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            root_dir: None,
            expiration: Some(Duration::from_secs(3 * 24 * 60 * 60)),
            bucket_content_table_max_size: 32 * 1024 * 1024,
            check_inputs_for_deleted_content: true,
            maintenance_add_threshold: 10_000,
            fetch_response_cap: DEFAULT_FETCH_RESPONSE_CAP,
            maintenance_workers: cores.saturating_sub(1).max(1),
            validate_on_load: true,
            replace_on_output_mismatch: true,
        }
    }
}

impl CacheServerConfig {
    /// In-memory configuration rooted nowhere, for tests and tools.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: Some(root.into()),
            ..Self::default()
        }
    }
}
