//! The cache server: buckets, connections and the request lifecycle.
//!
//! A [`CacheServer`] is a plain context object. Transports call
//! [`CacheServer::handle_message`] for every framed request and
//! [`CacheServer::on_disconnected`] when a client goes away; a
//! maintenance thread calls [`CacheServer::run_maintenance`].
//!
//! Lock order: `buckets` map, then per-bucket locks (see [`crate::bucket`]).
//! Connection state has its own lock, which is never taken while any
//! bucket lock is held.

mod command;
pub mod config;
mod gate;
mod handlers;
mod maintenance;
mod persist;
pub mod protocol;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::bucket::{BucketError, CacheBucket};
use crate::clock::Clock;
use crate::entries::CacheEntry;
use crate::key::{BucketId, CacheKey};
use crate::store::{ContentStore, StoreError};
use crate::table::{CompactContentKeyTable, CompactPathTable};

pub use config::CacheServerConfig;
use gate::AdmissionGate;
pub use maintenance::MaintenanceReport;
pub use persist::SaveStats;
pub use protocol::{MessageType, PROTOCOL_VERSION, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Bucket(#[from] BucketError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to start maintenance workers: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Tables a client has uploaded for one bucket, in the client's offsets.
#[derive(Debug)]
struct ClientTables {
    paths: CompactPathTable,
    keys: CompactContentKeyTable,
}

impl ClientTables {
    fn new(bucket: BucketId) -> Self {
        Self {
            paths: CompactPathTable::new(bucket.is_case_insensitive(), bucket.version()),
            keys: CompactContentKeyTable::new(),
        }
    }
}

#[derive(Debug)]
struct Connection {
    hint: String,
    mirrors: FxHashMap<BucketId, ClientTables>,
    /// Entries waiting for their output content.
    deferred: FxHashMap<(BucketId, CacheKey), CacheEntry>,
    stores: u64,
    fetches: u64,
    hits: u64,
}

impl Connection {
    fn new(hint: String) -> Self {
        Self {
            hint,
            mirrors: FxHashMap::default(),
            deferred: FxHashMap::default(),
            stores: 0,
            fetches: 0,
            hits: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    peak_connections: AtomicUsize,
    longest_maintenance_ms: AtomicU64,
}

pub struct CacheServer {
    config: CacheServerConfig,
    store: Arc<dyn ContentStore>,
    clock: Arc<dyn Clock>,
    /// Unix milliseconds; entry times count from here.
    creation_time: AtomicU64,
    buckets: RwLock<FxHashMap<BucketId, Arc<CacheBucket>>>,
    connections: Mutex<FxHashMap<u32, Arc<Mutex<Connection>>>>,
    gate: AdmissionGate,
    adds_since_maintenance: AtomicU64,
    force_maintenance: AtomicBool,
    wipe_requested: AtomicBool,
    shutdown_requested: AtomicBool,
    /// Buckets with a corrupt record; maintenance rebuilds them.
    needs_rebuild: Mutex<FxHashSet<BucketId>>,
    stats: Stats,
    maintenance_pool: rayon::ThreadPool,
}

impl std::fmt::Debug for CacheServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheServer")
            .field("root_dir", &self.config.root_dir)
            .field("buckets", &self.bucket_count())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl CacheServer {
    /// Build a server, loading the database under `config.root_dir` when
    /// one is configured.
    pub fn open(
        config: CacheServerConfig,
        store: Arc<dyn ContentStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServerError> {
        let maintenance_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.maintenance_workers.max(1))
            .thread_name(|i| format!("stepcache-maint-{i}"))
            .build()?;

        let (creation_time, buckets) = match &config.root_dir {
            Some(root) => persist::load(root, &config, clock.as_ref(), &maintenance_pool)?,
            None => (clock.now_ms(), FxHashMap::default()),
        };

        Ok(Self {
            config,
            store,
            clock,
            creation_time: AtomicU64::new(creation_time),
            buckets: RwLock::new(buckets),
            connections: Mutex::default(),
            gate: AdmissionGate::default(),
            adds_since_maintenance: AtomicU64::new(0),
            force_maintenance: AtomicBool::new(false),
            wipe_requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            needs_rebuild: Mutex::default(),
            stats: Stats::default(),
            maintenance_pool,
        })
    }

    pub fn config(&self) -> &CacheServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Milliseconds since the database was created.
    pub fn now(&self) -> u64 {
        self.clock
            .now_ms()
            .saturating_sub(self.creation_time.load(Ordering::Relaxed))
    }

    // -----------------------------------------------------------------------
    // Buckets
    // -----------------------------------------------------------------------

    pub fn bucket(&self, id: BucketId) -> Option<Arc<CacheBucket>> {
        self.buckets.read().get(&id).cloned()
    }

    fn bucket_or_insert(&self, id: BucketId) -> Arc<CacheBucket> {
        if let Some(bucket) = self.bucket(id) {
            return bucket;
        }
        self.buckets
            .write()
            .entry(id)
            .or_insert_with(|| {
                log::debug!("created bucket {id}");
                Arc::new(CacheBucket::new(id))
            })
            .clone()
    }

    /// Snapshot of every bucket, sorted by id.
    pub fn buckets(&self) -> Vec<Arc<CacheBucket>> {
        let mut out: Vec<Arc<CacheBucket>> = self.buckets.read().values().cloned().collect();
        out.sort_unstable_by_key(|b| b.id());
        out
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    fn flag_for_rebuild(&self, bucket: BucketId, cause: &dyn std::fmt::Display) {
        log::error!("bucket {bucket}: {cause}; flagged for table rebuild");
        self.needs_rebuild.lock().insert(bucket);
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    fn connection(&self, id: u32) -> Option<Arc<Mutex<Connection>>> {
        self.connections.lock().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Forget a client. Entries still waiting for content are discarded.
    pub fn on_disconnected(&self, id: u32) {
        let Some(conn) = self.connections.lock().remove(&id) else {
            return;
        };
        let conn = conn.lock();
        if !conn.deferred.is_empty() {
            log::debug!(
                "connection {id} ({}) closed with {} unconfirmed entries",
                conn.hint,
                conn.deferred.len()
            );
        }
        log::info!(
            "connection {id} ({}) closed: {} stores, {} fetches, {} hits",
            conn.hint,
            conn.stores,
            conn.fetches,
            conn.hits
        );
    }

    fn clear_deferred(&self) {
        let connections: Vec<_> = self.connections.lock().values().cloned().collect();
        for conn in connections {
            conn.lock().deferred.clear();
        }
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Handle one request from `connection` and return the reply payload.
    pub fn handle_message(
        &self,
        connection: u32,
        message: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let ty = MessageType::try_from(message)?;
        if ty == MessageType::Connect {
            return self.handle_connect(connection, payload);
        }
        let conn = self
            .connection(connection)
            .ok_or(ProtocolError::NotConnected(connection))?;

        // Admin commands manage the gate themselves.
        if ty == MessageType::ExecuteCommand {
            return self.handle_execute_command(payload);
        }

        let _pass = self.gate.enter();
        match ty {
            MessageType::Connect | MessageType::ExecuteCommand => Ok(Vec::new()),
            MessageType::StorePathTable => self.handle_store_path_table(&conn, payload),
            MessageType::StoreContentTable => self.handle_store_content_table(&conn, payload),
            MessageType::StoreEntry => self.handle_store_entry(&conn, payload),
            MessageType::StoreEntryDone => self.handle_store_entry_done(&conn, payload),
            MessageType::FetchPathTable => self.handle_fetch_table(payload, handlers::TableKind::Path),
            MessageType::FetchContentTable => {
                self.handle_fetch_table(payload, handlers::TableKind::Content)
            }
            MessageType::FetchEntries => self.handle_fetch_entries(&conn, payload),
            MessageType::ReportUsedEntry => self.handle_report_used_entry(&conn, payload),
            MessageType::RequestShutdown => self.handle_request_shutdown(payload),
            MessageType::UploadContent => self.handle_upload_content(payload),
            MessageType::DownloadContent => self.handle_download_content(payload),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle flags
    // -----------------------------------------------------------------------

    pub fn request_shutdown(&self, reason: &str) {
        log::info!("shutdown requested: {reason}");
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Queue a forced maintenance pass.
    pub fn request_maintenance(&self) {
        self.force_maintenance.store(true, Ordering::SeqCst);
    }

    /// Queue a wipe of every bucket at the next maintenance.
    pub fn request_wipe(&self) {
        self.wipe_requested.store(true, Ordering::SeqCst);
    }

    pub fn adds_since_maintenance(&self) -> u64 {
        self.adds_since_maintenance.load(Ordering::Relaxed)
    }

    /// Whether the periodic maintenance thread has anything to do.
    pub fn maintenance_due(&self) -> bool {
        self.force_maintenance.load(Ordering::SeqCst)
            || self.wipe_requested.load(Ordering::SeqCst)
            || self.adds_since_maintenance() >= self.config.maintenance_add_threshold
            || !self.needs_rebuild.lock().is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.stats.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.stats.misses.load(Ordering::Relaxed)
    }

    fn root_dir(&self) -> Option<&Path> {
        self.config.root_dir.as_deref()
    }
}

