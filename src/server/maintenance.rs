// Garbage collection and table compaction.
//
// A pass runs with the admission gate closed:
//   1. collect content the store lost and the content it still holds
//   2. delete entries (overflow, expiry, missing outputs, deleted inputs),
//      dropping content no surviving entry outputs, until nothing changes
//   3. rebuild the tables of every bucket that lost entries
//   4. save dirty buckets and the database file
// Buckets whose content-key table stays over the cap trigger another pass
// with a shorter expiry.

use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{CacheServer, ServerError};
use crate::bucket::{CacheBucket, Tables};
use crate::entries::{CacheEntries, EntriesError, FETCH_RESERVED_BYTES};
use crate::key::{BucketId, CacheKey, ContentKey};
use crate::table::BitArray;

const HOUR_MS: u64 = 60 * 60 * 1000;

/// Outcome of [`CacheServer::run_maintenance`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// False when there was nothing to do.
    pub ran: bool,
    pub passes: u32,
    pub overflowed: u64,
    pub expired: u64,
    pub missing_outputs: u64,
    pub missing_inputs: u64,
    pub corrupt: u64,
    pub dropped_content: u64,
    pub rebuilt_buckets: usize,
    pub removed_buckets: usize,
    pub save_failures: usize,
    pub duration: Duration,
}

impl MaintenanceReport {
    pub fn deleted_entries(&self) -> u64 {
        self.overflowed + self.expired + self.missing_outputs + self.missing_inputs + self.corrupt
    }
}

impl fmt::Display for MaintenanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.ran {
            return f.write_str("maintenance skipped");
        }
        write!(
            f,
            "deleted {} entries ({} overflow, {} expired, {} missing outputs, {} missing inputs, {} corrupt), \
             dropped {} blobs, rebuilt {} buckets, removed {} buckets in {:.2?}",
            self.deleted_entries(),
            self.overflowed,
            self.expired,
            self.missing_outputs,
            self.missing_inputs,
            self.corrupt,
            self.dropped_content,
            self.rebuilt_buckets,
            self.removed_buckets,
            self.duration
        )
    }
}

/// Per-reason deletion counts, shared across the parallel sweep.
#[derive(Debug, Default)]
struct Counters {
    overflowed: AtomicU64,
    expired: AtomicU64,
    missing_outputs: AtomicU64,
    missing_inputs: AtomicU64,
    corrupt: AtomicU64,
}

impl Counters {
    fn total(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
            + self.expired.load(Ordering::Relaxed)
            + self.missing_outputs.load(Ordering::Relaxed)
            + self.missing_inputs.load(Ordering::Relaxed)
            + self.corrupt.load(Ordering::Relaxed)
    }

    fn add_to(&self, report: &mut MaintenanceReport) {
        report.overflowed += self.overflowed.load(Ordering::Relaxed);
        report.expired += self.expired.load(Ordering::Relaxed);
        report.missing_outputs += self.missing_outputs.load(Ordering::Relaxed);
        report.missing_inputs += self.missing_inputs.load(Ordering::Relaxed);
        report.corrupt += self.corrupt.load(Ordering::Relaxed);
    }
}

enum Reason {
    Overflow,
    Expired,
    MissingOutput,
    MissingInput,
}

/// Offsets of one bucket whose content is gone.
struct ContentState {
    /// Removed from the store, by eviction or by garbage collection.
    deleted: BitArray,
    /// Not held by the store at all.
    missing: BitArray,
}

/// Sweep inputs shared by every record of one bucket.
struct SweepContext<'a> {
    tables: &'a Tables,
    content: &'a ContentState,
    used: &'a FxHashMap<ContentKey, AtomicBool>,
    expiry_limit: Option<u64>,
    capacity: usize,
    check_inputs: bool,
    counters: &'a Counters,
}

impl SweepContext<'_> {
    fn reason(
        &self,
        record: &CacheEntries,
        index: usize,
        size_so_far: &mut usize,
    ) -> Result<Option<Reason>, EntriesError> {
        let entry = &record.entries[index];
        let size = CacheEntries::entry_size(entry, false);
        if *size_so_far + size > self.capacity.saturating_sub(record.shared_size()) {
            return Ok(Some(Reason::Overflow));
        }
        if let Some(limit) = self.expiry_limit
            && entry.creation_time < limit
            && entry.last_used_time < limit
        {
            return Ok(Some(Reason::Expired));
        }
        let outputs = entry.output_offsets()?;
        if outputs.iter().any(|&o| self.content.missing.is_set(o)) {
            return Ok(Some(Reason::MissingOutput));
        }
        if self.check_inputs && !record.inputs_that_are_outputs.is_empty() {
            let deleted_inputs = if record.checks_all_inputs() {
                record
                    .flatten(entry)?
                    .iter()
                    .any(|&o| self.content.deleted.is_set(o))
            } else {
                let flagged: Vec<u32> = record
                    .inputs_that_are_outputs
                    .iter()
                    .copied()
                    .filter(|&o| self.content.deleted.is_set(o))
                    .collect();
                !flagged.is_empty() && {
                    let inputs = record.flatten(entry)?;
                    flagged.iter().any(|o| inputs.binary_search(o).is_ok())
                }
            };
            if deleted_inputs {
                return Ok(Some(Reason::MissingInput));
            }
        }
        *size_so_far += size;
        Ok(None)
    }

    /// Delete doomed entries of one record and mark the outputs of the
    /// survivors as used. Returns whether anything was deleted.
    fn sweep(&self, record: &mut CacheEntries) -> bool {
        let before = record.len();
        let mut size_so_far = 0;
        let mut index = 0;
        while index < record.len() {
            let counter = match self.reason(record, index, &mut size_so_far) {
                Ok(None) => {
                    index += 1;
                    continue;
                }
                Ok(Some(Reason::Overflow)) => &self.counters.overflowed,
                Ok(Some(Reason::Expired)) => &self.counters.expired,
                Ok(Some(Reason::MissingOutput)) => &self.counters.missing_outputs,
                Ok(Some(Reason::MissingInput)) => &self.counters.missing_inputs,
                Err(e) => {
                    log::warn!("dropping corrupt entry {}: {e}", record.entries[index].id);
                    &self.counters.corrupt
                }
            };
            counter.fetch_add(1, Ordering::Relaxed);
            record.remove(index);
        }

        for entry in &record.entries {
            for offset in entry.output_offsets().unwrap_or_default() {
                if let Some(used) = self
                    .tables
                    .keys
                    .get_key(offset)
                    .ok()
                    .and_then(|key| self.used.get(&key))
                {
                    used.store(true, Ordering::Relaxed);
                }
            }
        }
        record.len() != before
    }
}

/// Result of one maintenance pass.
struct PassOutcome {
    deleted_any: bool,
    overflowing: bool,
}

impl CacheServer {
    /// Run maintenance if anything asks for it.
    ///
    /// Without `force` the pass is skipped while clients are connected.
    /// `should_stop` is polled between phases; a stopped pass still saves
    /// what it changed.
    pub fn run_maintenance(
        &self,
        force: bool,
        should_stop: &(dyn Fn() -> bool + Sync),
    ) -> Result<MaintenanceReport, ServerError> {
        let force = self.force_maintenance.swap(false, Ordering::SeqCst) || force;
        let wipe = self.wipe_requested.swap(false, Ordering::SeqCst);
        let flagged: FxHashSet<BucketId> = std::mem::take(&mut *self.needs_rebuild.lock());
        let adds = self.adds_since_maintenance();

        if !force && !wipe {
            if adds == 0 && flagged.is_empty() {
                return Ok(MaintenanceReport::default());
            }
            if self.connection_count() > 0 {
                log::debug!("maintenance postponed: clients connected");
                self.needs_rebuild.lock().extend(flagged);
                return Ok(MaintenanceReport::default());
            }
        }

        let started = Instant::now();
        let _closed = self.gate.close_and_drain();
        self.clear_deferred();
        self.adds_since_maintenance.store(0, Ordering::Relaxed);
        log::info!("maintenance started ({adds} adds since last run)");

        let mut report = MaintenanceReport {
            ran: true,
            ..MaintenanceReport::default()
        };
        if wipe {
            self.wipe();
        }

        let mut rebuild_all = force;
        let mut flagged = flagged;
        loop {
            report.passes += 1;
            let outcome = self.maintenance_pool.install(|| {
                self.maintenance_pass(rebuild_all, &flagged, should_stop, &mut report)
            });
            flagged.clear();
            rebuild_all = false;
            if should_stop() || !(outcome.overflowing && outcome.deleted_any) {
                break;
            }
            log::info!("content-key tables still over the cap, running another pass");
        }

        report.removed_buckets += self.remove_empty_buckets();
        report.save_failures = self.save()?.failed;

        report.duration = started.elapsed();
        let ms = report.duration.as_millis() as u64;
        self.stats.longest_maintenance_ms.fetch_max(ms, Ordering::Relaxed);
        log::info!("maintenance done: {report}");
        Ok(report)
    }

    fn wipe(&self) {
        let removed = std::mem::take(&mut *self.buckets.write());
        self.creation_time.store(self.clock.now_ms(), Ordering::Relaxed);
        log::warn!("obliterating {} buckets", removed.len());
    }

    fn maintenance_pass(
        &self,
        rebuild_all: bool,
        flagged: &FxHashSet<BucketId>,
        should_stop: &(dyn Fn() -> bool + Sync),
        report: &mut MaintenanceReport,
    ) -> PassOutcome {
        let mut deleted_content = self.store.take_deleted();
        let mut used: FxHashMap<ContentKey, AtomicBool> = self
            .store
            .content_keys()
            .into_iter()
            .filter(|(key, _)| !deleted_content.contains(key))
            .map(|(key, _)| (key, AtomicBool::new(false)))
            .collect();

        let mut buckets = self.buckets();
        buckets.sort_by_cached_key(|b| Reverse(b.tables().keys.size()));

        // An over-cap bucket's window shrinks from its current oldest entry,
        // so every pass starts from fresh times.
        for bucket in &buckets {
            bucket.refresh_oldest_used_time();
        }
        let now = self.now();
        let expiry_limits: Vec<Option<u64>> =
            buckets.iter().map(|b| self.expiry_limit(b, now)).collect();
        let mut touched = vec![false; buckets.len()];
        let counters = Counters::default();

        let mut iteration = 0u32;
        loop {
            if should_stop() {
                break;
            }
            for used in used.values() {
                used.store(false, Ordering::Relaxed);
            }
            for (i, bucket) in buckets.iter().enumerate() {
                let tables = bucket.tables();
                let content = content_state(&tables, &deleted_content, &used);
                let ctx = SweepContext {
                    tables: &tables,
                    content: &content,
                    used: &used,
                    expiry_limit: expiry_limits[i],
                    capacity: self.config.fetch_response_cap.saturating_sub(FETCH_RESERVED_BYTES),
                    check_inputs: self.config.check_inputs_for_deleted_content,
                    counters: &counters,
                };
                let records = bucket.records();
                let swept: Vec<(bool, Option<CacheKey>)> = records
                    .par_iter()
                    .map(|(key, record)| {
                        let mut record = record.write();
                        let deleted = ctx.sweep(&mut record);
                        (deleted, record.is_empty().then_some(*key))
                    })
                    .collect();
                drop(tables);
                for (deleted, emptied) in swept {
                    if let Some(key) = emptied {
                        bucket.remove_record(&key);
                        touched[i] = true;
                    }
                    touched[i] |= deleted;
                }
            }

            let doomed: Vec<ContentKey> = used
                .iter()
                .filter(|(_, used)| !used.load(Ordering::Relaxed))
                .map(|(key, _)| *key)
                .collect();
            for key in &doomed {
                match self.store.drop_content(key) {
                    Ok(()) => {
                        used.remove(key);
                        deleted_content.insert(*key);
                    }
                    Err(e) => log::warn!("failed to drop content {key}: {e}"),
                }
            }
            report.dropped_content += doomed.len() as u64;
            log::debug!(
                "maintenance iteration {iteration}: {} entries deleted so far, {} blobs dropped",
                counters.total(),
                doomed.len()
            );
            iteration += 1;
            if doomed.is_empty() {
                break;
            }
        }
        counters.add_to(report);

        let mut overflowing = false;
        for (i, bucket) in buckets.iter().enumerate() {
            if should_stop() {
                break;
            }
            if !(rebuild_all || touched[i] || flagged.contains(&bucket.id())) {
                continue;
            }
            match bucket.rebuild_tables() {
                Ok(stats) => {
                    report.rebuilt_buckets += 1;
                    log::info!(
                        "bucket {}: path table {} -> {} bytes, content-key table {} -> {} bytes",
                        bucket.id(),
                        stats.path_bytes_before,
                        stats.path_bytes_after,
                        stats.key_bytes_before,
                        stats.key_bytes_after
                    );
                    if self.over_table_cap(stats.key_bytes_after) {
                        overflowing = true;
                    }
                }
                Err(e) => log::error!("bucket {}: table rebuild failed: {e}", bucket.id()),
            }
        }

        PassOutcome {
            deleted_any: counters.total() > 0,
            overflowing,
        }
    }

    fn over_table_cap(&self, key_table_size: u32) -> bool {
        let cap = self.config.bucket_content_table_max_size;
        cap > 0 && u64::from(key_table_size) >= cap
    }

    /// Entries neither created nor used after the returned time expire.
    ///
    /// A bucket whose content-key table is over the cap loses its oldest
    /// hour of entries even when they are inside the configured window.
    fn expiry_limit(&self, bucket: &CacheBucket, now: u64) -> Option<u64> {
        let configured = self.config.expiration.map(|d| d.as_millis() as u64);
        let window = if self.over_table_cap(bucket.tables().keys.size()) {
            let longest_unused = now.saturating_sub(bucket.oldest_used_time());
            let window = configured.map_or(longest_unused, |c| c.min(longest_unused));
            let window = window.saturating_sub(HOUR_MS);
            log::info!(
                "bucket {}: content-key table over the cap, expiring entries unused for {:.1} hours",
                bucket.id(),
                window as f64 / HOUR_MS as f64
            );
            Some(window)
        } else {
            configured
        };
        window.map(|w| now.saturating_sub(w))
    }

    fn remove_empty_buckets(&self) -> usize {
        let empty: Vec<Arc<CacheBucket>> = self
            .buckets()
            .into_iter()
            .filter(|b| b.is_empty())
            .collect();
        if empty.is_empty() {
            return 0;
        }
        if let Some(root) = self.root_dir() {
            let dir = super::persist::buckets_dir(root);
            for bucket in &empty {
                if let Err(e) = bucket.save(&dir) {
                    log::error!("bucket {}: failed to delete file: {e}", bucket.id());
                }
            }
        }
        let mut map = self.buckets.write();
        for bucket in &empty {
            map.remove(&bucket.id());
        }
        empty.len()
    }
}

/// Mark the offsets of `tables` whose content was deleted or is absent.
fn content_state(
    tables: &Tables,
    deleted: &FxHashSet<ContentKey>,
    present: &FxHashMap<ContentKey, AtomicBool>,
) -> ContentState {
    let size = tables.keys.size();
    let mut state = ContentState {
        deleted: BitArray::new(size),
        missing: BitArray::new(size),
    };
    for offset in tables.keys.record_offsets().unwrap_or_default() {
        let Ok(key) = tables.keys.get_key(offset) else {
            continue;
        };
        if deleted.contains(&key) {
            state.deleted.set(offset);
        }
        if !present.contains_key(&key) {
            state.missing.set(offset);
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::key::BucketFlags;
    use crate::server::CacheServerConfig;
    use crate::store::{ContentStore, MemoryContentStore};
    use crate::transport::{CacheClient, LocalChannel};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    struct Fixture {
        server: Arc<CacheServer>,
        store: Arc<MemoryContentStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture(config: CacheServerConfig) -> Fixture {
        let store = Arc::new(MemoryContentStore::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let server = CacheServer::open(config, store.clone(), clock.clone()).unwrap();
        Fixture {
            server: Arc::new(server),
            store,
            clock,
        }
    }

    fn bucket() -> BucketId {
        BucketId::new(7, 0, BucketFlags::CASE_SENSITIVE)
    }

    fn never() -> bool {
        false
    }

    impl Fixture {
        fn client(&self) -> CacheClient<LocalChannel> {
            CacheClient::connect(LocalChannel::new(self.server.clone()), "maintenance test").unwrap()
        }

        fn store(&self, cmd: &str, inputs: &[(&str, ContentKey)], outputs: &[(&str, &[u8])]) {
            self.client()
                .store(bucket(), &CacheKey::from_command(cmd), inputs, outputs, b"")
                .unwrap();
        }

        fn entry_count(&self, cmd: &str) -> usize {
            self.server
                .bucket(bucket())
                .and_then(|b| b.record(&CacheKey::from_command(cmd)))
                .map_or(0, |r| r.read().len())
        }
    }

    fn key(data: &[u8]) -> ContentKey {
        ContentKey::from_content(data)
    }

    #[test]
    fn nothing_to_do_is_skipped() {
        let f = fixture(CacheServerConfig::in_memory());
        let report = f.server.run_maintenance(false, &never).unwrap();
        assert!(!report.ran);
        assert_eq!(report.to_string(), "maintenance skipped");
    }

    #[test]
    fn expired_entries_are_removed_with_their_content() {
        let f = fixture(CacheServerConfig::in_memory());
        f.store("cc a.c", &[("a.c", key(b"int a;"))], &[("a.o", b"obj-a")]);
        assert_eq!(f.entry_count("cc a.c"), 1);
        assert_eq!(f.store.len(), 1);

        f.clock.advance(4 * DAY);
        let report = f.server.run_maintenance(false, &never).unwrap();
        assert!(report.ran);
        assert_eq!(report.expired, 1);
        assert_eq!(report.dropped_content, 1);
        assert_eq!(report.removed_buckets, 1);
        assert_eq!(f.server.bucket_count(), 0);
        assert!(f.store.is_empty());
        assert_eq!(f.server.adds_since_maintenance(), 0);
    }

    #[test]
    fn recently_used_entries_survive_expiry() {
        let f = fixture(CacheServerConfig::in_memory());
        let cmd = CacheKey::from_command("cc a.c");
        f.store("cc a.c", &[("a.c", key(b"int a;"))], &[("a.o", b"obj-a")]);

        f.clock.advance(2 * DAY);
        {
            let mut client = f.client();
            let hits = client.fetch_entries(bucket(), &cmd).unwrap();
            assert_eq!(hits.len(), 1);
            client.report_used_entry(bucket(), &cmd, hits[0].id).unwrap();
        }

        f.clock.advance(2 * DAY);
        let report = f.server.run_maintenance(true, &never).unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(f.entry_count("cc a.c"), 1);
        assert!(f.store.has_content(&key(b"obj-a")));
    }

    #[test]
    fn disabled_expiry_keeps_old_entries() {
        let mut config = CacheServerConfig::in_memory();
        config.expiration = None;
        let f = fixture(config);
        f.store("cc a.c", &[("a.c", key(b"int a;"))], &[("a.o", b"obj-a")]);
        f.clock.advance(365 * DAY);
        let report = f.server.run_maintenance(true, &never).unwrap();
        assert_eq!(report.deleted_entries(), 0);
        assert_eq!(f.entry_count("cc a.c"), 1);
    }

    #[test]
    fn evicted_output_deletes_entry() {
        let f = fixture(CacheServerConfig::in_memory());
        f.store("cc a.c", &[("a.c", key(b"int a;"))], &[("a.o", b"obj-a")]);
        f.store("cc b.c", &[("b.c", key(b"int b;"))], &[("b.o", b"obj-b")]);
        assert!(f.store.evict(&key(b"obj-a")));

        let report = f.server.run_maintenance(true, &never).unwrap();
        assert_eq!(report.missing_outputs, 1);
        assert_eq!(f.entry_count("cc a.c"), 0);
        assert_eq!(f.entry_count("cc b.c"), 1);
        assert!(f.store.has_content(&key(b"obj-b")));
    }

    #[test]
    fn deleted_input_content_cascades_to_consumers() {
        let f = fixture(CacheServerConfig::in_memory());
        f.store("gen", &[("gen.idl", key(b"idl"))], &[("gen.h", b"generated")]);
        f.store(
            "cc main.c",
            &[("main.c", key(b"int main;")), ("gen.h", key(b"generated"))],
            &[("main.o", b"obj-main")],
        );
        let record = f
            .server
            .bucket(bucket())
            .and_then(|b| b.record(&CacheKey::from_command("cc main.c")))
            .unwrap();
        assert_eq!(record.read().inputs_that_are_outputs.len(), 1);

        assert!(f.store.evict(&key(b"generated")));
        let report = f.server.run_maintenance(true, &never).unwrap();
        assert_eq!(report.missing_outputs, 1);
        assert_eq!(report.missing_inputs, 1);
        assert_eq!(f.server.bucket_count(), 0);
        assert!(f.store.is_empty());
    }

    #[test]
    fn input_check_can_be_disabled() {
        let mut config = CacheServerConfig::in_memory();
        config.check_inputs_for_deleted_content = false;
        let f = fixture(config);
        f.store("gen", &[("gen.idl", key(b"idl"))], &[("gen.h", b"generated")]);
        f.store(
            "cc main.c",
            &[("gen.h", key(b"generated"))],
            &[("main.o", b"obj-main")],
        );
        assert!(f.store.evict(&key(b"generated")));

        let report = f.server.run_maintenance(true, &never).unwrap();
        assert_eq!(report.missing_outputs, 1);
        assert_eq!(report.missing_inputs, 0);
        assert_eq!(f.entry_count("cc main.c"), 1);
    }

    #[test]
    fn overflowing_entries_are_trimmed_to_the_fetch_cap() {
        let cap = 160;
        let mut config = CacheServerConfig::in_memory();
        config.fetch_response_cap = cap;
        let f = fixture(config);

        let total = 20;
        for i in 0..total {
            let inputs: Vec<(String, ContentKey)> = (0..8)
                .map(|j| (format!("src/{i}/{j}.c"), key(format!("{i}-{j}").as_bytes())))
                .collect();
            let inputs: Vec<(&str, ContentKey)> =
                inputs.iter().map(|(p, k)| (p.as_str(), *k)).collect();
            let output = format!("obj-{i}");
            f.store("cc all", &inputs, &[("out.o", output.as_bytes())]);
        }
        assert_eq!(f.entry_count("cc all"), total);

        let report = f.server.run_maintenance(true, &never).unwrap();
        let kept = f.entry_count("cc all");
        assert!(report.overflowed > 0);
        assert_eq!(kept + report.overflowed as usize, total);

        let record = f
            .server
            .bucket(bucket())
            .and_then(|b| b.record(&CacheKey::from_command("cc all")))
            .unwrap();
        assert!(record.read().total_size(false) <= cap);
        // The newest store is always first in line.
        assert!(f.store.has_content(&key(format!("obj-{}", total - 1).as_bytes())));
    }

    #[test]
    fn over_cap_bucket_expires_its_oldest_hour() {
        let mut config = CacheServerConfig::in_memory();
        config.bucket_content_table_max_size = 1;
        let f = fixture(config);
        f.store("cc a.c", &[("a.c", key(b"int a;"))], &[("a.o", b"obj-a")]);

        f.clock.advance(Duration::from_secs(10 * 60 * 60));
        let report = f.server.run_maintenance(true, &never).unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(f.server.bucket_count(), 0);
    }

    #[test]
    fn over_cap_bucket_keeps_shrinking_its_window() {
        let mut config = CacheServerConfig::in_memory();
        config.bucket_content_table_max_size = 1;
        let f = fixture(config);
        f.store("cc a.c", &[("a.c", key(b"int a;"))], &[("a.o", b"obj-a")]);
        f.clock.advance(Duration::from_secs(3 * 60 * 60));
        f.store("cc b.c", &[("b.c", key(b"int b;"))], &[("b.o", b"obj-b")]);
        f.clock.advance(Duration::from_secs(3 * 60 * 60));

        let report = f.server.run_maintenance(true, &never).unwrap();
        // The first pass only reaches the older entry; the table is still
        // over the cap afterwards, so a second pass takes the newer one.
        assert!(report.passes >= 2, "{report:?}");
        assert_eq!(report.expired, 2);
        assert_eq!(f.entry_count("cc b.c"), 0);
        assert_eq!(f.server.bucket_count(), 0);
        assert!(f.store.is_empty());
    }

    #[test]
    fn postponed_while_clients_are_connected() {
        let f = fixture(CacheServerConfig::in_memory());
        f.store("cc a.c", &[("a.c", key(b"int a;"))], &[("a.o", b"obj-a")]);
        f.clock.advance(4 * DAY);

        let client = f.client();
        let report = f.server.run_maintenance(false, &never).unwrap();
        assert!(!report.ran);
        assert_eq!(f.server.adds_since_maintenance(), 1);
        assert_eq!(f.entry_count("cc a.c"), 1);

        drop(client);
        let report = f.server.run_maintenance(false, &never).unwrap();
        assert!(report.ran);
        assert_eq!(report.expired, 1);
    }

    #[test]
    fn obliterate_drops_every_bucket() {
        let f = fixture(CacheServerConfig::in_memory());
        f.store("cc a.c", &[("a.c", key(b"int a;"))], &[("a.o", b"obj-a")]);
        f.server.request_wipe();
        assert!(f.server.maintenance_due());

        let report = f.server.run_maintenance(false, &never).unwrap();
        assert!(report.ran);
        assert_eq!(f.server.bucket_count(), 0);
        assert!(f.store.is_empty());
        assert!(!f.server.maintenance_due());
    }

    #[test]
    fn stop_request_ends_the_pass_early() {
        let f = fixture(CacheServerConfig::in_memory());
        f.store("cc a.c", &[("a.c", key(b"int a;"))], &[("a.o", b"obj-a")]);
        f.clock.advance(4 * DAY);
        let report = f.server.run_maintenance(true, &|| true).unwrap();
        assert!(report.ran);
        assert_eq!(report.deleted_entries(), 0);
        assert_eq!(f.entry_count("cc a.c"), 1);
    }
}
