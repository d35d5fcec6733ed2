// Administrative commands answered as plain text.

use std::fmt::{self, Write};
use std::sync::atomic::Ordering;

use rustc_hash::FxHashMap;

use super::CacheServer;
use super::protocol::ProtocolError;
use crate::binary::BinaryReader;
use crate::bucket::CacheBucket;
use crate::entries::CacheEntries;
use crate::key::{BucketId, CacheKey};

const USED_PATHS_LIMIT: usize = 100;

impl CacheServer {
    pub(super) fn handle_execute_command(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut r = BinaryReader::new(payload);
        let command = r.read_string()?;
        let args = r.read_string()?;
        Ok(self.execute_command(&command, &args).into_bytes())
    }

    /// Run an admin command and return its text output.
    pub fn execute_command(&self, command: &str, args: &str) -> String {
        log::info!("executing command: {command} {args}");
        let mut out = String::new();
        let written = match command {
            "maintenance" => {
                self.request_maintenance();
                out.write_str("Maintenance queued")
            }
            "obliterate" => {
                self.request_wipe();
                out.write_str("Obliterate queued")
            }
            "updateentries" => self.update_entries_command(&mut out),
            "save" => {
                let _pass = self.gate.enter();
                match self.save() {
                    Ok(stats) => write!(
                        out,
                        "Saved {} buckets ({} failed)",
                        stats.written, stats.failed
                    ),
                    Err(e) => write!(out, "Save failed: {e}"),
                }
            }
            other => {
                let _pass = self.gate.enter();
                match other {
                    "status" => self.status_command(&mut out, args.trim() == "json"),
                    "content" => self.content_command(&mut out, args.trim()),
                    "validate" => self.validate_command(&mut out),
                    "pathtable" => self.path_table_command(&mut out),
                    "usedpaths" => self.used_paths_command(&mut out),
                    "usedsegments" => self.used_segments_command(&mut out),
                    "largestentry" => self.largest_entry_command(&mut out),
                    "largestsharedinput" => self.largest_shared_input_command(&mut out),
                    _ => write!(out, "Unknown command: {other}"),
                }
            }
        };
        // Writing into a String cannot fail.
        debug_assert!(written.is_ok());
        out
    }

    fn status_command(&self, out: &mut String, json: bool) -> fmt::Result {
        let buckets = self.buckets();
        let now = self.now();
        let (content_count, content_bytes) = {
            let keys = self.store.content_keys();
            (keys.len(), keys.iter().map(|(_, size)| size).sum::<u64>())
        };
        let longest_ms = self.stats.longest_maintenance_ms.load(Ordering::Relaxed);
        let peak = self.stats.peak_connections.load(Ordering::Relaxed);

        if json {
            let buckets: Vec<serde_json::Value> = buckets
                .iter()
                .map(|b| {
                    let tables = b.tables();
                    serde_json::json!({
                        "id": b.id().0,
                        "version": b.id().version(),
                        "caseInsensitive": b.id().is_case_insensitive(),
                        "records": b.record_count(),
                        "entries": b.entry_count(),
                        "pathTableBytes": tables.paths.size(),
                        "contentTableBytes": tables.keys.size(),
                        "lastUsedMsAgo": now.saturating_sub(b.last_used_time()),
                    })
                })
                .collect();
            let status = serde_json::json!({
                "uptimeMs": now,
                "connections": self.connection_count(),
                "peakConnections": peak,
                "hits": self.hits(),
                "misses": self.misses(),
                "addsSinceMaintenance": self.adds_since_maintenance(),
                "longestMaintenanceMs": longest_ms,
                "contentCount": content_count,
                "contentBytes": content_bytes,
                "buckets": buckets,
            });
            return out.write_str(&status.to_string());
        }

        writeln!(out, "Buckets: {}", buckets.len())?;
        writeln!(
            out,
            "Entries: {}",
            buckets.iter().map(|b| b.entry_count()).sum::<usize>()
        )?;
        writeln!(out, "Connections: {} (peak {peak})", self.connection_count())?;
        writeln!(out, "Hits: {}  Misses: {}", self.hits(), self.misses())?;
        writeln!(out, "Adds since maintenance: {}", self.adds_since_maintenance())?;
        writeln!(out, "Longest maintenance: {longest_ms} ms")?;
        writeln!(out, "Content: {content_count} blobs, {content_bytes} bytes")?;
        for b in &buckets {
            let tables = b.tables();
            writeln!(
                out,
                "  {} (v{}{}): {} keys, {} entries, path table {} bytes, content-key table {} bytes, last used {}s ago",
                b.id(),
                b.id().version(),
                if b.id().is_case_insensitive() { ", case-insensitive" } else { "" },
                b.record_count(),
                b.entry_count(),
                tables.paths.size(),
                tables.keys.size(),
                now.saturating_sub(b.last_used_time()) / 1000
            )?;
        }
        Ok(())
    }

    /// Entries per cache key. With a filter, only entries touching a
    /// matching path are listed, along with the matching files.
    fn content_command(&self, out: &mut String, filter: &str) -> fmt::Result {
        let filter = filter.to_ascii_lowercase();
        for bucket in self.buckets() {
            writeln!(out, "bucket {}", bucket.id())?;
            let tables = bucket.tables();
            let path_of = |offset: u32| {
                tables
                    .keys
                    .get_path_string_and_key(&tables.paths, offset)
                    .map(|(path, _)| path)
                    .unwrap_or_else(|e| format!("<{e}>"))
            };
            for (key, record) in bucket.records() {
                let record = record.read();
                let mut header = false;
                for entry in &record.entries {
                    let inputs = record.flatten(entry).unwrap_or_default();
                    let outputs = entry.output_offsets().unwrap_or_default();
                    let matching: Vec<(&str, String)> = if filter.is_empty() {
                        outputs.iter().map(|&o| ("out", path_of(o))).collect()
                    } else {
                        let outs = outputs.iter().map(|&o| ("out", path_of(o)));
                        let ins = inputs.iter().map(|&o| ("in", path_of(o)));
                        outs.chain(ins)
                            .filter(|(_, p)| p.to_ascii_lowercase().contains(&filter))
                            .collect()
                    };
                    if !filter.is_empty() && matching.is_empty() {
                        continue;
                    }
                    if !header {
                        writeln!(out, "  {key}")?;
                        header = true;
                    }
                    writeln!(
                        out,
                        "    entry {}: created {} used {} inputs {} log {} bytes",
                        entry.id,
                        entry.creation_time,
                        entry.last_used_time,
                        inputs.len(),
                        record.log_lines(entry).len()
                    )?;
                    for (direction, path) in matching {
                        writeln!(out, "      {direction:<3} {path}")?;
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_command(&self, out: &mut String) -> fmt::Result {
        let mut failures = 0;
        for bucket in self.buckets() {
            let problems = bucket.validate();
            for problem in &problems {
                writeln!(out, "bucket {}: {problem}", bucket.id())?;
            }
            failures += problems.len();
        }
        if failures == 0 {
            out.write_str("Validation OK")
        } else {
            write!(out, "Validation found {failures} problem(s)")
        }
    }

    fn path_table_command(&self, out: &mut String) -> fmt::Result {
        for bucket in self.buckets() {
            let tables = bucket.tables();
            writeln!(
                out,
                "bucket {} ({} paths, {} segments)",
                bucket.id(),
                tables.paths.path_count(),
                tables.paths.segment_count()
            )?;
            match tables.paths.node_offsets() {
                Ok(offsets) => {
                    for offset in offsets {
                        match tables.paths.get_string(offset) {
                            Ok(path) => writeln!(out, "  {offset:>8} {path}")?,
                            Err(e) => writeln!(out, "  {offset:>8} <{e}>")?,
                        }
                    }
                }
                Err(e) => writeln!(out, "  path table unreadable: {e}")?,
            }
        }
        Ok(())
    }

    /// Most referenced files across every entry.
    fn used_paths_command(&self, out: &mut String) -> fmt::Result {
        for bucket in self.buckets() {
            let tables = bucket.tables();
            let mut counts: FxHashMap<u32, u32> = FxHashMap::default();
            for (_, record) in bucket.records() {
                let record = record.read();
                for entry in &record.entries {
                    let inputs = record.flatten(entry).unwrap_or_default();
                    let outputs = entry.output_offsets().unwrap_or_default();
                    for offset in inputs.into_iter().chain(outputs) {
                        *counts.entry(offset).or_default() += 1;
                    }
                }
            }
            let mut by_path: FxHashMap<String, u32> = FxHashMap::default();
            for (offset, count) in counts {
                if let Ok((path, _)) = tables.keys.get_path_string_and_key(&tables.paths, offset) {
                    *by_path.entry(path).or_default() += count;
                }
            }
            let mut sorted: Vec<(String, u32)> = by_path.into_iter().collect();
            sorted.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            writeln!(out, "bucket {} ({} paths)", bucket.id(), sorted.len())?;
            for (path, count) in sorted.into_iter().take(USED_PATHS_LIMIT) {
                writeln!(out, "  {count:>8} {path}")?;
            }
        }
        Ok(())
    }

    fn used_segments_command(&self, out: &mut String) -> fmt::Result {
        for bucket in self.buckets() {
            let usage = bucket.tables().paths.segment_usage();
            writeln!(out, "bucket {} ({} segments)", bucket.id(), usage.len())?;
            for (segment, count) in usage {
                writeln!(out, "  {count:>8} {segment}")?;
            }
        }
        Ok(())
    }

    fn largest_entry_command(&self, out: &mut String) -> fmt::Result {
        let mut largest: Option<(usize, BucketId, CacheKey, u32, usize, usize)> = None;
        for bucket in self.buckets() {
            for (key, record) in bucket.records() {
                let record = record.read();
                for entry in &record.entries {
                    let size = CacheEntries::entry_size(entry, false);
                    if largest.as_ref().is_none_or(|(s, ..)| size > *s) {
                        let inputs = record.flatten(entry).map_or(0, |i| i.len());
                        let outputs = entry.output_offsets().map_or(0, |o| o.len());
                        largest = Some((size, bucket.id(), key, entry.id, inputs, outputs));
                    }
                }
            }
        }
        match largest {
            Some((size, bucket, key, id, inputs, outputs)) => write!(
                out,
                "bucket {bucket} key {key} entry {id}: {size} bytes, {inputs} inputs, {outputs} outputs"
            ),
            None => out.write_str("No entries"),
        }
    }

    fn largest_shared_input_command(&self, out: &mut String) -> fmt::Result {
        let mut largest: Option<(usize, BucketId, CacheKey, usize)> = None;
        for bucket in self.buckets() {
            for (key, record) in bucket.records() {
                let record = record.read();
                let size = record.shared_size();
                if largest.as_ref().is_none_or(|(s, ..)| size > *s) {
                    largest = Some((size, bucket.id(), key, record.len()));
                }
            }
        }
        match largest {
            Some((size, bucket, key, entries)) => write!(
                out,
                "bucket {bucket} key {key}: shared inputs {size} bytes, {entries} entries"
            ),
            None => out.write_str("No entries"),
        }
    }

    /// Rebuild every bucket's tables with the admission gate closed.
    ///
    /// The gate is held on a maintenance worker. A request worker that
    /// held it could pick up another client's request while waiting for
    /// the rebuild and block on the gate it closed itself.
    fn update_entries_command(&self, out: &mut String) -> fmt::Result {
        let lines: Vec<String> = self.maintenance_pool.install(|| {
            let _closed = self.gate.close_and_drain();
            self.clear_deferred();
            self.buckets()
                .iter()
                .map(|bucket| self.rebuild_bucket(bucket).unwrap_or_else(|e| e))
                .collect()
        });
        for line in lines {
            writeln!(out, "{line}")?;
        }
        out.write_str("Entries updated")
    }

    fn rebuild_bucket(&self, bucket: &CacheBucket) -> Result<String, String> {
        let stats = bucket
            .rebuild_tables()
            .map_err(|e| format!("bucket {}: rebuild failed: {e}", bucket.id()))?;
        Ok(format!(
            "bucket {}: path table {} -> {} bytes, content-key table {} -> {} bytes, {} records dropped",
            bucket.id(),
            stats.path_bytes_before,
            stats.path_bytes_after,
            stats.key_bytes_before,
            stats.key_bytes_after,
            stats.dropped_records
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::key::{BucketFlags, BucketId, CacheKey, ContentKey};
    use crate::server::CacheServerConfig;
    use crate::store::MemoryContentStore;
    use crate::transport::{CacheClient, LocalChannel};

    fn server() -> Arc<CacheServer> {
        let server = CacheServer::open(
            CacheServerConfig::in_memory(),
            Arc::new(MemoryContentStore::new()),
            Arc::new(ManualClock::new(1_000_000)),
        )
        .unwrap();
        Arc::new(server)
    }

    fn store_one(server: &Arc<CacheServer>) {
        let mut client = CacheClient::connect(LocalChannel::new(server.clone()), "cmd").unwrap();
        client
            .store(
                BucketId::new(5, 2, BucketFlags::CASE_SENSITIVE),
                &CacheKey::from_command("cc lib/util.c"),
                &[
                    ("lib/util.c", ContentKey::from_content(b"util")),
                    ("lib/util.h", ContentKey::from_content(b"header")),
                ],
                &[("obj/util.o", b"util object")],
                b"",
            )
            .unwrap();
    }

    #[test]
    fn empty_server_reports_no_entries() {
        let server = server();
        assert_eq!(server.execute_command("largestentry", ""), "No entries");
        assert_eq!(server.execute_command("largestsharedinput", ""), "No entries");
        assert_eq!(server.execute_command("validate", ""), "Validation OK");
        assert!(server.execute_command("status", "").starts_with("Buckets: 0\n"));
    }

    #[test]
    fn table_dumps_list_interned_paths() {
        let server = server();
        store_one(&server);

        let paths = server.execute_command("pathtable", "");
        assert!(paths.contains("lib/util.c"), "{paths}");
        assert!(paths.contains("obj/util.o"), "{paths}");

        let segments = server.execute_command("usedsegments", "");
        assert!(segments.contains("util"), "{segments}");

        let shared = server.execute_command("largestsharedinput", "");
        assert!(shared.ends_with("1 entries"), "{shared}");
    }

    #[test]
    fn content_filter_matches_inputs_case_insensitively() {
        let server = server();
        store_one(&server);

        let listing = server.execute_command("content", "UTIL.H");
        assert!(listing.contains("in  lib/util.h"), "{listing}");
        assert!(!listing.contains("obj/util.o"), "{listing}");
    }

    #[test]
    fn update_entries_on_a_request_worker_keeps_serving_others() {
        use std::sync::atomic::AtomicBool;
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration;

        use crate::server::protocol::{self, MessageType, PROTOCOL_VERSION};

        let server = server();
        let mut client = CacheClient::connect(LocalChannel::new(server.clone()), "cmd").unwrap();
        for family in 0..4u32 {
            for i in 0..16u32 {
                let path = format!("src/{family}/{i}.c");
                client
                    .store(
                        BucketId::new(family, 0, BucketFlags::CASE_SENSITIVE),
                        &CacheKey::from_command(&format!("cc {path}")),
                        &[(path.as_str(), ContentKey::from_content(path.as_bytes()))],
                        &[("out.o", path.as_bytes())],
                        b"",
                    )
                    .unwrap();
            }
        }
        drop(client);

        // Two workers, so a worker waiting on split work can pick up a
        // queued request.
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap());
        let conn = 0x4000_0001;
        server
            .handle_message(
                conn,
                MessageType::Connect as u8,
                &protocol::connect(PROTOCOL_VERSION, "feeder"),
            )
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let feeder = {
            let (server, pool, stop) = (server.clone(), pool.clone(), stop.clone());
            thread::spawn(move || {
                let payload = protocol::download_content(&ContentKey::from_content(b"none"));
                while !stop.load(Ordering::SeqCst) {
                    pool.install(|| {
                        server
                            .handle_message(conn, MessageType::DownloadContent as u8, &payload)
                            .unwrap()
                    });
                }
            })
        };

        let (tx, rx) = mpsc::channel();
        {
            let (server, pool) = (server.clone(), pool.clone());
            thread::spawn(move || {
                for _ in 0..20 {
                    let out = pool.install(|| server.execute_command("updateentries", ""));
                    assert!(out.ends_with("Entries updated"), "{out}");
                }
                let _ = tx.send(());
            });
        }

        let finished = rx.recv_timeout(Duration::from_secs(30));
        stop.store(true, Ordering::SeqCst);
        assert!(finished.is_ok(), "updateentries stalled");
        feeder.join().unwrap();
        server.on_disconnected(conn);
        assert_eq!(server.execute_command("validate", ""), "Validation OK");
    }

    #[test]
    fn command_payload_is_decoded() {
        let server = server();
        let payload = crate::server::protocol::execute_command("bogus", "x");
        let reply = server.handle_execute_command(&payload).unwrap();
        assert_eq!(reply, b"Unknown command: bogus");
        assert!(server.handle_execute_command(&[0xff]).is_err());
    }
}
