// Per-message request handlers.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use super::protocol::{PROTOCOL_VERSION, ProtocolError};
use super::{CacheServer, ClientTables, Connection};
use crate::binary::varint;
use crate::binary::{BinaryReader, BinaryWriter};
use crate::bucket::Tables;
use crate::entries::{CacheEntries, CacheEntry, EntriesError};
use crate::key::{BucketId, CacheKey, ContentKey};

#[derive(Debug, Clone, Copy)]
pub(super) enum TableKind {
    Path,
    Content,
}

/// What a store did to the record.
enum Staged {
    Unchanged,
    Published,
    Deferred(CacheEntry),
}

/// Resolve client content-key offsets to `(path, key)` pairs.
fn resolve(
    mirror: Option<&ClientTables>,
    offsets: &[u32],
    direction: &'static str,
) -> Result<Vec<(String, ContentKey)>, ProtocolError> {
    offsets
        .iter()
        .map(|&offset| {
            let Some(mirror) = mirror else {
                return Err(ProtocolError::BadClientOffset {
                    direction,
                    offset,
                    reason: "no tables received for this bucket".into(),
                });
            };
            mirror
                .keys
                .get_path_string_and_key(&mirror.paths, offset)
                .map_err(|e| ProtocolError::BadClientOffset {
                    direction,
                    offset,
                    reason: e.to_string(),
                })
        })
        .collect()
}

/// Sort interned offsets, rejecting a file named twice.
fn sorted_unique(
    offsets: &[u32],
    items: &[(String, ContentKey)],
    direction: &'static str,
) -> Result<Vec<u32>, ProtocolError> {
    let mut order: Vec<usize> = (0..offsets.len()).collect();
    order.sort_unstable_by_key(|&i| offsets[i]);
    if let Some(w) = order.windows(2).find(|w| offsets[w[0]] == offsets[w[1]]) {
        return Err(ProtocolError::DuplicateFile {
            direction,
            path: items[w[1]].0.clone(),
        });
    }
    Ok(order.into_iter().map(|i| offsets[i]).collect())
}

/// Both slices ascending.
fn is_subset(small: &[u32], large: &[u32]) -> bool {
    small.iter().all(|v| large.binary_search(v).is_ok())
}

fn read_bucket_and_key(r: &mut BinaryReader<'_>) -> Result<(BucketId, CacheKey), ProtocolError> {
    let bucket = BucketId(r.read_varint()?);
    let key = CacheKey::read(r)?;
    Ok((bucket, key))
}

impl CacheServer {
    pub(super) fn handle_connect(
        &self,
        connection: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut r = BinaryReader::new(payload);
        let version = r.read_u32()?;
        let hint = r.read_string()?;
        if version != PROTOCOL_VERSION {
            log::warn!("rejecting {hint}: protocol version {version}, expected {PROTOCOL_VERSION}");
            return Err(ProtocolError::VersionMismatch {
                client: version,
                server: PROTOCOL_VERSION,
            });
        }

        let mut w = BinaryWriter::new();
        if self.gate.is_closed() {
            w.write_bool(false);
            w.write_string("Running maintenance");
            return Ok(w.into_inner());
        }

        let count = {
            let mut connections = self.connections.lock();
            connections.insert(connection, Arc::new(Mutex::new(Connection::new(hint.clone()))));
            connections.len()
        };
        self.stats.peak_connections.fetch_max(count, Ordering::Relaxed);
        log::info!("connection {connection} from {hint} accepted ({count} active)");
        w.write_bool(true);
        w.write_string("");
        Ok(w.into_inner())
    }

    fn extend_mirror(
        &self,
        conn: &Mutex<Connection>,
        payload: &[u8],
        kind: TableKind,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut r = BinaryReader::new(payload);
        let bucket = BucketId(r.read_varint()?);
        let bytes = r.read_rest();
        let mut conn = conn.lock();
        let mirror = conn
            .mirrors
            .entry(bucket)
            .or_insert_with(|| ClientTables::new(bucket));
        match kind {
            TableKind::Path => mirror.paths.extend_raw(bytes)?,
            TableKind::Content => mirror.keys.extend_raw(bytes)?,
        }
        Ok(Vec::new())
    }

    pub(super) fn handle_store_path_table(
        &self,
        conn: &Mutex<Connection>,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        self.extend_mirror(conn, payload, TableKind::Path)
    }

    pub(super) fn handle_store_content_table(
        &self,
        conn: &Mutex<Connection>,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        self.extend_mirror(conn, payload, TableKind::Content)
    }

    /// Intern the entry into the bucket and publish it, or park it until
    /// the client confirms the missing outputs were uploaded.
    ///
    /// Replies with the client offsets of outputs the content store lacks.
    pub(super) fn handle_store_entry(
        &self,
        conn: &Mutex<Connection>,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut r = BinaryReader::new(payload);
        let (bucket_id, cmd) = read_bucket_and_key(&mut r)?;
        let input_count = r.read_varint_u32()? as usize;
        let output_count = r.read_varint_u32()? as usize;
        let mut client_outputs = Vec::with_capacity(output_count.min(r.remaining()));
        for _ in 0..output_count {
            client_outputs.push(r.read_varint_u32()?);
        }
        let mut client_inputs = Vec::with_capacity(input_count.min(r.remaining()));
        for _ in 0..input_count {
            client_inputs.push(r.read_varint_u32()?);
        }
        let log_lines = r.read_rest().to_vec();

        let (output_items, input_items) = {
            let conn = conn.lock();
            let mirror = conn.mirrors.get(&bucket_id);
            (
                resolve(mirror, &client_outputs, "output")?,
                resolve(mirror, &client_inputs, "input")?,
            )
        };

        // One request per missing blob, however many outputs share it.
        let mut requested = FxHashSet::default();
        let missing: Vec<u32> = client_outputs
            .iter()
            .zip(&output_items)
            .filter(|(_, (_, key))| !self.store.has_content(key) && requested.insert(*key))
            .map(|(&offset, _)| offset)
            .collect();
        let mut reply = Vec::with_capacity(missing.len() * 2);
        for &offset in &missing {
            varint::write_u32(&mut reply, offset);
        }

        let bucket = self.bucket_or_insert(bucket_id);
        let mut items = output_items;
        items.extend(input_items);
        let offsets = bucket.intern(&items)?;
        let (out_offsets, in_offsets) = offsets.split_at(output_count);
        let outputs = sorted_unique(out_offsets, &items[..output_count], "output")?;
        let inputs = sorted_unique(in_offsets, &items[output_count..], "input")?;

        let now = self.now();
        let staged = {
            let tables = bucket.tables();
            let record = bucket.record_or_insert(cmd);
            let mut entries = record.write();
            self.stage_entry(
                &tables,
                &mut entries,
                &inputs,
                &outputs,
                log_lines,
                missing.is_empty(),
                now,
            )
        };

        match staged {
            Ok(Staged::Unchanged) => {
                log::trace!("bucket {bucket_id}: {cmd} already has these outputs");
            }
            Ok(Staged::Published) => {
                bucket.touch(now);
                bucket.mark_dirty();
                self.adds_since_maintenance.fetch_add(1, Ordering::Relaxed);
                conn.lock().stores += 1;
            }
            Ok(Staged::Deferred(entry)) => {
                log::debug!(
                    "bucket {bucket_id}: {cmd} waits for {} output(s)",
                    missing.len()
                );
                conn.lock().deferred.insert((bucket_id, cmd), entry);
            }
            Err(e) => {
                self.flag_for_rebuild(bucket_id, &format_args!("record {cmd}: {e}"));
                return Err(e.into());
            }
        }
        Ok(reply)
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_entry(
        &self,
        tables: &Tables,
        entries: &mut CacheEntries,
        inputs: &[u32],
        outputs: &[u32],
        log_lines: Vec<u8>,
        outputs_present: bool,
        now: u64,
    ) -> Result<Staged, EntriesError> {
        let mut entry = entries.build_inputs(inputs)?;
        entry.outputs = varint::encode_all(outputs);

        if let Some(index) = entries.find_matching(&entry) {
            let existing = &entries.entries[index];
            if is_subset(outputs, &existing.output_offsets()?) {
                return Ok(Staged::Unchanged);
            }
            if !self.config.replace_on_output_mismatch {
                log::warn!(
                    "entry {} stored again with different outputs; keeping the existing one",
                    existing.id
                );
                return Ok(Staged::Unchanged);
            }
            log::warn!(
                "entry {} stored again with different outputs; replacing it",
                existing.id
            );
            entries.remove(index);
        }

        entry.creation_time = now;
        entries.assign_log_lines(&mut entry, log_lines);

        let is_output = |offset: u32| {
            tables
                .keys
                .get_key(offset)
                .is_ok_and(|key| self.store.has_content(&key))
        };
        if entries.is_empty() {
            let shared = entries.shared_inputs.clone();
            entries.populate_inputs_that_are_outputs(&shared, &is_output)?;
        }
        entries.populate_inputs_that_are_outputs(&entry.extra_inputs, &is_output)?;

        if outputs_present {
            entries.push_front(entry);
            Ok(Staged::Published)
        } else {
            Ok(Staged::Deferred(entry))
        }
    }

    /// Publish a parked entry once its outputs are confirmed.
    pub(super) fn handle_store_entry_done(
        &self,
        conn: &Mutex<Connection>,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut r = BinaryReader::new(payload);
        let (bucket_id, cmd) = read_bucket_and_key(&mut r)?;
        let success = r.read_bool()?;

        let Some(entry) = conn.lock().deferred.remove(&(bucket_id, cmd)) else {
            return Ok(Vec::new());
        };
        if !success {
            log::debug!("bucket {bucket_id}: client abandoned {cmd}");
            return Ok(Vec::new());
        }
        let Some(bucket) = self.bucket(bucket_id) else {
            return Ok(Vec::new());
        };

        let outputs = entry.output_offsets()?;
        let published = {
            let tables = bucket.tables();
            let present = outputs.iter().all(|&o| {
                tables
                    .keys
                    .get_key(o)
                    .is_ok_and(|key| self.store.has_content(&key))
            });
            if present {
                let record = bucket.record_or_insert(cmd);
                let mut entries = record.write();
                if entries.find_matching(&entry).is_some() {
                    false
                } else {
                    entries.push_front(entry);
                    true
                }
            } else {
                log::debug!("bucket {bucket_id}: {cmd} still misses output content");
                false
            }
        };

        if published {
            bucket.touch(self.now());
            bucket.mark_dirty();
            self.adds_since_maintenance.fetch_add(1, Ordering::Relaxed);
            conn.lock().stores += 1;
        }
        Ok(Vec::new())
    }

    /// `[u32 total size][bytes from have]`, capped by the response size.
    pub(super) fn handle_fetch_table(
        &self,
        payload: &[u8],
        kind: TableKind,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut r = BinaryReader::new(payload);
        let bucket_id = BucketId(r.read_varint()?);
        let have = r.read_u32()? as usize;

        let mut w = BinaryWriter::new();
        let Some(bucket) = self.bucket(bucket_id) else {
            w.write_u32(0);
            return Ok(w.into_inner());
        };
        let tables = bucket.tables();
        let memory = match kind {
            TableKind::Path => tables.paths.memory(),
            TableKind::Content => tables.keys.memory(),
        };
        let start = have.min(memory.len());
        let end = memory
            .len()
            .min(start + self.config.fetch_response_cap.saturating_sub(4));
        w.write_u32(memory.len() as u32);
        w.write_bytes(&memory[start..end]);
        Ok(w.into_inner())
    }

    pub(super) fn handle_fetch_entries(
        &self,
        conn: &Mutex<Connection>,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut r = BinaryReader::new(payload);
        let (bucket_id, cmd) = read_bucket_and_key(&mut r)?;
        conn.lock().fetches += 1;

        let mut w = BinaryWriter::with_limit(self.config.fetch_response_cap);
        let count = match self.bucket(bucket_id).and_then(|b| b.record(&cmd)) {
            Some(record) => record.read().write_network(&mut w),
            None => {
                w.write_u16(0);
                0
            }
        };
        if count == 0 {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(w.into_inner())
    }

    /// Mark an entry used and return its log lines.
    pub(super) fn handle_report_used_entry(
        &self,
        conn: &Mutex<Connection>,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut r = BinaryReader::new(payload);
        let (bucket_id, cmd) = read_bucket_and_key(&mut r)?;
        let entry_id = r.read_varint_u32()?;

        let Some(bucket) = self.bucket(bucket_id) else {
            return Ok(Vec::new());
        };
        let Some(record) = bucket.record(&cmd) else {
            return Ok(Vec::new());
        };

        let now = self.now();
        let (log_lines, outputs) = {
            let mut entries = record.write();
            let Some(entry) = entries.entry_mut(entry_id) else {
                return Ok(Vec::new());
            };
            entry.last_used_time = now;
            let outputs = entry.output_offsets();
            let log_lines = entries
                .entries
                .iter()
                .find(|e| e.id == entry_id)
                .map(|e| entries.log_lines(e).to_vec())
                .unwrap_or_default();
            (log_lines, outputs)
        };
        bucket.touch(now);
        bucket.mark_dirty();
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        conn.lock().hits += 1;

        {
            let tables = bucket.tables();
            for offset in outputs? {
                if let Ok(key) = tables.keys.get_key(offset) {
                    self.store.mark_accessed(&key);
                }
            }
        }

        if log_lines.len() > self.config.fetch_response_cap {
            log::debug!(
                "bucket {bucket_id}: log lines of {cmd} entry {entry_id} exceed the response cap"
            );
            return Ok(Vec::new());
        }
        Ok(log_lines)
    }

    pub(super) fn handle_request_shutdown(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut r = BinaryReader::new(payload);
        let reason = r.read_string()?;
        self.request_shutdown(&reason);
        Ok(vec![1])
    }

    pub(super) fn handle_upload_content(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let key = self.store.store_content(payload)?;
        Ok(key.as_bytes().to_vec())
    }

    pub(super) fn handle_download_content(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut r = BinaryReader::new(payload);
        let key = ContentKey::read(&mut r)?;
        let mut w = BinaryWriter::new();
        match self.store.read_content(&key)? {
            Some(bytes) => {
                self.store.mark_accessed(&key);
                w.write_bool(true);
                w.write_bytes(&bytes);
            }
            None => w.write_bool(false),
        }
        Ok(w.into_inner())
    }
}
