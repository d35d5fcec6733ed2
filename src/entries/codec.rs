// Wire and disk encodings of `CacheEntries`.
//
// Network: [u16 count][blob shared] then per entry
//          [varint id][blob ranges][blob extras][blob outputs]
// Disk:    [blob shared][blob shared_log][varint count] then per entry
//          [varint id][varint created][varint used][blob ranges][blob extras]
//          [blob outputs][u8 log kind (+ blob when owned)]
//          followed by [varint primary][varint id_counter][varint n][n offsets]

use std::collections::BTreeSet;

use super::{CacheEntries, CacheEntry, EntriesError, LogLines};
use crate::binary::varint::encoded_len_u64;
use crate::binary::{BinaryReader, BinaryWriter};

/// Bytes of a fetch response kept free for the frame and entry count.
pub const FETCH_RESERVED_BYTES: usize = 32;

const LOG_EMPTY: u8 = 0;
const LOG_SHARED: u8 = 1;
const LOG_OWNED: u8 = 2;

fn blob_size(bytes: &[u8]) -> usize {
    encoded_len_u64(bytes.len() as u64) + bytes.len()
}

impl CacheEntries {
    /// Encoded size of one entry; `on_disk` adds the times and log lines.
    pub fn entry_size(entry: &CacheEntry, on_disk: bool) -> usize {
        let mut size = encoded_len_u64(u64::from(entry.id))
            + blob_size(&entry.shared_input_ranges)
            + blob_size(&entry.extra_inputs)
            + blob_size(&entry.outputs);
        if on_disk {
            size += encoded_len_u64(entry.creation_time)
                + encoded_len_u64(entry.last_used_time)
                + 1;
            if let LogLines::Owned(lines) = &entry.log_lines {
                size += blob_size(lines);
            }
        }
        size
    }

    /// Encoded size of the shared input blob with its length prefix.
    pub fn shared_size(&self) -> usize {
        blob_size(&self.shared_inputs)
    }

    pub fn total_size(&self, on_disk: bool) -> usize {
        let entries: usize = self
            .entries
            .iter()
            .map(|e| Self::entry_size(e, on_disk))
            .sum();
        if on_disk {
            let ito: usize = self
                .inputs_that_are_outputs
                .iter()
                .map(|&v| encoded_len_u64(u64::from(v)))
                .sum();
            self.shared_size()
                + blob_size(&self.shared_log_lines)
                + encoded_len_u64(self.entries.len() as u64)
                + entries
                + encoded_len_u64(u64::from(self.primary_id))
                + encoded_len_u64(u64::from(self.id_counter))
                + encoded_len_u64(self.inputs_that_are_outputs.len() as u64)
                + ito
        } else {
            2 + self.shared_size() + entries
        }
    }

    /// Write the fetch form, stopping at the first entry that would exceed
    /// the writer's capacity. Returns the number of entries written.
    pub fn write_network(&self, w: &mut BinaryWriter) -> u16 {
        let count_pos = w.position();
        w.write_u16(0);
        if self.entries.is_empty() || self.shared_size() > w.capacity_left() {
            return 0;
        }
        w.write_blob(&self.shared_inputs);

        let mut count = 0u16;
        for entry in &self.entries {
            if count == u16::MAX || Self::entry_size(entry, false) > w.capacity_left() {
                break;
            }
            w.write_varint(u64::from(entry.id));
            w.write_blob(&entry.shared_input_ranges);
            w.write_blob(&entry.extra_inputs);
            w.write_blob(&entry.outputs);
            count += 1;
        }
        w.patch_u16(count_pos, count);
        count
    }

    /// Decode the fetch form. Only ids and offset blobs are carried.
    pub fn read_network(r: &mut BinaryReader<'_>) -> Result<Self, EntriesError> {
        let count = r.read_u16()?;
        let mut out = Self::new();
        if count == 0 {
            return Ok(out);
        }
        out.shared_inputs = r.read_blob()?.to_vec();
        for _ in 0..count {
            let id = r.read_varint_u32()?;
            out.entries.push_back(CacheEntry {
                id,
                shared_input_ranges: r.read_blob()?.to_vec(),
                extra_inputs: r.read_blob()?.to_vec(),
                outputs: r.read_blob()?.to_vec(),
                ..CacheEntry::default()
            });
        }
        Ok(out)
    }

    pub fn write_disk(&self, w: &mut BinaryWriter) {
        w.write_blob(&self.shared_inputs);
        w.write_blob(&self.shared_log_lines);
        w.write_varint(self.entries.len() as u64);
        for entry in &self.entries {
            w.write_varint(u64::from(entry.id));
            w.write_varint(entry.creation_time);
            w.write_varint(entry.last_used_time);
            w.write_blob(&entry.shared_input_ranges);
            w.write_blob(&entry.extra_inputs);
            w.write_blob(&entry.outputs);
            match &entry.log_lines {
                LogLines::Empty => w.write_u8(LOG_EMPTY),
                LogLines::Shared => w.write_u8(LOG_SHARED),
                LogLines::Owned(lines) => {
                    w.write_u8(LOG_OWNED);
                    w.write_blob(lines);
                }
            }
        }
        w.write_varint(u64::from(self.primary_id));
        w.write_varint(u64::from(self.id_counter));
        w.write_varint(self.inputs_that_are_outputs.len() as u64);
        for &offset in &self.inputs_that_are_outputs {
            w.write_varint(u64::from(offset));
        }
    }

    pub fn read_disk(r: &mut BinaryReader<'_>) -> Result<Self, EntriesError> {
        let mut out = Self::new();
        out.shared_inputs = r.read_blob()?.to_vec();
        out.shared_log_lines = r.read_blob()?.to_vec();

        let count = r.read_varint()?;
        for _ in 0..count {
            let id = r.read_varint_u32()?;
            let creation_time = r.read_varint()?;
            let last_used_time = r.read_varint()?;
            let shared_input_ranges = r.read_blob()?.to_vec();
            let extra_inputs = r.read_blob()?.to_vec();
            let outputs = r.read_blob()?.to_vec();
            let log_lines = match r.read_u8()? {
                LOG_EMPTY => LogLines::Empty,
                LOG_SHARED => LogLines::Shared,
                LOG_OWNED => LogLines::Owned(r.read_blob()?.to_vec()),
                other => return Err(EntriesError::UnknownLogKind(other)),
            };
            out.entries.push_back(CacheEntry {
                creation_time,
                last_used_time,
                id,
                shared_input_ranges,
                extra_inputs,
                outputs,
                log_lines,
            });
        }

        out.primary_id = r.read_varint_u32()?;
        out.id_counter = r.read_varint_u32()?;
        let tracked = r.read_varint()?;
        let mut ito = BTreeSet::new();
        for _ in 0..tracked {
            ito.insert(r.read_varint_u32()?);
        }
        out.inputs_that_are_outputs = ito;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::varint;
    use crate::entries::CHECK_ALL_INPUTS;

    fn sample() -> CacheEntries {
        let mut entries = CacheEntries::new();
        for (i, inputs) in [&[1u32, 4, 6][..], &[0, 4, 6], &[2, 4, 6, 300]]
            .into_iter()
            .enumerate()
        {
            let mut e = entries.build_inputs(inputs).unwrap();
            e.outputs = varint::encode_all(&[500 + i as u32]);
            e.creation_time = 1000 * i as u64;
            let log = if i == 2 { b"error: x".to_vec() } else { b"ok".to_vec() };
            entries.assign_log_lines(&mut e, log);
            entries.push_front(e);
        }
        entries.inputs_that_are_outputs.insert(4);
        entries
    }

    #[test]
    fn disk_form_preserves_everything() {
        let entries = sample();
        let mut w = BinaryWriter::new();
        entries.write_disk(&mut w);
        assert_eq!(w.position(), entries.total_size(true));

        let bytes = w.into_inner();
        let mut r = BinaryReader::new(&bytes);
        let loaded = CacheEntries::read_disk(&mut r).unwrap();
        assert!(r.is_empty());
        assert_eq!(loaded, entries);
        loaded.validate().unwrap();
    }

    #[test]
    fn network_form_carries_offsets_only() {
        let entries = sample();
        let mut w = BinaryWriter::with_limit(4096);
        assert_eq!(entries.write_network(&mut w), 3);
        assert_eq!(w.position(), entries.total_size(false));

        let bytes = w.into_inner();
        let fetched = CacheEntries::read_network(&mut BinaryReader::new(&bytes)).unwrap();
        assert_eq!(fetched.len(), 3);
        for (a, b) in fetched.entries.iter().zip(&entries.entries) {
            assert_eq!(a.id, b.id);
            assert_eq!(fetched.flatten(a).unwrap(), entries.flatten(b).unwrap());
            assert_eq!(a.outputs, b.outputs);
            assert_eq!(a.log_lines, LogLines::Empty);
        }
    }

    #[test]
    fn network_form_stops_at_capacity() {
        let entries = sample();
        let first = CacheEntries::entry_size(&entries.entries[0], false);
        let mut w = BinaryWriter::with_limit(2 + entries.shared_size() + first);
        assert_eq!(entries.write_network(&mut w), 1);

        let mut tiny = BinaryWriter::with_limit(3);
        assert_eq!(entries.write_network(&mut tiny), 0);
        assert_eq!(tiny.as_slice(), &[0, 0]);
    }

    #[test]
    fn unknown_log_kind_is_an_error() {
        let mut entries = CacheEntries::new();
        let e = entries.build_inputs(&[1]).unwrap();
        entries.push_front(e);
        let mut w = BinaryWriter::new();
        entries.write_disk(&mut w);
        let mut bytes = w.into_inner();
        // Log kind follows shared(2) log(1) count(1) id(1) times(2) ranges(3) extras(1) outputs(1).
        bytes[12] = 9;
        assert_eq!(
            CacheEntries::read_disk(&mut BinaryReader::new(&bytes)),
            Err(EntriesError::UnknownLogKind(9))
        );
    }

    #[test]
    fn truncated_disk_form_is_an_error() {
        let mut entries = sample();
        entries.inputs_that_are_outputs.insert(CHECK_ALL_INPUTS);
        let mut w = BinaryWriter::new();
        entries.write_disk(&mut w);
        let bytes = w.into_inner();
        for cut in [1, bytes.len() / 2, bytes.len() - 1] {
            assert!(CacheEntries::read_disk(&mut BinaryReader::new(&bytes[..cut])).is_err());
        }
    }
}
