// Cache entries for one cache key.
//
// The input offsets of the primary entry are stored once, varint encoded
// and sorted, in `shared_inputs`. Every entry then lists the byte ranges
// of that blob it uses plus the few offsets the blob lacks. Two builds of
// the same command that differ in one header cost one range pair and one
// extra offset instead of a full input list.

mod codec;
mod compact;

use std::collections::{BTreeSet, VecDeque};

use crate::binary::varint::{self, VarIntError};
use crate::binary::ReadError;

pub use codec::FETCH_RESERVED_BYTES;

/// `primary_id` value when no entry owns the shared blob.
pub const NO_PRIMARY: u32 = u32::MAX;

/// Sentinel in `inputs_that_are_outputs` meaning every input is checked.
pub const CHECK_ALL_INPUTS: u32 = u32::MAX;

/// Tracked inputs-that-are-outputs beyond which the set collapses to
/// [`CHECK_ALL_INPUTS`].
pub const MAX_TRACKED_INPUTS_THAT_ARE_OUTPUTS: usize = 64;

/// Log text shorter than this may become the shared log lines.
pub const SHARED_LOG_LINES_LIMIT: usize = 150;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntriesError {
    #[error("malformed varint data in {field}: {source}")]
    Malformed {
        field: &'static str,
        #[source]
        source: VarIntError,
    },
    #[error("range [{begin}, {end}) lies outside the {len}-byte shared input blob")]
    RangeOutOfBounds { begin: u32, end: u32, len: usize },
    #[error("range [{begin}, {end}) does not start and end on input boundaries")]
    RangeMisaligned { begin: u32, end: u32 },
    #[error("ranges of entry {id} are not ascending and disjoint")]
    RangesUnordered { id: u32 },
    #[error("shared input offsets are not strictly ascending")]
    SharedUnsorted,
    #[error("entry {id} lists input offset {offset} more than once")]
    DuplicateInput { id: u32, offset: u32 },
    #[error("entry {id} lists input offset {offset} both in a shared range and as extra")]
    SharedExtraOverlap { id: u32, offset: u32 },
    #[error("input offsets must be strictly ascending")]
    UnsortedInputs,
    #[error("unknown log line kind {0}")]
    UnknownLogKind(u8),
    #[error(transparent)]
    Read(#[from] ReadError),
}

pub(crate) fn decode(field: &'static str, bytes: &[u8]) -> Result<Vec<u32>, EntriesError> {
    varint::decode_all(bytes).map_err(|source| EntriesError::Malformed { field, source })
}

/// Where an entry's captured log text lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogLines {
    #[default]
    Empty,
    /// Identical to the record's `shared_log_lines`.
    Shared,
    Owned(Vec<u8>),
}

/// One accepted (inputs -> outputs) pairing.
///
/// Times are milliseconds since the database was created. The three
/// offset lists are varint blobs: `shared_input_ranges` holds `[begin, end)`
/// byte positions into the owning record's `shared_inputs`, the other two
/// hold content-key-table offsets in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEntry {
    pub creation_time: u64,
    pub last_used_time: u64,
    pub id: u32,
    pub shared_input_ranges: Vec<u8>,
    pub extra_inputs: Vec<u8>,
    pub outputs: Vec<u8>,
    pub log_lines: LogLines,
}

impl CacheEntry {
    /// Output offsets in ascending order.
    pub fn output_offsets(&self) -> Result<Vec<u32>, EntriesError> {
        decode("outputs", &self.outputs)
    }

    /// Last use, or creation when never used.
    pub fn last_touched(&self) -> u64 {
        if self.last_used_time == 0 {
            self.creation_time
        } else {
            self.last_used_time
        }
    }
}

/// Every entry stored for one cache key, most recent first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntries {
    pub shared_inputs: Vec<u8>,
    pub shared_log_lines: Vec<u8>,
    pub entries: VecDeque<CacheEntry>,
    pub inputs_that_are_outputs: BTreeSet<u32>,
    pub primary_id: u32,
    pub id_counter: u32,
}

impl Default for CacheEntries {
    fn default() -> Self {
        Self {
            shared_inputs: Vec::new(),
            shared_log_lines: Vec::new(),
            entries: VecDeque::new(),
            inputs_that_are_outputs: BTreeSet::new(),
            primary_id: NO_PRIMARY,
            id_counter: 0,
        }
    }
}

impl CacheEntries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Index of the entry with exactly the same effective inputs.
    ///
    /// Both sides are built against the current shared blob, so equal
    /// input sets have byte-identical ranges and extras.
    pub fn find_matching(&self, candidate: &CacheEntry) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.shared_input_ranges == candidate.shared_input_ranges
                && e.extra_inputs == candidate.extra_inputs
        })
    }

    pub fn push_front(&mut self, entry: CacheEntry) {
        self.entries.push_front(entry);
    }

    pub fn remove(&mut self, index: usize) -> Option<CacheEntry> {
        let entry = self.entries.remove(index)?;
        if entry.id == self.primary_id {
            self.primary_id = NO_PRIMARY;
        }
        Some(entry)
    }

    pub fn entry_mut(&mut self, id: u32) -> Option<&mut CacheEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Attach captured log text to `entry`, deduplicating against the
    /// record's shared log lines.
    pub fn assign_log_lines(&mut self, entry: &mut CacheEntry, lines: Vec<u8>) {
        entry.log_lines = if lines.is_empty() {
            LogLines::Empty
        } else if self.shared_log_lines.is_empty() && lines.len() < SHARED_LOG_LINES_LIMIT {
            self.shared_log_lines = lines;
            LogLines::Shared
        } else if self.shared_log_lines == lines {
            LogLines::Shared
        } else {
            LogLines::Owned(lines)
        };
    }

    /// The log text `entry` replays.
    pub fn log_lines<'a>(&'a self, entry: &'a CacheEntry) -> &'a [u8] {
        match &entry.log_lines {
            LogLines::Empty => &[],
            LogLines::Shared => &self.shared_log_lines,
            LogLines::Owned(lines) => lines,
        }
    }

    pub fn checks_all_inputs(&self) -> bool {
        self.inputs_that_are_outputs.contains(&CHECK_ALL_INPUTS)
    }

    /// Record which offsets of the varint blob `offsets` name content that
    /// is itself a stored output.
    pub fn populate_inputs_that_are_outputs(
        &mut self,
        offsets: &[u8],
        mut is_output: impl FnMut(u32) -> bool,
    ) -> Result<(), EntriesError> {
        if self.checks_all_inputs() {
            return Ok(());
        }
        for offset in decode("inputs", offsets)? {
            if !is_output(offset) {
                continue;
            }
            self.inputs_that_are_outputs.insert(offset);
            if self.inputs_that_are_outputs.len() > MAX_TRACKED_INPUTS_THAT_ARE_OUTPUTS {
                self.inputs_that_are_outputs.clear();
                self.inputs_that_are_outputs.insert(CHECK_ALL_INPUTS);
                break;
            }
        }
        Ok(())
    }
}
