// Compact path table: hierarchical paths interned into one byte arena.
//
// Node layout at offset `o`:
//
//   [varint (o - parent) << 1 | is_dot][varint segment_offset][blob if 0]
//
// A node is one path segment hanging off its parent node. Parent offset 0
// means "no parent" (byte 0 of the arena is reserved). The separator in
// front of the segment is '.' when `is_dot` is set and '/' otherwise.
// Segment strings are stored once, inline in the first node that uses
// them, and referenced by offset from every later node.

use std::borrow::Cow;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::binary::{varint, BinaryReader};

/// Longest parent chain `get_string` will follow before assuming corruption.
pub const MAX_PATH_DEPTH: usize = 48;

/// Segments pre-seeded into every bucket table so that rebuilt tables keep
/// them at identical offsets. In a case-insensitive table a seeded segment
/// always reads back with the spelling listed here; other segments read
/// back as they were first added.
const COMMON_SEGMENTS: &[&str] = &[
    "", "c", "cc", "cpp", "h", "hpp", "inl", "o", "obj", "pch", "gch", "d", "rs", "lib", "a",
    "so", "dll", "json", "rsp", "src", "include", "Source", "Private", "Public", "Classes",
    "Intermediate", "Build", "Engine", "Plugins", "Runtime", "Development", "Debug", "Release",
    "Shipping", "x64", "usr", "bin",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathTableError {
    #[error("path is empty")]
    EmptyPath,
    #[error("path has more than {MAX_PATH_DEPTH} segments")]
    TooDeep,
    #[error("offset {offset} is outside path table of {size} bytes")]
    OutOfRange { offset: u32, size: usize },
    #[error("malformed path node at offset {offset}")]
    Malformed { offset: u32 },
    #[error("path at offset {offset} exceeds the maximum depth")]
    DepthExceeded { offset: u32 },
    #[error("path at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: u32 },
    #[error("path table exceeds 4 GiB")]
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NodeKey {
    parent: u32,
    is_dot: bool,
    segment: u32,
}

struct Node<'a> {
    parent: u32,
    is_dot: bool,
    segment_offset: u32,
    segment: &'a [u8],
    inline: bool,
    end: usize,
}

#[derive(Debug, Clone)]
pub struct CompactPathTable {
    memory: Vec<u8>,
    case_insensitive: bool,
    version: u32,
    common_end: u32,
    segments: FxHashMap<Vec<u8>, u32>,
    nodes: FxHashMap<NodeKey, u32>,
    path_count: u32,
}

impl CompactPathTable {
    /// An empty table without seeded segments (client side and mirrors).
    pub fn new(case_insensitive: bool, version: u32) -> Self {
        Self {
            memory: vec![0],
            case_insensitive,
            version,
            common_end: 1,
            segments: FxHashMap::default(),
            nodes: FxHashMap::default(),
            path_count: 0,
        }
    }

    /// An empty table seeded with the common segments (server buckets).
    pub fn with_common_segments(case_insensitive: bool, version: u32) -> Self {
        let mut table = Self::new(case_insensitive, version);
        for seg in COMMON_SEGMENTS {
            let pos = table.memory.len() as u32;
            varint::write_u64(&mut table.memory, seg.len() as u64);
            table.memory.extend_from_slice(seg.as_bytes());
            let key = table.segment_key(seg.as_bytes()).into_owned();
            table.segments.entry(key).or_insert(pos);
        }
        table.common_end = table.memory.len() as u32;
        table
    }

    /// Rebuild a table from its serialized arena.
    pub fn from_memory(
        memory: Vec<u8>,
        case_insensitive: bool,
        version: u32,
    ) -> Result<Self, PathTableError> {
        if memory.first() != Some(&0) || memory.len() > u32::MAX as usize {
            return Err(PathTableError::Malformed { offset: 0 });
        }
        let seeded = Self::with_common_segments(case_insensitive, version);
        let mut table = Self::new(case_insensitive, version);
        if memory.starts_with(&seeded.memory) {
            table.common_end = seeded.common_end;
            table.segments = seeded.segments;
        }
        table.memory = memory;

        let mut pos = table.common_end as usize;
        while pos < table.memory.len() {
            let offset = pos as u32;
            let node = table.parse_node(offset)?;
            let key = NodeKey {
                parent: node.parent,
                is_dot: node.is_dot,
                segment: node.segment_offset,
            };
            let inline_segment = node
                .inline
                .then(|| table.segment_key(node.segment).into_owned());
            pos = node.end;

            if let Some(seg) = inline_segment {
                table.segments.entry(seg).or_insert(key.segment);
            }
            table.nodes.entry(key).or_insert(offset);
            table.path_count += 1;
        }
        Ok(table)
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.memory.len() as u32
    }

    #[inline]
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    #[inline]
    pub fn path_count(&self) -> u32 {
        self.path_count
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    fn segment_key<'a>(&self, segment: &'a [u8]) -> Cow<'a, [u8]> {
        if self.case_insensitive && segment.iter().any(u8::is_ascii_uppercase) {
            Cow::Owned(segment.to_ascii_lowercase())
        } else {
            Cow::Borrowed(segment)
        }
    }

    // -----------------------------------------------------------------------
    // Interning
    // -----------------------------------------------------------------------

    /// Intern `path`, returning the offset of its final node.
    ///
    /// Backslashes are normalized to '/' before splitting.
    pub fn add(&mut self, path: &str) -> Result<u32, PathTableError> {
        if path.is_empty() {
            return Err(PathTableError::EmptyPath);
        }
        let normalized: Cow<'_, str> = if path.contains('\\') {
            Cow::Owned(path.replace('\\', "/"))
        } else {
            Cow::Borrowed(path)
        };
        let bytes = normalized.as_bytes();

        let mut parts: SmallVec<[(bool, &[u8]); 16]> = SmallVec::new();
        let mut start = 0;
        let mut is_dot = false;
        for (i, &b) in bytes.iter().enumerate() {
            if b == b'/' || b == b'.' {
                parts.push((is_dot, &bytes[start..i]));
                is_dot = b == b'.';
                start = i + 1;
            }
        }
        parts.push((is_dot, &bytes[start..]));
        if parts.len() > MAX_PATH_DEPTH {
            return Err(PathTableError::TooDeep);
        }

        let mut parent = 0;
        for (is_dot, segment) in parts {
            parent = self.intern_node(parent, is_dot, segment)?;
        }
        Ok(parent)
    }

    fn intern_node(
        &mut self,
        parent: u32,
        is_dot: bool,
        segment: &[u8],
    ) -> Result<u32, PathTableError> {
        let key = self.segment_key(segment);
        match self.segments.get(key.as_ref()).copied() {
            Some(seg) => self.intern_with_segment(parent, is_dot, seg),
            None => {
                let key = key.into_owned();
                self.append_node(parent, is_dot, None, segment, Some(key))
            }
        }
    }

    fn intern_with_segment(
        &mut self,
        parent: u32,
        is_dot: bool,
        segment: u32,
    ) -> Result<u32, PathTableError> {
        let key = NodeKey {
            parent,
            is_dot,
            segment,
        };
        if let Some(&offset) = self.nodes.get(&key) {
            return Ok(offset);
        }
        self.append_node(parent, is_dot, Some(segment), &[], None)
    }

    fn append_node(
        &mut self,
        parent: u32,
        is_dot: bool,
        segment: Option<u32>,
        bytes: &[u8],
        segment_key: Option<Vec<u8>>,
    ) -> Result<u32, PathTableError> {
        // Worst case: two 10-byte varints, a length varint and the bytes.
        if self.memory.len() + 30 + bytes.len() > u32::MAX as usize {
            return Err(PathTableError::Full);
        }
        let offset = self.memory.len() as u32;
        let rel = u64::from(offset - parent);
        varint::write_u64(&mut self.memory, rel << 1 | u64::from(is_dot));

        let segment = match segment {
            Some(seg) => {
                varint::write_u32(&mut self.memory, seg);
                seg
            }
            None => {
                varint::write_u32(&mut self.memory, 0);
                let pos = self.memory.len() as u32;
                varint::write_u64(&mut self.memory, bytes.len() as u64);
                self.memory.extend_from_slice(bytes);
                if let Some(key) = segment_key {
                    self.segments.insert(key, pos);
                }
                pos
            }
        };

        self.nodes.insert(
            NodeKey {
                parent,
                is_dot,
                segment,
            },
            offset,
        );
        self.path_count += 1;
        Ok(offset)
    }

    /// Copy the path at `offset` in `other` into this table.
    ///
    /// `memo` maps already-copied node offsets of `other` to offsets in
    /// `self`; reuse it across calls to copy a whole table in linear time.
    /// Common segments are referenced in place when both tables were seeded.
    pub fn add_from(
        &mut self,
        other: &CompactPathTable,
        offset: u32,
        memo: &mut FxHashMap<u32, u32>,
    ) -> Result<u32, PathTableError> {
        if let Some(&known) = memo.get(&offset) {
            return Ok(known);
        }

        let mut chain: SmallVec<[u32; 16]> = SmallVec::new();
        let mut parent_new = 0;
        let mut cur = offset;
        loop {
            if chain.len() == MAX_PATH_DEPTH {
                return Err(PathTableError::DepthExceeded { offset });
            }
            chain.push(cur);
            let parent = other.parse_node(cur)?.parent;
            if parent == 0 {
                break;
            }
            if let Some(&known) = memo.get(&parent) {
                parent_new = known;
                break;
            }
            cur = parent;
        }

        let shared_commons = self.common_end > 1 && self.common_end == other.common_end;
        for &old in chain.iter().rev() {
            let node = other.parse_node(old)?;
            let new = if shared_commons && node.segment_offset < other.common_end {
                self.intern_with_segment(parent_new, node.is_dot, node.segment_offset)?
            } else {
                self.intern_node(parent_new, node.is_dot, node.segment)?
            };
            memo.insert(old, new);
            parent_new = new;
        }
        Ok(parent_new)
    }

    /// Append raw arena bytes received from a client.
    ///
    /// Mirrors only answer `get_string`; they keep no lookup maps.
    pub fn extend_raw(&mut self, bytes: &[u8]) -> Result<(), PathTableError> {
        if self.memory.len() + bytes.len() > u32::MAX as usize {
            return Err(PathTableError::Full);
        }
        self.memory.extend_from_slice(bytes);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    fn parse_node(&self, offset: u32) -> Result<Node<'_>, PathTableError> {
        let size = self.memory.len();
        if offset == 0 || offset as usize >= size {
            return Err(PathTableError::OutOfRange { offset, size });
        }
        let malformed = |_| PathTableError::Malformed { offset };
        let mut r = BinaryReader::new(&self.memory);
        r.set_position(offset as usize).map_err(malformed)?;

        let head = r.read_varint().map_err(malformed)?;
        let rel = head >> 1;
        if rel == 0 || rel > u64::from(offset) {
            return Err(PathTableError::Malformed { offset });
        }
        let parent = offset - rel as u32;
        let is_dot = head & 1 == 1;

        let seg = r.read_varint_u32().map_err(malformed)?;
        if seg == 0 {
            let segment_offset = r.position() as u32;
            let segment = r.read_blob().map_err(malformed)?;
            return Ok(Node {
                parent,
                is_dot,
                segment_offset,
                segment,
                inline: true,
                end: r.position(),
            });
        }

        let end = r.position();
        r.set_position(seg as usize).map_err(malformed)?;
        let segment = r.read_blob().map_err(malformed)?;
        Ok(Node {
            parent,
            is_dot,
            segment_offset: seg,
            segment,
            inline: false,
            end,
        })
    }

    /// Append the path at `offset` to `out`.
    pub fn get_string_into(&self, offset: u32, out: &mut String) -> Result<(), PathTableError> {
        let mut chain: SmallVec<[(bool, &[u8]); 16]> = SmallVec::new();
        let mut cur = offset;
        loop {
            if chain.len() == MAX_PATH_DEPTH {
                return Err(PathTableError::DepthExceeded { offset });
            }
            let node = self.parse_node(cur)?;
            chain.push((node.is_dot, node.segment));
            if node.parent == 0 {
                break;
            }
            cur = node.parent;
        }

        let mut bytes = Vec::with_capacity(chain.iter().map(|(_, s)| s.len() + 1).sum());
        for (i, (is_dot, segment)) in chain.iter().rev().enumerate() {
            if i > 0 {
                bytes.push(if *is_dot { b'.' } else { b'/' });
            }
            bytes.extend_from_slice(segment);
        }
        let s = std::str::from_utf8(&bytes).map_err(|_| PathTableError::InvalidUtf8 { offset })?;
        out.push_str(s);
        Ok(())
    }

    /// Resolve `offset` back to its path. Fails instead of panicking on
    /// out-of-range or corrupt offsets.
    pub fn get_string(&self, offset: u32) -> Result<String, PathTableError> {
        let mut out = String::new();
        self.get_string_into(offset, &mut out)?;
        Ok(out)
    }

    /// Offsets of every node in arena order.
    pub fn node_offsets(&self) -> Result<Vec<u32>, PathTableError> {
        let mut out = Vec::with_capacity(self.path_count as usize);
        let mut pos = self.common_end as usize;
        while pos < self.memory.len() {
            out.push(pos as u32);
            pos = self.parse_node(pos as u32)?.end;
        }
        Ok(out)
    }

    /// Every interned segment with the number of nodes referencing it,
    /// most used first.
    pub fn segment_usage(&self) -> Vec<(String, u32)> {
        let mut counts: FxHashMap<u32, u32> = FxHashMap::default();
        for key in self.nodes.keys() {
            *counts.entry(key.segment).or_default() += 1;
        }
        let mut out: Vec<(String, u32)> = counts
            .into_iter()
            .filter_map(|(seg, count)| {
                let mut r = BinaryReader::new(&self.memory);
                r.set_position(seg as usize).ok()?;
                let bytes = r.read_blob().ok()?;
                Some((String::from_utf8_lossy(bytes).into_owned(), count))
            })
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }
}
