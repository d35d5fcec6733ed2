// Compact content-key table.
//
// Each record is `[varint path_offset][32-byte content key]`; the record's
// byte offset is its handle. The lookup is keyed by content key alone and
// the value grows through three tiers as one key collects more paths.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::binary::{varint, BinaryReader};
use crate::key::{ContentKey, KEY_SIZE};
use crate::table::path::{CompactPathTable, PathTableError};

/// Paths held inline before a key's lookup switches to a map.
const FEW_CAPACITY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentTableError {
    #[error("offset {offset} is outside content-key table of {size} bytes")]
    OutOfRange { offset: u32, size: usize },
    #[error("malformed content-key record at offset {offset}")]
    Malformed { offset: u32 },
    #[error("content-key table exceeds 4 GiB")]
    Full,
    #[error(transparent)]
    Path(#[from] PathTableError),
}

/// `(path_offset, record_offset)` pairs known for one content key.
#[derive(Debug, Clone)]
enum KeyPaths {
    One { path: u32, offset: u32 },
    Few(SmallVec<[(u32, u32); FEW_CAPACITY]>),
    Many(FxHashMap<u32, u32>),
}

impl KeyPaths {
    fn find(&self, path: u32) -> Option<u32> {
        match self {
            KeyPaths::One { path: p, offset } => (*p == path).then_some(*offset),
            KeyPaths::Few(pairs) => pairs.iter().find(|(p, _)| *p == path).map(|(_, o)| *o),
            KeyPaths::Many(map) => map.get(&path).copied(),
        }
    }

    fn insert(&mut self, path: u32, offset: u32) {
        match self {
            KeyPaths::One { path: p, offset: o } => {
                let mut pairs = SmallVec::new();
                pairs.push((*p, *o));
                pairs.push((path, offset));
                *self = KeyPaths::Few(pairs);
            }
            KeyPaths::Few(pairs) if pairs.len() < FEW_CAPACITY => pairs.push((path, offset)),
            KeyPaths::Few(pairs) => {
                let mut map: FxHashMap<u32, u32> = pairs.iter().copied().collect();
                map.insert(path, offset);
                *self = KeyPaths::Many(map);
            }
            KeyPaths::Many(map) => {
                map.insert(path, offset);
            }
        }
    }

    fn for_each_offset(&self, mut f: impl FnMut(u32)) {
        match self {
            KeyPaths::One { offset, .. } => f(*offset),
            KeyPaths::Few(pairs) => pairs.iter().for_each(|(_, o)| f(*o)),
            KeyPaths::Many(map) => map.values().for_each(|o| f(*o)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompactContentKeyTable {
    memory: Vec<u8>,
    lookup: FxHashMap<ContentKey, KeyPaths>,
    record_count: u32,
}

impl CompactContentKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a table (with its lookup) from a serialized arena.
    pub fn from_memory(memory: Vec<u8>) -> Result<Self, ContentTableError> {
        if memory.len() > u32::MAX as usize {
            return Err(ContentTableError::Full);
        }
        let mut table = Self {
            memory,
            ..Self::default()
        };
        let mut r = BinaryReader::new(&table.memory);
        let mut records = Vec::new();
        while !r.is_empty() {
            let offset = r.position() as u32;
            let malformed = |_| ContentTableError::Malformed { offset };
            let path = r.read_varint_u32().map_err(malformed)?;
            let key = ContentKey(r.read_array().map_err(malformed)?);
            records.push((key, path, offset));
        }
        for (key, path, offset) in records {
            table.index(key, path, offset);
        }
        Ok(table)
    }

    fn index(&mut self, key: ContentKey, path: u32, offset: u32) {
        match self.lookup.get_mut(&key) {
            Some(paths) => {
                if paths.find(path).is_none() {
                    paths.insert(path, offset);
                }
            }
            None => {
                self.lookup.insert(key, KeyPaths::One { path, offset });
            }
        }
        self.record_count += 1;
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.memory.len() as u32
    }

    #[inline]
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Number of records (distinct `(key, path)` pairs).
    #[inline]
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Number of distinct content keys.
    #[inline]
    pub fn key_count(&self) -> usize {
        self.lookup.len()
    }

    /// Intern `(key, path_offset)`, returning the record offset.
    pub fn add(&mut self, key: ContentKey, path_offset: u32) -> Result<u32, ContentTableError> {
        if let Some(offset) = self.lookup.get(&key).and_then(|p| p.find(path_offset)) {
            return Ok(offset);
        }
        if self.memory.len() + KEY_SIZE + varint::MAX_VARINT_LEN > u32::MAX as usize {
            return Err(ContentTableError::Full);
        }
        let offset = self.memory.len() as u32;
        varint::write_u32(&mut self.memory, path_offset);
        self.memory.extend_from_slice(key.as_bytes());
        self.index(key, path_offset, offset);
        Ok(offset)
    }

    /// Append raw arena bytes received from a client (no lookup maintained).
    pub fn extend_raw(&mut self, bytes: &[u8]) -> Result<(), ContentTableError> {
        if self.memory.len() + bytes.len() > u32::MAX as usize {
            return Err(ContentTableError::Full);
        }
        self.memory.extend_from_slice(bytes);
        Ok(())
    }

    /// Decode the record at `offset`.
    pub fn get_path_and_key(&self, offset: u32) -> Result<(u32, ContentKey), ContentTableError> {
        let size = self.memory.len();
        if offset as usize >= size {
            return Err(ContentTableError::OutOfRange { offset, size });
        }
        let malformed = |_| ContentTableError::Malformed { offset };
        let mut r = BinaryReader::new(&self.memory);
        r.set_position(offset as usize).map_err(malformed)?;
        let path = r.read_varint_u32().map_err(malformed)?;
        let key = ContentKey(r.read_array().map_err(malformed)?);
        Ok((path, key))
    }

    pub fn get_key(&self, offset: u32) -> Result<ContentKey, ContentTableError> {
        Ok(self.get_path_and_key(offset)?.1)
    }

    /// Decode the record at `offset` and resolve its path through `paths`.
    pub fn get_path_string_and_key(
        &self,
        paths: &CompactPathTable,
        offset: u32,
    ) -> Result<(String, ContentKey), ContentTableError> {
        let (path, key) = self.get_path_and_key(offset)?;
        Ok((paths.get_string(path)?, key))
    }

    /// Call `f` with every record offset stored for `key`.
    pub fn for_each_offset(&self, key: &ContentKey, f: impl FnMut(u32)) {
        if let Some(paths) = self.lookup.get(key) {
            paths.for_each_offset(f);
        }
    }

    /// Every record offset in arena order.
    pub fn record_offsets(&self) -> Result<Vec<u32>, ContentTableError> {
        let mut out = Vec::with_capacity(self.record_count as usize);
        let mut r = BinaryReader::new(&self.memory);
        while !r.is_empty() {
            let offset = r.position() as u32;
            out.push(offset);
            let malformed = |_| ContentTableError::Malformed { offset };
            r.read_varint().map_err(malformed)?;
            r.read_bytes(KEY_SIZE).map_err(malformed)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> ContentKey {
        ContentKey::from_content(&[n])
    }

    #[test]
    fn add_returns_stable_offsets() {
        let mut t = CompactContentKeyTable::new();
        let a = t.add(key(1), 10).unwrap();
        let b = t.add(key(2), 10).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1 + KEY_SIZE as u32);
        assert_eq!(t.add(key(1), 10).unwrap(), a);
        assert_eq!(t.record_count(), 2);
        assert_eq!(t.get_path_and_key(b).unwrap(), (10, key(2)));
    }

    #[test]
    fn one_key_many_paths_walks_every_tier() {
        let mut t = CompactContentKeyTable::new();
        let k = key(7);
        let offsets: Vec<u32> = (0..20u32).map(|p| t.add(k, p * 3).unwrap()).collect();
        // Re-adding through every tier finds the original offset.
        for (p, &o) in (0..20u32).zip(&offsets) {
            assert_eq!(t.add(k, p * 3).unwrap(), o);
            assert_eq!(t.get_path_and_key(o).unwrap(), (p * 3, k));
        }
        let mut seen = Vec::new();
        t.for_each_offset(&k, |o| seen.push(o));
        seen.sort_unstable();
        assert_eq!(seen, offsets);
        assert_eq!(t.key_count(), 1);
        assert_eq!(t.record_count(), 20);
    }

    #[test]
    fn tiers_transition_at_capacity() {
        let mut paths = KeyPaths::One { path: 0, offset: 0 };
        for p in 1..FEW_CAPACITY as u32 {
            paths.insert(p, p);
            assert!(matches!(paths, KeyPaths::Few(_)));
        }
        paths.insert(99, 99);
        assert!(matches!(paths, KeyPaths::Many(_)));
        assert_eq!(paths.find(99), Some(99));
        assert_eq!(paths.find(0), Some(0));
    }

    #[test]
    fn out_of_range_and_truncated_records() {
        let mut t = CompactContentKeyTable::new();
        t.add(key(1), 5).unwrap();
        assert!(matches!(
            t.get_key(1000),
            Err(ContentTableError::OutOfRange { .. })
        ));

        let mut mirror = CompactContentKeyTable::new();
        mirror.extend_raw(&[5, 1, 2, 3]).unwrap();
        assert_eq!(
            mirror.get_key(0),
            Err(ContentTableError::Malformed { offset: 0 })
        );
    }

    #[test]
    fn from_memory_rebuilds_lookup() {
        let mut t = CompactContentKeyTable::new();
        for i in 0..10u8 {
            t.add(key(i % 3), u32::from(i)).unwrap();
        }
        let loaded = CompactContentKeyTable::from_memory(t.memory().to_vec()).unwrap();
        assert_eq!(loaded.record_count(), t.record_count());
        assert_eq!(loaded.key_count(), 3);
        let mut loaded = loaded;
        assert_eq!(loaded.add(key(1), 4).unwrap(), t.add(key(1), 4).unwrap());
        assert_eq!(loaded.record_offsets().unwrap().len(), 10);
    }

    #[test]
    fn from_memory_rejects_truncated_arena() {
        let mut t = CompactContentKeyTable::new();
        t.add(key(1), 5).unwrap();
        let mut bytes = t.memory().to_vec();
        bytes.pop();
        assert!(CompactContentKeyTable::from_memory(bytes).is_err());
    }

    #[test]
    fn resolves_path_strings() {
        let mut paths = CompactPathTable::new(false, 1);
        let p = paths.add("/out/a.o").unwrap();
        let mut t = CompactContentKeyTable::new();
        let o = t.add(key(3), p).unwrap();
        assert_eq!(
            t.get_path_string_and_key(&paths, o).unwrap(),
            ("/out/a.o".to_string(), key(3))
        );
        let bad = t.add(key(4), 9999).unwrap();
        assert!(matches!(
            t.get_path_string_and_key(&paths, bad),
            Err(ContentTableError::Path(_))
        ));
    }
}
