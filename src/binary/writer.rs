// Growable output buffer with an advisory capacity.
//
// The capacity does not stop writes; response builders consult
// `capacity_left` before appending optional data.

use super::varint;

#[derive(Debug, Clone, Default)]
pub struct BinaryWriter {
    buf: Vec<u8>,
    limit: Option<usize>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer whose `capacity_left` counts down from `limit`.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit: Some(limit),
        }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity_left(&self) -> usize {
        match self.limit {
            Some(limit) => limit.saturating_sub(self.buf.len()),
            None => usize::MAX - self.buf.len(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_varint(&mut self, v: u64) {
        varint::write_u64(&mut self.buf, v);
    }

    /// Varint length prefix followed by the bytes.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_blob(s.as_bytes());
    }

    /// Overwrite a previously written `u16` at `position`.
    pub fn patch_u16(&mut self, position: usize, v: u16) {
        self.buf[position..position + 2].copy_from_slice(&v.to_le_bytes());
    }
}
