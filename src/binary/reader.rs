// Bounds-checked cursor over a byte slice.
//
// Every decode path in the crate goes through `BinaryReader`, so corrupt
// or hostile input surfaces as a `ReadError` instead of a panic.

use super::varint::{self, VarIntError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("unexpected end of data at position {position}: needed {needed} bytes, {available} available")]
    UnexpectedEnd {
        position: usize,
        needed: usize,
        available: usize,
    },
    #[error("invalid varint at position {position}: {source}")]
    VarInt {
        position: usize,
        #[source]
        source: VarIntError,
    },
    #[error("string at position {position} is not valid UTF-8")]
    InvalidUtf8 { position: usize },
    #[error("position {position} is outside data of length {len}")]
    OutOfRange { position: usize, len: usize },
}

#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, position: usize) -> Result<(), ReadError> {
        if position > self.data.len() {
            return Err(ReadError::OutOfRange {
                position,
                len: self.data.len(),
            });
        }
        self.pos = position;
        Ok(())
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        if len > self.remaining() {
            return Err(ReadError::UnexpectedEnd {
                position: self.pos,
                needed: len,
                available: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ReadError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Consume and return everything left.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, ReadError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, ReadError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, ReadError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReadError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_varint(&mut self) -> Result<u64, ReadError> {
        let (v, n) = varint::read_u64(&self.data[self.pos..]).map_err(|source| {
            ReadError::VarInt {
                position: self.pos,
                source,
            }
        })?;
        self.pos += n;
        Ok(v)
    }

    pub fn read_varint_u32(&mut self) -> Result<u32, ReadError> {
        let (v, n) = varint::read_u32(&self.data[self.pos..]).map_err(|source| {
            ReadError::VarInt {
                position: self.pos,
                source,
            }
        })?;
        self.pos += n;
        Ok(v)
    }

    /// Read a varint length followed by that many bytes.
    pub fn read_blob(&mut self) -> Result<&'a [u8], ReadError> {
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| ReadError::UnexpectedEnd {
            position: self.pos,
            needed: usize::MAX,
            available: self.remaining(),
        })?;
        self.read_bytes(len)
    }

    pub fn read_string(&mut self) -> Result<String, ReadError> {
        let position = self.pos;
        let bytes = self.read_blob()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ReadError::InvalidUtf8 { position })
    }
}
