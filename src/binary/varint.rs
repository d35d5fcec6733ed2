// 7-bit variable-length integer encoding.
//
// Base-128, little-endian: least-significant group first.
// Each byte has bit 7 set except the final byte. Every offset, size and
// range bound in the wire and disk formats uses this encoding.

/// Maximum encoded length for a 64-bit value (ceil(64/7) = 10).
pub const MAX_VARINT_LEN: usize = 10;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a `u64` into `buf`, returning the number of bytes used (1..=10).
#[inline]
pub fn encode_u64(mut num: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut i = 0;
    loop {
        let low = (num & 0x7F) as u8;
        num >>= 7;
        if num == 0 {
            buf[i] = low;
            return i + 1;
        }
        buf[i] = low | 0x80;
        i += 1;
    }
}

/// Append a `u64` varint to `out`.
#[inline]
pub fn write_u64(out: &mut Vec<u8>, num: u64) {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let len = encode_u64(num, &mut buf);
    out.extend_from_slice(&buf[..len]);
}

/// Append a `u32` varint to `out`.
#[inline]
pub fn write_u32(out: &mut Vec<u8>, num: u32) {
    write_u64(out, u64::from(num));
}

/// Encode a sorted sequence of offsets back to back.
pub fn encode_all(values: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.iter().map(|&v| encoded_len_u32(v)).sum());
    for &v in values {
        write_u32(&mut out, v);
    }
    out
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a `u64` from the front of `data`.
/// Returns `(value, bytes_consumed)`.
pub fn read_u64(data: &[u8]) -> Result<(u64, usize), VarIntError> {
    let mut val: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return Err(VarIntError::Overflow);
        }
        let bits = u64::from(byte & 0x7F);
        let shift = 7 * i as u32;
        // The tenth group only has room for the top bit of a u64.
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(VarIntError::Overflow);
        }
        val |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok((val, i + 1));
        }
    }
    Err(VarIntError::Underflow)
}

/// Decode a `u32` from the front of `data`.
pub fn read_u32(data: &[u8]) -> Result<(u32, usize), VarIntError> {
    let (val, len) = read_u64(data)?;
    let val = u32::try_from(val).map_err(|_| VarIntError::Overflow)?;
    Ok((val, len))
}

/// Decode every value of a back-to-back varint blob.
pub fn decode_all(data: &[u8]) -> Result<Vec<u32>, VarIntError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let (v, n) = read_u32(&data[pos..])?;
        out.push(v);
        pos += n;
    }
    Ok(out)
}

/// One decoded item of a varint blob together with its byte span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    pub value: u32,
    pub start: u32,
    pub end: u32,
}

/// Decode a varint blob keeping the `[start, end)` byte span of each value.
pub fn decode_items(data: &[u8]) -> Result<Vec<Item>, VarIntError> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let (value, n) = read_u32(&data[pos..])?;
        out.push(Item {
            value,
            start: pos as u32,
            end: (pos + n) as u32,
        });
        pos += n;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Return the encoded byte-length of a `u64` value.
#[inline]
pub fn encoded_len_u64(num: u64) -> usize {
    let bits = 64 - num.leading_zeros();
    bits.max(1).div_ceil(7) as usize
}

/// Return the encoded byte-length of a `u32` value.
#[inline]
pub fn encoded_len_u32(num: u32) -> usize {
    encoded_len_u64(u64::from(num))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarIntError {
    /// Not enough input bytes to complete the integer.
    Underflow,
    /// Value would overflow the target integer type.
    Overflow,
}

impl std::fmt::Display for VarIntError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarIntError::Underflow => write!(f, "varint underflow (truncated input)"),
            VarIntError::Overflow => write!(f, "varint overflow"),
        }
    }
}

impl std::error::Error for VarIntError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_u64() {
        let cases: &[u64] = &[
            0,
            1,
            127,
            128,
            255,
            256,
            16383,
            16384,
            u32::MAX as u64,
            u64::MAX,
        ];
        let mut buf = [0u8; MAX_VARINT_LEN];
        for &val in cases {
            let len = encode_u64(val, &mut buf);
            let (decoded, consumed) = read_u64(&buf[..len]).unwrap();
            assert_eq!(decoded, val, "roundtrip failed for {val}");
            assert_eq!(consumed, len, "length mismatch for {val}");
            assert_eq!(encoded_len_u64(val), len, "encoded_len mismatch for {val}");
        }
    }

    #[test]
    fn little_endian_group_order() {
        let mut out = Vec::new();
        write_u32(&mut out, 300);
        assert_eq!(out, [0xAC, 0x02]);
    }

    #[test]
    fn known_lengths() {
        assert_eq!(encoded_len_u32(0), 1);
        assert_eq!(encoded_len_u32(127), 1);
        assert_eq!(encoded_len_u32(128), 2);
        assert_eq!(encoded_len_u32(16383), 2);
        assert_eq!(encoded_len_u32(16384), 3);
        assert_eq!(encoded_len_u32(u32::MAX), 5);
        assert_eq!(encoded_len_u64(u64::MAX), 10);
    }

    #[test]
    fn truncated_input() {
        assert_eq!(read_u64(&[0x80]), Err(VarIntError::Underflow));
        assert_eq!(read_u64(&[]), Err(VarIntError::Underflow));
    }

    #[test]
    fn u32_overflow_rejected() {
        let mut out = Vec::new();
        write_u64(&mut out, u64::from(u32::MAX) + 1);
        assert_eq!(read_u32(&out), Err(VarIntError::Overflow));
    }

    #[test]
    fn u64_overflow_rejected() {
        let data = [0xFF; 10];
        assert_eq!(read_u64(&data), Err(VarIntError::Overflow));
        let mut data = [0xFF; 11];
        data[10] = 0;
        assert_eq!(read_u64(&data), Err(VarIntError::Overflow));
    }

    #[test]
    fn blob_items_track_spans() {
        let blob = encode_all(&[1, 200, 3]);
        let items = decode_items(&blob).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!((items[0].start, items[0].end), (0, 1));
        assert_eq!((items[1].start, items[1].end), (1, 3));
        assert_eq!((items[2].start, items[2].end), (3, 4));
        assert_eq!(decode_all(&blob).unwrap(), vec![1, 200, 3]);
    }

    #[test]
    fn blob_with_truncated_tail() {
        let mut blob = encode_all(&[5, 6]);
        blob.push(0x80);
        assert_eq!(decode_all(&blob), Err(VarIntError::Underflow));
    }
}
