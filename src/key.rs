// Fixed-width keys and bucket identifiers.

use std::fmt;

use bitflags::bitflags;
use sha2::{Digest, Sha256};

use crate::binary::{BinaryReader, BinaryWriter, ReadError};

/// Width in bytes of content and cache keys.
pub const KEY_SIZE: usize = 32;

macro_rules! define_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; KEY_SIZE]);

        impl $name {
            pub const ZERO: Self = Self([0u8; KEY_SIZE]);

            #[inline]
            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; KEY_SIZE]
            }

            #[inline]
            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                let mut s = String::with_capacity(KEY_SIZE * 2);
                for b in self.0 {
                    s.push(char::from_digit(u32::from(b >> 4), 16).unwrap_or('0'));
                    s.push(char::from_digit(u32::from(b & 0xF), 16).unwrap_or('0'));
                }
                s
            }

            pub fn from_hex(s: &str) -> Option<Self> {
                let s = s.as_bytes();
                if s.len() != KEY_SIZE * 2 {
                    return None;
                }
                let mut out = [0u8; KEY_SIZE];
                for (i, pair) in s.chunks_exact(2).enumerate() {
                    let hi = (pair[0] as char).to_digit(16)?;
                    let lo = (pair[1] as char).to_digit(16)?;
                    out[i] = (hi << 4 | lo) as u8;
                }
                Some(Self(out))
            }

            pub fn read(reader: &mut BinaryReader<'_>) -> Result<Self, ReadError> {
                Ok(Self(reader.read_array()?))
            }

            pub fn write(&self, writer: &mut BinaryWriter) {
                writer.write_bytes(&self.0);
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), &self.to_hex()[..16])
            }
        }
    };
}

define_key!(
    /// SHA-256 of a file's bytes.
    ContentKey
);

define_key!(
    /// Hash of a build command; selects the `CacheEntries` record in a bucket.
    CacheKey
);

impl ContentKey {
    pub fn from_content(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl CacheKey {
    pub fn from_command(command: &str) -> Self {
        Self(Sha256::digest(command.as_bytes()).into())
    }
}

bitflags! {
    /// Flag bits carried in the upper half of a [`BucketId`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BucketFlags: u64 {
        /// Paths in this bucket compare case-sensitively.
        const CASE_SENSITIVE = 1 << 32;
    }
}

/// Identifies one bucket (workload family).
///
/// Bits 0..32 are free for the client, bit 32 selects case sensitivity and
/// bits 35.. carry the path-table version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(pub u64);

impl BucketId {
    const VERSION_SHIFT: u32 = 35;

    pub fn new(family: u32, version: u32, flags: BucketFlags) -> Self {
        Self(u64::from(version) << Self::VERSION_SHIFT | flags.bits() | u64::from(family))
    }

    pub fn flags(self) -> BucketFlags {
        BucketFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn is_case_insensitive(self) -> bool {
        !self.flags().contains(BucketFlags::CASE_SENSITIVE)
    }

    #[inline]
    pub fn version(self) -> u32 {
        (self.0 >> Self::VERSION_SHIFT) as u32
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
