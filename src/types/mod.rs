#![forbid(unsafe_code)]
//! Identifiers, errors, page header layout and checksums shared by every
//! component of the durability core.

use std::fmt;

pub mod checksum;
pub mod error;
pub mod page;

pub use checksum::{crc32_of, page_crc32};
pub use error::{ErrorClass, Result, StorageError};

/// Addresses one fixed-size page inside a logical file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageKey {
    /// Logical file identifier.
    pub file_id: u32,
    /// Index of the page inside the file.
    pub page_index: u32,
}

impl PageKey {
    /// Creates a key for `page_index` within `file_id`.
    pub const fn new(file_id: u32, page_index: u32) -> Self {
        Self {
            file_id,
            page_index,
        }
    }

    /// Returns the key of the page directly after this one, if any.
    pub fn successor(self) -> Option<Self> {
        self.page_index
            .checked_add(1)
            .map(|page_index| Self::new(self.file_id, page_index))
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_index)
    }
}

/// Log sequence number: a segment id plus the byte position of a frame in it.
///
/// Ordering is lexicographic on `(segment, position)`, which the derived
/// `Ord` gives us through field order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn {
    /// Segment identifier (starts at 1).
    pub segment: u64,
    /// Byte offset of the frame inside the segment.
    pub position: u64,
}

impl Lsn {
    /// Sentinel meaning "no LSN"; never assigned to a record.
    pub const ZERO: Lsn = Lsn {
        segment: 0,
        position: 0,
    };

    /// Creates an LSN.
    pub const fn new(segment: u64, position: u64) -> Self {
        Self { segment, position }
    }

    /// Returns true for the "no LSN" sentinel.
    pub fn is_zero(&self) -> bool {
        *self == Lsn::ZERO
    }

    /// Encodes the LSN as 16 big-endian bytes.
    pub fn to_be_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.segment.to_be_bytes());
        out[8..].copy_from_slice(&self.position.to_be_bytes());
        out
    }

    /// Decodes an LSN from 16 big-endian bytes.
    pub fn from_be_bytes(src: [u8; 16]) -> Self {
        let mut segment = [0u8; 8];
        let mut position = [0u8; 8];
        segment.copy_from_slice(&src[..8]);
        position.copy_from_slice(&src[8..]);
        Self {
            segment: u64::from_be_bytes(segment),
            position: u64::from_be_bytes(position),
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.segment, self.position)
    }
}

/// Identifier of an atomic operation (operation unit).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
