//! Common header shared by every data page, and page checksum helpers.
//!
//! The header is the first [`PAGE_HDR_LEN`] bytes of a page. Page formats
//! (bucket, cluster, position map) place their own fields after it.

use core::convert::TryFrom;

use super::{page_crc32, Lsn, PageKey, Result, StorageError};

/// Magic bytes at the start of every formatted page.
pub const PAGE_MAGIC: [u8; 4] = *b"PNMB";
/// Page header format version.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Size of the common page header.
pub const PAGE_HDR_LEN: usize = 32;

pub mod header {
    //! Byte offsets for fixed header fields.
    use core::ops::Range;

    /// Page magic.
    pub const MAGIC: Range<usize> = 0..4;
    /// Header format version.
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    /// [`PageKind`] tag.
    pub const PAGE_KIND: usize = 6;
    /// Unused.
    pub const RESERVED: usize = 7;
    /// Segment part of the page LSN.
    pub const LSN_SEGMENT: Range<usize> = 8..16;
    /// Position part of the page LSN.
    pub const LSN_POSITION: Range<usize> = 16..24;
    /// Page checksum.
    pub const CRC32: Range<usize> = 24..28;
    /// Unused.
    pub const RESERVED_2: Range<usize> = 28..32;
}

/// Format tag stored in the page header.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Freshly allocated page that no format has claimed yet.
    Unformatted = 0,
    /// Ordered key/value bucket.
    Bucket = 1,
    /// Cluster page holding physical records.
    Cluster = 2,
    /// Cluster position map page.
    PositionMap = 3,
    /// Page written by a collaborator without a known format.
    Raw = 4,
}

impl PageKind {
    /// On-disk tag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageKind::Unformatted),
            1 => Ok(PageKind::Bucket),
            2 => Ok(PageKind::Cluster),
            3 => Ok(PageKind::PositionMap),
            4 => Ok(PageKind::Raw),
            _ => Err(StorageError::Corruption("unknown page kind")),
        }
    }
}

/// Outcome of validating a page image read from the main data file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageCheck {
    /// Never written: all bytes are zero.
    Fresh,
    /// Header and checksum match.
    Valid,
    /// Magic, version or checksum mismatch.
    Invalid(&'static str),
}

/// Stores the page format tag. Magic and version are stamped by
/// [`seal_page`] when the page is written to its data file.
pub fn set_page_kind(buf: &mut [u8], kind: PageKind) {
    buf[header::PAGE_KIND] = kind.as_u8();
}

/// Reads the page kind; fresh pages report [`PageKind::Unformatted`].
pub fn page_kind(buf: &[u8]) -> Result<PageKind> {
    PageKind::try_from(buf[header::PAGE_KIND])
}

/// Returns true when the page is formatted as `kind`.
pub fn has_format(buf: &[u8], kind: PageKind) -> bool {
    buf[header::PAGE_KIND] == kind.as_u8()
}

fn be_u64(buf: &[u8], range: core::ops::Range<usize>) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[range]);
    u64::from_be_bytes(out)
}

/// Reads the LSN of the last record applied to the page.
pub fn page_lsn(buf: &[u8]) -> Lsn {
    Lsn::new(
        be_u64(buf, header::LSN_SEGMENT),
        be_u64(buf, header::LSN_POSITION),
    )
}

/// Stores the LSN of the last record applied to the page.
pub fn set_page_lsn(buf: &mut [u8], lsn: Lsn) {
    buf[header::LSN_SEGMENT].copy_from_slice(&lsn.segment.to_be_bytes());
    buf[header::LSN_POSITION].copy_from_slice(&lsn.position.to_be_bytes());
}

/// Zeroes the checksum field before the checksum is computed.
pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
    if buf.len() < header::CRC32.end {
        return Err(StorageError::Invalid("page header buffer too small"));
    }
    buf[header::CRC32].fill(0);
    Ok(())
}

/// Prepares a page image for the main data file: stamps the magic, the
/// format version and the checksum. The page kind is left untouched.
pub fn seal_page(buf: &mut [u8], key: PageKey) -> Result<()> {
    if buf.len() < PAGE_HDR_LEN {
        return Err(StorageError::Invalid("page buffer smaller than header"));
    }
    page_kind(buf)?;
    buf[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
    buf[header::FORMAT_VERSION].copy_from_slice(&PAGE_FORMAT_VERSION.to_be_bytes());
    clear_crc32(buf)?;
    let crc = page_crc32(key.file_id, key.page_index, buf);
    buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Validates a page image read from the main data file.
pub fn check_page(buf: &[u8], key: PageKey) -> PageCheck {
    if buf.len() < PAGE_HDR_LEN {
        return PageCheck::Invalid("page truncated");
    }
    if buf.iter().all(|&b| b == 0) {
        return PageCheck::Fresh;
    }
    if buf[header::MAGIC] != PAGE_MAGIC {
        return PageCheck::Invalid("page magic mismatch");
    }
    if buf[header::FORMAT_VERSION] != PAGE_FORMAT_VERSION.to_be_bytes() {
        return PageCheck::Invalid("unsupported page format version");
    }
    let mut scratch = buf.to_vec();
    scratch[header::CRC32].fill(0);
    let crc = page_crc32(key.file_id, key.page_index, &scratch);
    if buf[header::CRC32] != crc.to_be_bytes() {
        return PageCheck::Invalid("page crc mismatch");
    }
    PageCheck::Valid
}
