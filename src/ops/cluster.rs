//! Record-level edits of cluster pages.
//!
//! A cluster page stores physical records in numbered slots. Layout after
//! the common page header: `next_page: i64` at 32, `prev_page: i64` at 40,
//! `slot_count: u32` at 48, `used_bytes: u32` at 52, then the slots from 56,
//! each `[status u8][version i32][len u32][content]`. Deleting a record keeps
//! its slot (and version) but drops the content, so slot numbers stay stable
//! and a later record can recycle the slot.

use crate::ops::{
    close_gap, get_bytes, get_i32, get_i64, get_u32, get_u8, is_zeroed, open_gap, put_bytes,
    put_i32, put_i64, put_u32, put_u8,
};
use crate::primitives::bytes::{bytes_len, ByteReader, ByteWriter};
use crate::primitives::wal::record::{OperationRecord, RecordHeader, RecordTypeId};
use crate::types::page::{has_format, page_kind, set_page_kind, PageKind, PAGE_HDR_LEN};
use crate::types::{PageKey, Result, StorageError};

/// Type id of [`ClusterInit`].
pub const INIT: RecordTypeId = 40;
/// Type id of [`AppendRecord`].
pub const APPEND_RECORD: RecordTypeId = 41;
/// Type id of [`ReplaceRecord`].
pub const REPLACE_RECORD: RecordTypeId = 42;
/// Type id of [`DeleteRecord`].
pub const DELETE_RECORD: RecordTypeId = 43;
/// Type id of [`RecycleRecord`].
pub const RECYCLE_RECORD: RecordTypeId = 44;
/// Type id of [`SetNextPage`].
pub const SET_NEXT_PAGE: RecordTypeId = 45;
/// Type id of [`SetPrevPage`].
pub const SET_PREV_PAGE: RecordTypeId = 46;

const NEXT_PAGE: usize = PAGE_HDR_LEN;
const PREV_PAGE: usize = PAGE_HDR_LEN + 8;
const SLOT_COUNT: usize = PAGE_HDR_LEN + 16;
const USED_BYTES: usize = PAGE_HDR_LEN + 20;
/// First byte of the slot area.
pub const CLUSTER_DATA: usize = PAGE_HDR_LEN + 24;
const SLOT_HEADER: usize = 9;

const DELETED: u8 = 0;
const LIVE: u8 = 1;

/// Page link value meaning "no page".
pub const NO_PAGE: i64 = -1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Slot<'a> {
    status: u8,
    version: i32,
    content: &'a [u8],
}

impl Slot<'_> {
    fn size(&self) -> usize {
        SLOT_HEADER + self.content.len()
    }
}

fn check_kind(page: &[u8]) -> Result<()> {
    if has_format(page, PageKind::Cluster) {
        Ok(())
    } else {
        Err(StorageError::Corruption("page is not a cluster page"))
    }
}

fn slot_count(page: &[u8]) -> Result<u32> {
    get_u32(page, SLOT_COUNT)
}

fn used_bytes(page: &[u8]) -> Result<usize> {
    let used = get_u32(page, USED_BYTES)? as usize;
    if used > page.len().saturating_sub(CLUSTER_DATA) {
        return Err(StorageError::Corruption("cluster used bytes exceed the page"));
    }
    Ok(used)
}

/// `used - size`, failing when the counter is smaller than the entry it
/// should account for.
fn shrink_used(used: usize, size: usize) -> Result<usize> {
    used.checked_sub(size)
        .ok_or(StorageError::Corruption("cluster used bytes below entry size"))
}

fn slot_offset(page: &[u8], slot: u32) -> Result<usize> {
    if slot > slot_count(page)? {
        return Err(StorageError::Corruption("cluster slot out of range"));
    }
    let mut off = CLUSTER_DATA;
    for _ in 0..slot {
        off += SLOT_HEADER + get_u32(page, off + 5)? as usize;
    }
    Ok(off)
}

fn read_slot(page: &[u8], slot: u32) -> Result<Slot<'_>> {
    if slot >= slot_count(page)? {
        return Err(StorageError::Corruption("cluster slot out of range"));
    }
    let off = slot_offset(page, slot)?;
    let len = get_u32(page, off + 5)? as usize;
    Ok(Slot {
        status: get_u8(page, off)?,
        version: get_i32(page, off + 1)?,
        content: get_bytes(page, off + SLOT_HEADER, len)?,
    })
}

fn expect_slot(page: &[u8], slot: u32, expected: Slot<'_>) -> Result<()> {
    if read_slot(page, slot)? != expected {
        return Err(StorageError::Corruption("cluster slot does not match record"));
    }
    Ok(())
}

fn insert_slot(page: &mut [u8], slot: u32, value: Slot<'_>) -> Result<()> {
    let count = slot_count(page)?;
    let used = used_bytes(page)?;
    let at = slot_offset(page, slot)?;
    open_gap(page, at, CLUSTER_DATA + used, value.size())?;
    put_u8(page, at, value.status)?;
    put_i32(page, at + 1, value.version)?;
    put_u32(page, at + 5, value.content.len() as u32)?;
    put_bytes(page, at + SLOT_HEADER, value.content)?;
    put_u32(page, SLOT_COUNT, count + 1)?;
    put_u32(page, USED_BYTES, (used + value.size()) as u32)
}

fn remove_slot(page: &mut [u8], slot: u32, expected: Slot<'_>) -> Result<()> {
    expect_slot(page, slot, expected)?;
    let count = slot_count(page)?;
    let used = used_bytes(page)?;
    let at = slot_offset(page, slot)?;
    let shrunk = shrink_used(used, expected.size())?;
    close_gap(page, at, CLUSTER_DATA + used, expected.size())?;
    put_u32(page, SLOT_COUNT, count - 1)?;
    put_u32(page, USED_BYTES, shrunk as u32)
}

/// Swaps the slot content `from` for `to`, checking room before touching
/// the page.
fn replace_slot(page: &mut [u8], slot: u32, from: Slot<'_>, to: Slot<'_>) -> Result<()> {
    check_kind(page)?;
    expect_slot(page, slot, from)?;
    let used = used_bytes(page)?;
    if shrink_used(used, from.size())? + to.size() > page.len() - CLUSTER_DATA {
        return Err(StorageError::Invalid("record does not fit into the page"));
    }
    remove_slot(page, slot, from)?;
    insert_slot(page, slot, to)
}

/// Read access to a formatted cluster page.
pub struct ClusterView<'a> {
    page: &'a [u8],
}

impl<'a> ClusterView<'a> {
    /// Wraps `page`, failing unless it is formatted as a cluster page.
    pub fn new(page: &'a [u8]) -> Result<Self> {
        check_kind(page)?;
        Ok(Self { page })
    }

    /// Number of slots, live and deleted.
    pub fn slot_count(&self) -> Result<u32> {
        slot_count(self.page)
    }

    /// Version and content of a live record, `None` for a deleted slot.
    pub fn record(&self, slot: u32) -> Result<Option<(i32, &'a [u8])>> {
        let found = read_slot(self.page, slot)?;
        Ok((found.status == LIVE).then_some((found.version, found.content)))
    }

    /// Version stored in a slot, whether live or deleted.
    pub fn version(&self, slot: u32) -> Result<i32> {
        Ok(read_slot(self.page, slot)?.version)
    }

    /// Lowest deleted slot, a candidate for [`RecycleRecord`].
    pub fn first_deleted_slot(&self) -> Result<Option<u32>> {
        for slot in 0..self.slot_count()? {
            if read_slot(self.page, slot)?.status == DELETED {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Next page of the cluster chain, [`NO_PAGE`] if none.
    pub fn next_page(&self) -> Result<i64> {
        get_i64(self.page, NEXT_PAGE)
    }

    /// Previous page of the cluster chain, [`NO_PAGE`] if none.
    pub fn prev_page(&self) -> Result<i64> {
        get_i64(self.page, PREV_PAGE)
    }

    /// Bytes available for new slots, counting slot headers.
    pub fn free_space(&self) -> Result<usize> {
        self.page
            .len()
            .checked_sub(CLUSTER_DATA + used_bytes(self.page)?)
            .ok_or(StorageError::Corruption("cluster used bytes exceed the page"))
    }
}

/// Formats a fresh page as an empty cluster page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterInit {
    header: RecordHeader,
}

impl ClusterInit {
    /// Formats `page` as an empty cluster page.
    pub fn new(page: PageKey) -> Self {
        Self {
            header: RecordHeader::for_page(page),
        }
    }

    pub(crate) fn decode(
        header: RecordHeader,
        _r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self { header }))
    }
}

impl OperationRecord for ClusterInit {
    record_common!(INIT);

    fn payload_size(&self) -> usize {
        0
    }

    fn encode_payload(&self, _w: &mut ByteWriter<'_>) {}

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        if page_kind(page)? != PageKind::Unformatted
            || !is_zeroed(page, PAGE_HDR_LEN, CLUSTER_DATA)?
        {
            return Err(StorageError::Corruption("cluster init target is not a fresh page"));
        }
        set_page_kind(page, PageKind::Cluster);
        put_i64(page, NEXT_PAGE, NO_PAGE)?;
        put_i64(page, PREV_PAGE, NO_PAGE)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        check_kind(page)?;
        if slot_count(page)? != 0 {
            return Err(StorageError::Corruption("cluster init undone on a non-empty page"));
        }
        put_bytes(page, PAGE_HDR_LEN, &[0u8; CLUSTER_DATA - PAGE_HDR_LEN])?;
        set_page_kind(page, PageKind::Unformatted);
        Ok(())
    }
}

/// Creates a record in a new slot at the end of the page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendRecord {
    header: RecordHeader,
    /// Slot the record lands in.
    pub slot: u32,
    /// Record version.
    pub version: i32,
    /// Record bytes.
    pub content: Vec<u8>,
}

impl AppendRecord {
    /// Builds the record for the next free slot number of `page`.
    pub fn new(key: PageKey, page: &[u8], version: i32, content: Vec<u8>) -> Result<Self> {
        Ok(Self {
            header: RecordHeader::for_page(key),
            slot: ClusterView::new(page)?.slot_count()?,
            version,
            content,
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            slot: r.u32()?,
            version: r.i32()?,
            content: r.bytes()?,
        }))
    }

    fn slot_value(&self) -> Slot<'_> {
        Slot {
            status: LIVE,
            version: self.version,
            content: &self.content,
        }
    }
}

impl OperationRecord for AppendRecord {
    record_common!(APPEND_RECORD);

    fn payload_size(&self) -> usize {
        4 + 4 + bytes_len(self.content.len())
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.slot);
        w.put_i32(self.version);
        w.put_bytes(&self.content);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        check_kind(page)?;
        if slot_count(page)? != self.slot {
            return Err(StorageError::Corruption("cluster slot count does not match record"));
        }
        insert_slot(page, self.slot, self.slot_value())
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        check_kind(page)?;
        if slot_count(page)? != self.slot + 1 {
            return Err(StorageError::Corruption("cluster slot count does not match record"));
        }
        remove_slot(page, self.slot, self.slot_value())
    }
}

/// Overwrites a live record with a new version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplaceRecord {
    header: RecordHeader,
    /// Slot being replaced.
    pub slot: u32,
    /// Version before the replace.
    pub old_version: i32,
    /// Content before the replace.
    pub old_content: Vec<u8>,
    /// Version after the replace.
    pub new_version: i32,
    /// Content after the replace.
    pub new_content: Vec<u8>,
}

impl ReplaceRecord {
    /// Builds the record from the live record currently in `slot`.
    pub fn capture(
        key: PageKey,
        page: &[u8],
        slot: u32,
        new_version: i32,
        new_content: Vec<u8>,
    ) -> Result<Self> {
        let (old_version, old_content) = ClusterView::new(page)?
            .record(slot)?
            .ok_or(StorageError::Invalid("cannot replace a deleted record"))?;
        Ok(Self {
            header: RecordHeader::for_page(key),
            slot,
            old_version,
            old_content: old_content.to_vec(),
            new_version,
            new_content,
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            slot: r.u32()?,
            old_version: r.i32()?,
            old_content: r.bytes()?,
            new_version: r.i32()?,
            new_content: r.bytes()?,
        }))
    }

    fn old_slot(&self) -> Slot<'_> {
        Slot {
            status: LIVE,
            version: self.old_version,
            content: &self.old_content,
        }
    }

    fn new_slot(&self) -> Slot<'_> {
        Slot {
            status: LIVE,
            version: self.new_version,
            content: &self.new_content,
        }
    }
}

impl OperationRecord for ReplaceRecord {
    record_common!(REPLACE_RECORD);

    fn payload_size(&self) -> usize {
        4 + 4 + bytes_len(self.old_content.len()) + 4 + bytes_len(self.new_content.len())
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.slot);
        w.put_i32(self.old_version);
        w.put_bytes(&self.old_content);
        w.put_i32(self.new_version);
        w.put_bytes(&self.new_content);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        replace_slot(page, self.slot, self.old_slot(), self.new_slot())
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        replace_slot(page, self.slot, self.new_slot(), self.old_slot())
    }
}

/// Deletes a live record; the slot keeps its version and becomes reusable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteRecord {
    header: RecordHeader,
    /// Slot being deleted.
    pub slot: u32,
    /// Version of the deleted record.
    pub version: i32,
    /// Content of the deleted record.
    pub content: Vec<u8>,
}

impl DeleteRecord {
    /// Builds the record from the live record currently in `slot`.
    pub fn capture(key: PageKey, page: &[u8], slot: u32) -> Result<Self> {
        let (version, content) = ClusterView::new(page)?
            .record(slot)?
            .ok_or(StorageError::Invalid("record is already deleted"))?;
        Ok(Self {
            header: RecordHeader::for_page(key),
            slot,
            version,
            content: content.to_vec(),
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            slot: r.u32()?,
            version: r.i32()?,
            content: r.bytes()?,
        }))
    }

    fn live(&self) -> Slot<'_> {
        Slot {
            status: LIVE,
            version: self.version,
            content: &self.content,
        }
    }

    fn tombstone(&self) -> Slot<'static> {
        Slot {
            status: DELETED,
            version: self.version,
            content: &[],
        }
    }
}

impl OperationRecord for DeleteRecord {
    record_common!(DELETE_RECORD);

    fn payload_size(&self) -> usize {
        4 + 4 + bytes_len(self.content.len())
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.slot);
        w.put_i32(self.version);
        w.put_bytes(&self.content);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        replace_slot(page, self.slot, self.live(), self.tombstone())
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        replace_slot(page, self.slot, self.tombstone(), self.live())
    }
}

/// Places a new record into a deleted slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecycleRecord {
    header: RecordHeader,
    /// Deleted slot being reused.
    pub slot: u32,
    /// Version the deleted slot kept.
    pub previous_version: i32,
    /// Version of the new record.
    pub version: i32,
    /// Content of the new record.
    pub content: Vec<u8>,
}

impl RecycleRecord {
    /// Builds the record for the deleted `slot` of `page`.
    pub fn capture(
        key: PageKey,
        page: &[u8],
        slot: u32,
        version: i32,
        content: Vec<u8>,
    ) -> Result<Self> {
        let view = ClusterView::new(page)?;
        if view.record(slot)?.is_some() {
            return Err(StorageError::Invalid("only a deleted slot can be recycled"));
        }
        Ok(Self {
            header: RecordHeader::for_page(key),
            slot,
            previous_version: view.version(slot)?,
            version,
            content,
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            slot: r.u32()?,
            previous_version: r.i32()?,
            version: r.i32()?,
            content: r.bytes()?,
        }))
    }

    fn tombstone(&self) -> Slot<'static> {
        Slot {
            status: DELETED,
            version: self.previous_version,
            content: &[],
        }
    }

    fn live(&self) -> Slot<'_> {
        Slot {
            status: LIVE,
            version: self.version,
            content: &self.content,
        }
    }
}

impl OperationRecord for RecycleRecord {
    record_common!(RECYCLE_RECORD);

    fn payload_size(&self) -> usize {
        4 + 4 + 4 + bytes_len(self.content.len())
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.slot);
        w.put_i32(self.previous_version);
        w.put_i32(self.version);
        w.put_bytes(&self.content);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        replace_slot(page, self.slot, self.tombstone(), self.live())
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        replace_slot(page, self.slot, self.live(), self.tombstone())
    }
}

macro_rules! link_record {
    ($(#[$meta:meta])* $name:ident, $type_id:expr, $offset:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $name {
            header: RecordHeader,
            /// Pointer before the update.
            pub old: i64,
            /// Pointer after the update.
            pub new: i64,
        }

        impl $name {
            /// Builds the record from the link currently stored.
            pub fn capture(key: PageKey, page: &[u8], new: i64) -> Result<Self> {
                check_kind(page)?;
                Ok(Self {
                    header: RecordHeader::for_page(key),
                    old: get_i64(page, $offset)?,
                    new,
                })
            }

            pub(crate) fn decode(
                header: RecordHeader,
                r: &mut ByteReader<'_>,
            ) -> Result<Box<dyn OperationRecord>> {
                Ok(Box::new(Self {
                    header,
                    old: r.i64()?,
                    new: r.i64()?,
                }))
            }

            fn set(page: &mut [u8], from: i64, to: i64) -> Result<()> {
                check_kind(page)?;
                if get_i64(page, $offset)? != from {
                    return Err(StorageError::Corruption("cluster link does not match record"));
                }
                put_i64(page, $offset, to)
            }
        }

        impl OperationRecord for $name {
            record_common!($type_id);

            fn payload_size(&self) -> usize {
                16
            }

            fn encode_payload(&self, w: &mut ByteWriter<'_>) {
                w.put_i64(self.old);
                w.put_i64(self.new);
            }

            fn redo(&self, page: &mut [u8]) -> Result<()> {
                Self::set(page, self.old, self.new)
            }

            fn undo(&self, page: &mut [u8]) -> Result<()> {
                Self::set(page, self.new, self.old)
            }
        }
    };
}

link_record!(
    /// Points a cluster page at the page following it.
    SetNextPage,
    SET_NEXT_PAGE,
    NEXT_PAGE
);
link_record!(
    /// Points a cluster page at the page preceding it.
    SetPrevPage,
    SET_PREV_PAGE,
    PREV_PAGE
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{assert_roundtrip, assert_symmetric};

    const KEY: PageKey = PageKey::new(2, 0);

    fn cluster_page(records: &[&[u8]]) -> Result<Vec<u8>> {
        let mut page = vec![0u8; 2048];
        ClusterInit::new(KEY).redo(&mut page)?;
        for (version, content) in records.iter().enumerate() {
            AppendRecord::new(KEY, &page, version as i32, content.to_vec())?.redo(&mut page)?;
        }
        Ok(page)
    }

    #[test]
    fn init_and_append_are_symmetric() -> Result<()> {
        let mut page = vec![0u8; 2048];
        let init = ClusterInit::new(KEY);
        assert_symmetric(&init, &mut page)?;
        let append = AppendRecord::new(KEY, &page, 1, b"first".to_vec())?;
        assert_symmetric(&append, &mut page)?;
        let view = ClusterView::new(&page)?;
        assert_eq!(view.slot_count()?, 1);
        assert_eq!(view.record(0)?, Some((1, &b"first"[..])));
        assert_eq!(view.next_page()?, NO_PAGE);
        assert_roundtrip(&init)?;
        assert_roundtrip(&append)
    }

    #[test]
    fn replace_in_the_middle_moves_following_slots() -> Result<()> {
        let mut page = cluster_page(&[b"aa", b"bb", b"cc"])?;
        let replace = ReplaceRecord::capture(KEY, &page, 1, 9, b"a longer payload".to_vec())?;
        assert_symmetric(&replace, &mut page)?;
        let view = ClusterView::new(&page)?;
        assert_eq!(view.record(1)?, Some((9, &b"a longer payload"[..])));
        assert_eq!(view.record(2)?, Some((2, &b"cc"[..])));
        assert_roundtrip(&replace)
    }

    #[test]
    fn delete_then_recycle_reuses_slot() -> Result<()> {
        let mut page = cluster_page(&[b"aa", b"bb"])?;
        let delete = DeleteRecord::capture(KEY, &page, 0)?;
        assert_symmetric(&delete, &mut page)?;
        let view = ClusterView::new(&page)?;
        assert_eq!(view.record(0)?, None);
        assert_eq!(view.first_deleted_slot()?, Some(0));

        let recycle = RecycleRecord::capture(KEY, &page, 0, 5, b"reborn".to_vec())?;
        assert_eq!(recycle.previous_version, 0);
        assert_symmetric(&recycle, &mut page)?;
        assert_eq!(ClusterView::new(&page)?.record(0)?, Some((5, &b"reborn"[..])));
        assert_roundtrip(&delete)?;
        assert_roundtrip(&recycle)
    }

    #[test]
    fn recycling_live_slot_is_rejected() -> Result<()> {
        let page = cluster_page(&[b"aa"])?;
        assert!(RecycleRecord::capture(KEY, &page, 0, 1, Vec::new()).is_err());
        Ok(())
    }

    #[test]
    fn oversized_replace_leaves_page_untouched() -> Result<()> {
        let mut page = cluster_page(&[b"aa"])?;
        let before = page.clone();
        let replace = ReplaceRecord::capture(KEY, &page, 0, 1, vec![7; 4096])?;
        assert!(matches!(replace.redo(&mut page), Err(StorageError::Invalid(_))));
        assert_eq!(page, before);
        Ok(())
    }

    #[test]
    fn page_links_are_symmetric() -> Result<()> {
        let mut page = cluster_page(&[])?;
        let next = SetNextPage::capture(KEY, &page, 4)?;
        let prev = SetPrevPage::capture(KEY, &page, 2)?;
        assert_symmetric(&next, &mut page)?;
        assert_symmetric(&prev, &mut page)?;
        let view = ClusterView::new(&page)?;
        assert_eq!((view.next_page()?, view.prev_page()?), (4, 2));
        assert_roundtrip(&next)?;
        assert_roundtrip(&prev)
    }

    #[test]
    fn inconsistent_used_bytes_is_corruption() -> Result<()> {
        let mut page = cluster_page(&[b"only"])?;
        let append = AppendRecord::new(KEY, &page, 0, b"next".to_vec())?;
        append.redo(&mut page)?;
        put_u32(&mut page, USED_BYTES, 2)?;
        assert!(matches!(append.undo(&mut page), Err(StorageError::Corruption(_))));

        put_u32(&mut page, USED_BYTES, u32::MAX)?;
        assert!(matches!(
            ClusterView::new(&page)?.free_space(),
            Err(StorageError::Corruption(_))
        ));
        Ok(())
    }
}
