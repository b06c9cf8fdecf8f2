//! Edits of cluster position map pages, which translate a logical record
//! position into the page and slot holding the record.
//!
//! Layout after the common page header: `size: u32` at 32, 4 reserved
//! bytes, then fixed 13-byte entries from 40:
//! `[status u8][page_index i64][record_position i32]`.

use crate::ops::{get_i32, get_i64, get_u32, get_u8, is_zeroed, put_i32, put_i64, put_u32, put_u8};
use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::primitives::wal::record::{OperationRecord, RecordHeader, RecordTypeId};
use crate::types::page::{has_format, page_kind, set_page_kind, PageKind, PAGE_HDR_LEN};
use crate::types::{PageKey, Result, StorageError};

/// Type id of [`Allocate`].
pub const ALLOCATE: RecordTypeId = 60;
/// Type id of [`Add`].
pub const ADD: RecordTypeId = 61;
/// Type id of [`UpdateEntry`].
pub const UPDATE_ENTRY: RecordTypeId = 62;
/// Type id of [`UpdateStatus`].
pub const UPDATE_STATUS: RecordTypeId = 63;
/// Type id of [`TruncateLastEntry`].
pub const TRUNCATE_LAST_ENTRY: RecordTypeId = 64;
/// Type id of [`PositionMapInit`].
pub const INIT: RecordTypeId = 65;

const SIZE: usize = PAGE_HDR_LEN;
/// First byte of the entry array.
pub const POSITION_MAP_DATA: usize = PAGE_HDR_LEN + 8;
/// Encoded size of one entry.
pub const ENTRY_SIZE: usize = 13;

/// State of a logical record position.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PositionStatus {
    /// Slot past the end of the map or never written.
    NotExistent = 0,
    /// Record was deleted; the position may be handed out again.
    Removed = 1,
    /// Position points at a stored record.
    Filled = 2,
    /// Position reserved but no record stored yet.
    Allocated = 3,
}

impl TryFrom<u8> for PositionStatus {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PositionStatus::NotExistent),
            1 => Ok(PositionStatus::Removed),
            2 => Ok(PositionStatus::Filled),
            3 => Ok(PositionStatus::Allocated),
            _ => Err(StorageError::Corruption("unknown position status")),
        }
    }
}

/// One decoded position map entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PositionEntry {
    /// Lifecycle of the position.
    pub status: PositionStatus,
    /// Cluster page holding the record.
    pub page_index: i64,
    /// Slot of the record inside that page.
    pub record_position: i32,
}

impl PositionEntry {
    const ALLOCATED: PositionEntry = PositionEntry {
        status: PositionStatus::Allocated,
        page_index: -1,
        record_position: -1,
    };

    fn encode(&self, w: &mut ByteWriter<'_>) {
        w.put_u8(self.status as u8);
        w.put_i64(self.page_index);
        w.put_i32(self.record_position);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            status: PositionStatus::try_from(r.u8()?)?,
            page_index: r.i64()?,
            record_position: r.i32()?,
        })
    }
}

fn check_kind(page: &[u8]) -> Result<()> {
    if has_format(page, PageKind::PositionMap) {
        Ok(())
    } else {
        Err(StorageError::Corruption("page is not a position map page"))
    }
}

fn size(page: &[u8]) -> Result<u32> {
    get_u32(page, SIZE)
}

fn entry_offset(index: u32) -> usize {
    POSITION_MAP_DATA + index as usize * ENTRY_SIZE
}

fn read_entry(page: &[u8], index: u32) -> Result<PositionEntry> {
    if index >= size(page)? {
        return Err(StorageError::Corruption("position map index out of range"));
    }
    let off = entry_offset(index);
    Ok(PositionEntry {
        status: PositionStatus::try_from(get_u8(page, off)?)?,
        page_index: get_i64(page, off + 1)?,
        record_position: get_i32(page, off + 9)?,
    })
}

fn write_entry(page: &mut [u8], index: u32, entry: PositionEntry) -> Result<()> {
    let off = entry_offset(index);
    put_u8(page, off, entry.status as u8)?;
    put_i64(page, off + 1, entry.page_index)?;
    put_i32(page, off + 9, entry.record_position)
}

fn expect_entry(page: &[u8], index: u32, expected: PositionEntry) -> Result<()> {
    if read_entry(page, index)? != expected {
        return Err(StorageError::Corruption("position map entry does not match record"));
    }
    Ok(())
}

fn push_entry(page: &mut [u8], index: u32, entry: PositionEntry) -> Result<()> {
    check_kind(page)?;
    if size(page)? != index {
        return Err(StorageError::Corruption("position map size does not match record"));
    }
    if entry_offset(index + 1) > page.len() {
        return Err(StorageError::Invalid("position map page is full"));
    }
    write_entry(page, index, entry)?;
    put_u32(page, SIZE, index + 1)
}

fn pop_entry(page: &mut [u8], index: u32, expected: PositionEntry) -> Result<()> {
    check_kind(page)?;
    if size(page)? != index + 1 {
        return Err(StorageError::Corruption("position map size does not match record"));
    }
    expect_entry(page, index, expected)?;
    let off = entry_offset(index);
    page[off..off + ENTRY_SIZE].fill(0);
    put_u32(page, SIZE, index)
}

fn swap_entry(page: &mut [u8], index: u32, from: PositionEntry, to: PositionEntry) -> Result<()> {
    check_kind(page)?;
    expect_entry(page, index, from)?;
    write_entry(page, index, to)
}

/// Read access to a formatted position map page.
pub struct PositionMapView<'a> {
    page: &'a [u8],
}

impl<'a> PositionMapView<'a> {
    /// Wraps `page`, failing unless it is formatted as a position map.
    pub fn new(page: &'a [u8]) -> Result<Self> {
        check_kind(page)?;
        Ok(Self { page })
    }

    /// Number of entries.
    pub fn len(&self) -> Result<u32> {
        size(self.page)
    }

    /// Returns true when the map holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Entry at `index`; indexes past the end report `NotExistent`.
    pub fn entry(&self, index: u32) -> Result<PositionEntry> {
        if index >= self.len()? {
            return Ok(PositionEntry {
                status: PositionStatus::NotExistent,
                page_index: -1,
                record_position: -1,
            });
        }
        read_entry(self.page, index)
    }

    /// Returns true when another entry fits into the page.
    pub fn has_room(&self) -> Result<bool> {
        Ok(entry_offset(self.len()? + 1) <= self.page.len())
    }
}

/// Formats a fresh page as an empty position map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionMapInit {
    header: RecordHeader,
}

impl PositionMapInit {
    /// Formats `page` as an empty position map.
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

impl OperationRecord for PositionMapInit {
    record_common!(INIT);

    fn payload_size(&self) -> usize {
        0
    }

    fn encode_payload(&self, _w: &mut ByteWriter<'_>) {}

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        if page_kind(page)? != PageKind::Unformatted
            || !is_zeroed(page, PAGE_HDR_LEN, POSITION_MAP_DATA)?
        {
            return Err(StorageError::Corruption(
                "position map init target is not a fresh page",
            ));
        }
        set_page_kind(page, PageKind::PositionMap);
        Ok(())
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        check_kind(page)?;
        if size(page)? != 0 {
            return Err(StorageError::Corruption(
                "position map init undone on a non-empty page",
            ));
        }
        set_page_kind(page, PageKind::Unformatted);
        Ok(())
    }
}

/// Reserves the next position without a record behind it yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocate {
    header: RecordHeader,
    /// Position being reserved.
    pub index: u32,
}

impl Allocate {
    /// Builds the record for the next position of `page`.
    pub fn new(key: PageKey, page: &[u8]) -> Result<Self> {
        Ok(Self {
            header: RecordHeader::for_page(key),
            index: PositionMapView::new(page)?.len()?,
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            index: r.u32()?,
        }))
    }
}

impl OperationRecord for Allocate {
    record_common!(ALLOCATE);

    fn payload_size(&self) -> usize {
        4
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.index);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        push_entry(page, self.index, PositionEntry::ALLOCATED)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        pop_entry(page, self.index, PositionEntry::ALLOCATED)
    }
}

/// Appends a position pointing at a stored record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Add {
    header: RecordHeader,
    /// Position being appended.
    pub index: u32,
    /// Cluster page holding the record.
    pub page_index: i64,
    /// Slot of the record.
    pub record_position: i32,
}

impl Add {
    /// Builds the record for the next position of `page`.
    pub fn new(key: PageKey, page: &[u8], page_index: i64, record_position: i32) -> Result<Self> {
        Ok(Self {
            header: RecordHeader::for_page(key),
            index: PositionMapView::new(page)?.len()?,
            page_index,
            record_position,
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            index: r.u32()?,
            page_index: r.i64()?,
            record_position: r.i32()?,
        }))
    }

    fn entry(&self) -> PositionEntry {
        PositionEntry {
            status: PositionStatus::Filled,
            page_index: self.page_index,
            record_position: self.record_position,
        }
    }
}

impl OperationRecord for Add {
    record_common!(ADD);

    fn payload_size(&self) -> usize {
        4 + 8 + 4
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.index);
        w.put_i64(self.page_index);
        w.put_i32(self.record_position);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        push_entry(page, self.index, self.entry())
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        pop_entry(page, self.index, self.entry())
    }
}

/// Points an existing position at a (new) record location and marks it
/// filled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateEntry {
    header: RecordHeader,
    /// Position being updated.
    pub index: u32,
    /// Entry before the update.
    pub old: PositionEntry,
    /// New cluster page.
    pub page_index: i64,
    /// New slot.
    pub record_position: i32,
}

impl UpdateEntry {
    /// Builds the record from the entry currently at `index`.
    pub fn capture(
        key: PageKey,
        page: &[u8],
        index: u32,
        page_index: i64,
        record_position: i32,
    ) -> Result<Self> {
        PositionMapView::new(page)?;
        Ok(Self {
            header: RecordHeader::for_page(key),
            index,
            old: read_entry(page, index)?,
            page_index,
            record_position,
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            index: r.u32()?,
            old: PositionEntry::decode(r)?,
            page_index: r.i64()?,
            record_position: r.i32()?,
        }))
    }

    fn new_entry(&self) -> PositionEntry {
        PositionEntry {
            status: PositionStatus::Filled,
            page_index: self.page_index,
            record_position: self.record_position,
        }
    }
}

impl OperationRecord for UpdateEntry {
    record_common!(UPDATE_ENTRY);

    fn payload_size(&self) -> usize {
        4 + ENTRY_SIZE + 8 + 4
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.index);
        self.old.encode(w);
        w.put_i64(self.page_index);
        w.put_i32(self.record_position);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        swap_entry(page, self.index, self.old, self.new_entry())
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        swap_entry(page, self.index, self.new_entry(), self.old)
    }
}

/// Changes only the status of a position, e.g. marking a removed position
/// available again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateStatus {
    header: RecordHeader,
    /// Position being updated.
    pub index: u32,
    /// Status before the update.
    pub old_status: PositionStatus,
    /// Status after the update.
    pub new_status: PositionStatus,
}

impl UpdateStatus {
    /// Builds the record from the status currently at `index`.
    pub fn capture(key: PageKey, page: &[u8], index: u32, new_status: PositionStatus) -> Result<Self> {
        PositionMapView::new(page)?;
        Ok(Self {
            header: RecordHeader::for_page(key),
            index,
            old_status: read_entry(page, index)?.status,
            new_status,
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            index: r.u32()?,
            old_status: PositionStatus::try_from(r.u8()?)?,
            new_status: PositionStatus::try_from(r.u8()?)?,
        }))
    }

    fn set(&self, page: &mut [u8], from: PositionStatus, to: PositionStatus) -> Result<()> {
        check_kind(page)?;
        let current = read_entry(page, self.index)?;
        if current.status != from {
            return Err(StorageError::Corruption("position status does not match record"));
        }
        write_entry(page, self.index, PositionEntry { status: to, ..current })
    }
}

impl OperationRecord for UpdateStatus {
    record_common!(UPDATE_STATUS);

    fn payload_size(&self) -> usize {
        4 + 1 + 1
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.index);
        w.put_u8(self.old_status as u8);
        w.put_u8(self.new_status as u8);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        self.set(page, self.old_status, self.new_status)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        self.set(page, self.new_status, self.old_status)
    }
}

/// Drops the last entry of the map, keeping it for undo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TruncateLastEntry {
    header: RecordHeader,
    /// Position of the dropped entry.
    pub index: u32,
    /// Entry before it was dropped.
    pub entry: PositionEntry,
}

impl TruncateLastEntry {
    /// Builds the record from the last entry of `page`.
    pub fn capture(key: PageKey, page: &[u8]) -> Result<Self> {
        let len = PositionMapView::new(page)?.len()?;
        let index = len
            .checked_sub(1)
            .ok_or(StorageError::Invalid("position map is empty"))?;
        Ok(Self {
            header: RecordHeader::for_page(key),
            index,
            entry: read_entry(page, index)?,
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            index: r.u32()?,
            entry: PositionEntry::decode(r)?,
        }))
    }
}

impl OperationRecord for TruncateLastEntry {
    record_common!(TRUNCATE_LAST_ENTRY);

    fn payload_size(&self) -> usize {
        4 + ENTRY_SIZE
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.index);
        self.entry.encode(w);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        pop_entry(page, self.index, self.entry)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        push_entry(page, self.index, self.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{assert_roundtrip, assert_symmetric};

    const KEY: PageKey = PageKey::new(3, 1);

    fn map_page() -> Result<Vec<u8>> {
        let mut page = vec![0u8; 1024];
        PositionMapInit::new(KEY).redo(&mut page)?;
        Ok(page)
    }

    #[test]
    fn allocate_then_fill_position() -> Result<()> {
        let mut page = map_page()?;
        let allocate = Allocate::new(KEY, &page)?;
        assert_symmetric(&allocate, &mut page)?;
        let update = UpdateEntry::capture(KEY, &page, 0, 12, 3)?;
        assert_eq!(update.old.status, PositionStatus::Allocated);
        assert_symmetric(&update, &mut page)?;
        let entry = PositionMapView::new(&page)?.entry(0)?;
        assert_eq!(
            entry,
            PositionEntry {
                status: PositionStatus::Filled,
                page_index: 12,
                record_position: 3
            }
        );
        assert_roundtrip(&allocate)?;
        assert_roundtrip(&update)
    }

    #[test]
    fn removed_position_is_marked_available_again() -> Result<()> {
        let mut page = map_page()?;
        Add::new(KEY, &page, 4, 0)?.redo(&mut page)?;
        let remove = UpdateStatus::capture(KEY, &page, 0, PositionStatus::Removed)?;
        assert_symmetric(&remove, &mut page)?;
        let reuse = UpdateStatus::capture(KEY, &page, 0, PositionStatus::Allocated)?;
        assert_symmetric(&reuse, &mut page)?;
        let entry = PositionMapView::new(&page)?.entry(0)?;
        assert_eq!(entry.status, PositionStatus::Allocated);
        assert_eq!(entry.page_index, 4);
        assert_roundtrip(&reuse)
    }

    #[test]
    fn truncate_last_entry_zeroes_the_slot() -> Result<()> {
        let mut page = map_page()?;
        let add = Add::new(KEY, &page, 7, 2)?;
        assert_symmetric(&add, &mut page)?;
        let truncate = TruncateLastEntry::capture(KEY, &page)?;
        assert_symmetric(&truncate, &mut page)?;
        let view = PositionMapView::new(&page)?;
        assert!(view.is_empty()?);
        assert_eq!(view.entry(0)?.status, PositionStatus::NotExistent);
        assert_eq!(page, map_page()?);
        assert_roundtrip(&add)?;
        assert_roundtrip(&truncate)
    }

    #[test]
    fn full_page_rejects_new_positions() -> Result<()> {
        let mut page = vec![0u8; POSITION_MAP_DATA + 2 * ENTRY_SIZE];
        PositionMapInit::new(KEY).redo(&mut page)?;
        Allocate::new(KEY, &page)?.redo(&mut page)?;
        Allocate::new(KEY, &page)?.redo(&mut page)?;
        assert!(!PositionMapView::new(&page)?.has_room()?);
        let third = Allocate::new(KEY, &page)?;
        assert!(matches!(third.redo(&mut page), Err(StorageError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn init_is_symmetric() -> Result<()> {
        let mut page = vec![0u8; 1024];
        let init = PositionMapInit::new(KEY);
        assert_symmetric(&init, &mut page)?;
        assert_roundtrip(&init)
    }
}
