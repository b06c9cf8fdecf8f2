//! Concrete operation records.
//!
//! Every family keeps its page in a canonical layout: a fixed
//! family header after the common page header, entries packed directly
//! after it, and an all-zero free region. Inserting shifts the tail right,
//! removing shifts it left and zeroes what was vacated, so each record's
//! `undo` restores the exact bytes its `redo` replaced.

use crate::primitives::wal::record::{RecordFactory, RecordTypeId};
use crate::types::{Result, StorageError};

macro_rules! record_common {
    ($type_id:expr) => {
        fn record_type(&self) -> $crate::primitives::wal::record::RecordTypeId {
            $type_id
        }

        fn header(&self) -> &$crate::primitives::wal::record::RecordHeader {
            &self.header
        }

        fn header_mut(&mut self) -> &mut $crate::primitives::wal::record::RecordHeader {
            &mut self.header
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    };
}

pub mod bucket;
pub mod cluster;
pub mod control;
pub mod position_map;

/// Every record type defined by this crate, in type id order.
pub(crate) const BUILTIN_RECORDS: &[(RecordTypeId, &str, RecordFactory)] = &[
    (control::ATOMIC_UNIT_START, "control.atomic_unit_start", control::AtomicUnitStart::decode),
    (control::ATOMIC_UNIT_END, "control.atomic_unit_end", control::AtomicUnitEnd::decode),
    (control::FULL_CHECKPOINT, "control.full_checkpoint", control::FullCheckpoint::decode),
    (bucket::INIT, "bucket.init", bucket::BucketInit::decode),
    (bucket::ADD_LEAF_ENTRY, "bucket.add_leaf_entry", bucket::AddLeafEntry::decode),
    (bucket::ADD_NON_LEAF_ENTRY, "bucket.add_non_leaf_entry", bucket::AddNonLeafEntry::decode),
    (bucket::REMOVE_LEAF_ENTRY, "bucket.remove_leaf_entry", bucket::RemoveLeafEntry::decode),
    (bucket::REMOVE_NON_LEAF_ENTRY, "bucket.remove_non_leaf_entry", bucket::RemoveNonLeafEntry::decode),
    (bucket::ADD_ALL, "bucket.add_all", bucket::AddAll::decode),
    (bucket::SHRINK, "bucket.shrink", bucket::Shrink::decode),
    (bucket::UPDATE_VALUE, "bucket.update_value", bucket::UpdateValue::decode),
    (bucket::SWITCH_BUCKET_TYPE, "bucket.switch_bucket_type", bucket::SwitchBucketType::decode),
    (bucket::SET_LEFT_SIBLING, "bucket.set_left_sibling", bucket::SetLeftSibling::decode),
    (bucket::SET_RIGHT_SIBLING, "bucket.set_right_sibling", bucket::SetRightSibling::decode),
    (bucket::SET_TREE_SIZE, "bucket.set_tree_size", bucket::SetTreeSize::decode),
    (cluster::INIT, "cluster.init", cluster::ClusterInit::decode),
    (cluster::APPEND_RECORD, "cluster.append_record", cluster::AppendRecord::decode),
    (cluster::REPLACE_RECORD, "cluster.replace_record", cluster::ReplaceRecord::decode),
    (cluster::DELETE_RECORD, "cluster.delete_record", cluster::DeleteRecord::decode),
    (cluster::RECYCLE_RECORD, "cluster.recycle_record", cluster::RecycleRecord::decode),
    (cluster::SET_NEXT_PAGE, "cluster.set_next_page", cluster::SetNextPage::decode),
    (cluster::SET_PREV_PAGE, "cluster.set_prev_page", cluster::SetPrevPage::decode),
    (position_map::ALLOCATE, "position_map.allocate", position_map::Allocate::decode),
    (position_map::ADD, "position_map.add", position_map::Add::decode),
    (position_map::UPDATE_ENTRY, "position_map.update_entry", position_map::UpdateEntry::decode),
    (position_map::UPDATE_STATUS, "position_map.update_status", position_map::UpdateStatus::decode),
    (position_map::TRUNCATE_LAST_ENTRY, "position_map.truncate_last_entry", position_map::TruncateLastEntry::decode),
    (position_map::INIT, "position_map.init", position_map::PositionMapInit::decode),
];

fn field(page: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    page.get(off..off + len)
        .ok_or(StorageError::Corruption("page field out of bounds"))
}

fn field_mut(page: &mut [u8], off: usize, len: usize) -> Result<&mut [u8]> {
    page.get_mut(off..off + len)
        .ok_or(StorageError::Corruption("page field out of bounds"))
}

fn read_array<const N: usize>(page: &[u8], off: usize) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(field(page, off, N)?);
    Ok(out)
}

pub(crate) fn get_u8(page: &[u8], off: usize) -> Result<u8> {
    Ok(field(page, off, 1)?[0])
}

pub(crate) fn put_u8(page: &mut [u8], off: usize, v: u8) -> Result<()> {
    field_mut(page, off, 1)?[0] = v;
    Ok(())
}

pub(crate) fn get_u32(page: &[u8], off: usize) -> Result<u32> {
    Ok(u32::from_be_bytes(read_array(page, off)?))
}

pub(crate) fn put_u32(page: &mut [u8], off: usize, v: u32) -> Result<()> {
    field_mut(page, off, 4)?.copy_from_slice(&v.to_be_bytes());
    Ok(())
}

pub(crate) fn get_i32(page: &[u8], off: usize) -> Result<i32> {
    Ok(i32::from_be_bytes(read_array(page, off)?))
}

pub(crate) fn put_i32(page: &mut [u8], off: usize, v: i32) -> Result<()> {
    field_mut(page, off, 4)?.copy_from_slice(&v.to_be_bytes());
    Ok(())
}

pub(crate) fn get_u64(page: &[u8], off: usize) -> Result<u64> {
    Ok(u64::from_be_bytes(read_array(page, off)?))
}

pub(crate) fn put_u64(page: &mut [u8], off: usize, v: u64) -> Result<()> {
    field_mut(page, off, 8)?.copy_from_slice(&v.to_be_bytes());
    Ok(())
}

pub(crate) fn get_i64(page: &[u8], off: usize) -> Result<i64> {
    Ok(i64::from_be_bytes(read_array(page, off)?))
}

pub(crate) fn put_i64(page: &mut [u8], off: usize, v: i64) -> Result<()> {
    field_mut(page, off, 8)?.copy_from_slice(&v.to_be_bytes());
    Ok(())
}

pub(crate) fn get_bytes(page: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    field(page, off, len)
}

pub(crate) fn put_bytes(page: &mut [u8], off: usize, src: &[u8]) -> Result<()> {
    field_mut(page, off, src.len())?.copy_from_slice(src);
    Ok(())
}

/// Returns true when `page[start..end]` is all zero.
pub(crate) fn is_zeroed(page: &[u8], start: usize, end: usize) -> Result<bool> {
    Ok(field(page, start, end - start)?.iter().all(|&b| b == 0))
}

/// Opens a gap of `len` bytes at `at` inside the packed region ending at
/// `end`, moving `page[at..end]` right.
pub(crate) fn open_gap(page: &mut [u8], at: usize, end: usize, len: usize) -> Result<()> {
    if at > end || end > page.len() {
        return Err(StorageError::Corruption("packed region out of bounds"));
    }
    if end + len > page.len() {
        return Err(StorageError::Invalid("entry does not fit into the page"));
    }
    page.copy_within(at..end, at + len);
    Ok(())
}

/// Closes the `len` byte gap at `at` inside the packed region ending at
/// `end`, moving the tail left and zeroing the vacated bytes.
pub(crate) fn close_gap(page: &mut [u8], at: usize, end: usize, len: usize) -> Result<()> {
    if at + len > end || end > page.len() {
        return Err(StorageError::Corruption("packed region out of bounds"));
    }
    page.copy_within(at + len..end, at);
    page[end - len..end].fill(0);
    Ok(())
}

/// Checks that `undo` restores the bytes `redo` replaced and that `redo`
/// reproduces the same image afterwards, leaving the page redone.
#[cfg(test)]
pub(crate) fn assert_symmetric(
    record: &dyn crate::primitives::wal::record::OperationRecord,
    page: &mut [u8],
) -> Result<()> {
    let before = page.to_vec();
    record.redo(page)?;
    let after = page.to_vec();
    assert_ne!(before, after, "{record:?} did not change the page");
    record.undo(page)?;
    assert_eq!(before, page, "undo of {record:?} is not exact");
    record.redo(page)?;
    assert_eq!(after, page, "redo of {record:?} is not repeatable");
    Ok(())
}

/// Checks that a record survives serialization through the builtin registry.
#[cfg(test)]
pub(crate) fn assert_roundtrip(
    record: &dyn crate::primitives::wal::record::OperationRecord,
) -> Result<()> {
    use crate::primitives::wal::record::{serialize, RecordRegistry};
    let bytes = serialize(record);
    let decoded = RecordRegistry::builtin().deserialize(&bytes)?;
    assert_eq!(decoded.record_type(), record.record_type());
    assert_eq!(serialize(decoded.as_ref()), bytes);
    assert_eq!(format!("{decoded:?}"), format!("{record:?}"));
    Ok(())
}
