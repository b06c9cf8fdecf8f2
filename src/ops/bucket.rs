//! Page-local edits of ordered key/value bucket pages.
//!
//! Layout after the common page header:
//!
//! | offset | field |
//! |--------|-------|
//! | 32 | `is_leaf: u8` + 3 reserved bytes |
//! | 36 | `entry_count: u32` |
//! | 40 | `used_bytes: u32` (bytes of the packed entry area) |
//! | 44 | `left_sibling: i64` |
//! | 52 | `right_sibling: i64` |
//! | 60 | `tree_size: u64` + 4 reserved bytes |
//! | 72 | entries, each `[len u32][body]` |
//!
//! A leaf body is `[key_len u32][key][value]`, a non-leaf body is
//! `[left_child i64][right_child i64][key]`. Key ordering is the caller's
//! business; records only place entries at the index they are given.

use crate::ops::{
    close_gap, get_bytes, get_i64, get_u32, get_u64, get_u8, is_zeroed, open_gap, put_bytes,
    put_i64, put_u32, put_u64, put_u8,
};
use crate::primitives::bytes::{byte_list_len, bytes_len, ByteReader, ByteWriter};
use crate::primitives::wal::record::{OperationRecord, RecordHeader, RecordTypeId};
use crate::types::page::{has_format, page_kind, set_page_kind, PageKind, PAGE_HDR_LEN};
use crate::types::{PageKey, Result, StorageError};

/// Type id of [`BucketInit`].
pub const INIT: RecordTypeId = 20;
/// Type id of [`AddLeafEntry`].
pub const ADD_LEAF_ENTRY: RecordTypeId = 21;
/// Type id of [`AddNonLeafEntry`].
pub const ADD_NON_LEAF_ENTRY: RecordTypeId = 22;
/// Type id of [`RemoveLeafEntry`].
pub const REMOVE_LEAF_ENTRY: RecordTypeId = 23;
/// Type id of [`RemoveNonLeafEntry`].
pub const REMOVE_NON_LEAF_ENTRY: RecordTypeId = 24;
/// Type id of [`AddAll`].
pub const ADD_ALL: RecordTypeId = 25;
/// Type id of [`Shrink`].
pub const SHRINK: RecordTypeId = 26;
/// Type id of [`UpdateValue`].
pub const UPDATE_VALUE: RecordTypeId = 27;
/// Type id of [`SwitchBucketType`].
pub const SWITCH_BUCKET_TYPE: RecordTypeId = 28;
/// Type id of [`SetLeftSibling`].
pub const SET_LEFT_SIBLING: RecordTypeId = 29;
/// Type id of [`SetRightSibling`].
pub const SET_RIGHT_SIBLING: RecordTypeId = 30;
/// Type id of [`SetTreeSize`].
pub const SET_TREE_SIZE: RecordTypeId = 31;

const IS_LEAF: usize = PAGE_HDR_LEN;
const ENTRY_COUNT: usize = PAGE_HDR_LEN + 4;
const USED_BYTES: usize = PAGE_HDR_LEN + 8;
const LEFT_SIBLING: usize = PAGE_HDR_LEN + 12;
const RIGHT_SIBLING: usize = PAGE_HDR_LEN + 20;
const TREE_SIZE: usize = PAGE_HDR_LEN + 28;
/// First byte of the packed entry area.
pub const BUCKET_DATA: usize = PAGE_HDR_LEN + 40;

const LEFT_CHILD: usize = 0;
const RIGHT_CHILD: usize = 8;

/// Sibling pointer value meaning "no sibling".
pub const NO_SIBLING: i64 = -1;

/// Encodes a leaf entry body.
pub fn encode_leaf_entry(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + value.len());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

/// Encodes a non-leaf entry body.
pub fn encode_non_leaf_entry(left_child: i64, right_child: i64, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + key.len());
    out.extend_from_slice(&left_child.to_be_bytes());
    out.extend_from_slice(&right_child.to_be_bytes());
    out.extend_from_slice(key);
    out
}

fn decode_leaf_entry(body: &[u8]) -> Result<(&[u8], &[u8])> {
    let key_len = get_u32(body, 0)? as usize;
    let key = get_bytes(body, 4, key_len)?;
    Ok((key, &body[4 + key_len..]))
}

fn decode_non_leaf_entry(body: &[u8]) -> Result<(i64, i64, &[u8])> {
    let left = get_i64(body, LEFT_CHILD)?;
    let right = get_i64(body, RIGHT_CHILD)?;
    Ok((left, right, &body[16..]))
}

/// Read access to a formatted bucket page.
pub struct BucketView<'a> {
    page: &'a [u8],
}

impl<'a> BucketView<'a> {
    /// Wraps `page`, failing unless it is formatted as a bucket.
    pub fn new(page: &'a [u8]) -> Result<Self> {
        check_kind(page)?;
        Ok(Self { page })
    }

    /// Returns true for a leaf bucket.
    pub fn is_leaf(&self) -> Result<bool> {
        is_leaf(self.page)
    }

    /// Number of entries.
    pub fn len(&self) -> Result<u32> {
        entry_count(self.page)
    }

    /// Returns true when the bucket holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Raw body of entry `index`.
    pub fn entry(&self, index: u32) -> Result<&'a [u8]> {
        entry_at(self.page, index)
    }

    /// Key and value of leaf entry `index`.
    pub fn leaf_entry(&self, index: u32) -> Result<(&'a [u8], &'a [u8])> {
        decode_leaf_entry(self.entry(index)?)
    }

    /// Left child, right child and key of non-leaf entry `index`.
    pub fn non_leaf_entry(&self, index: u32) -> Result<(i64, i64, &'a [u8])> {
        decode_non_leaf_entry(self.entry(index)?)
    }

    /// Page index of the left sibling, [`NO_SIBLING`] if none.
    pub fn left_sibling(&self) -> Result<i64> {
        get_i64(self.page, LEFT_SIBLING)
    }

    /// Page index of the right sibling, [`NO_SIBLING`] if none.
    pub fn right_sibling(&self) -> Result<i64> {
        get_i64(self.page, RIGHT_SIBLING)
    }

    /// Element count of the tree, kept in its root bucket.
    pub fn tree_size(&self) -> Result<u64> {
        get_u64(self.page, TREE_SIZE)
    }

    /// Bytes still available for entries, counting their length prefixes.
    pub fn free_space(&self) -> Result<usize> {
        self.page
            .len()
            .checked_sub(BUCKET_DATA + used_bytes(self.page)?)
            .ok_or(StorageError::Corruption("bucket used bytes exceed the page"))
    }
}

fn check_kind(page: &[u8]) -> Result<()> {
    if has_format(page, PageKind::Bucket) {
        Ok(())
    } else {
        Err(StorageError::Corruption("page is not a bucket page"))
    }
}

fn is_leaf(page: &[u8]) -> Result<bool> {
    Ok(get_u8(page, IS_LEAF)? == 1)
}

fn require_leaf(page: &[u8], leaf: bool) -> Result<()> {
    check_kind(page)?;
    if is_leaf(page)? != leaf {
        return Err(StorageError::Corruption("bucket leaf flag does not match record"));
    }
    Ok(())
}

fn entry_count(page: &[u8]) -> Result<u32> {
    get_u32(page, ENTRY_COUNT)
}

fn used_bytes(page: &[u8]) -> Result<usize> {
    let used = get_u32(page, USED_BYTES)? as usize;
    if used > page.len().saturating_sub(BUCKET_DATA) {
        return Err(StorageError::Corruption("bucket used bytes exceed the page"));
    }
    Ok(used)
}

/// `used - size`, failing when the counter is smaller than the entry it
/// should account for.
fn shrink_used(used: usize, size: usize) -> Result<usize> {
    used.checked_sub(size)
        .ok_or(StorageError::Corruption("bucket used bytes below entry size"))
}

fn entry_offset(page: &[u8], index: u32) -> Result<usize> {
    if index > entry_count(page)? {
        return Err(StorageError::Corruption("bucket entry index out of range"));
    }
    let mut off = BUCKET_DATA;
    for _ in 0..index {
        off += 4 + get_u32(page, off)? as usize;
    }
    Ok(off)
}

fn entry_at(page: &[u8], index: u32) -> Result<&[u8]> {
    if index >= entry_count(page)? {
        return Err(StorageError::Corruption("bucket entry index out of range"));
    }
    let off = entry_offset(page, index)?;
    let len = get_u32(page, off)? as usize;
    get_bytes(page, off + 4, len)
}

fn insert_entry(page: &mut [u8], index: u32, body: &[u8]) -> Result<()> {
    let count = entry_count(page)?;
    let used = used_bytes(page)?;
    let at = entry_offset(page, index)?;
    let total = 4 + body.len();
    open_gap(page, at, BUCKET_DATA + used, total)?;
    put_u32(page, at, body.len() as u32)?;
    put_bytes(page, at + 4, body)?;
    put_u32(page, ENTRY_COUNT, count + 1)?;
    put_u32(page, USED_BYTES, (used + total) as u32)
}

fn remove_entry(page: &mut [u8], index: u32, expected: &[u8]) -> Result<()> {
    if entry_at(page, index)? != expected {
        return Err(StorageError::Corruption("bucket entry does not match record"));
    }
    let count = entry_count(page)?;
    let used = used_bytes(page)?;
    let at = entry_offset(page, index)?;
    let total = 4 + expected.len();
    let shrunk = shrink_used(used, total)?;
    close_gap(page, at, BUCKET_DATA + used, total)?;
    put_u32(page, ENTRY_COUNT, count - 1)?;
    put_u32(page, USED_BYTES, shrunk as u32)
}

fn ensure_room(page: &[u8], removed: usize, added: usize) -> Result<()> {
    let used = used_bytes(page)?;
    if used - removed.min(used) + added > page.len().saturating_sub(BUCKET_DATA) {
        return Err(StorageError::Invalid("entry does not fit into the page"));
    }
    Ok(())
}

fn set_child(page: &mut [u8], index: u32, child: usize, value: i64) -> Result<()> {
    if index >= entry_count(page)? {
        return Err(StorageError::Corruption("bucket entry index out of range"));
    }
    let off = entry_offset(page, index)?;
    put_i64(page, off + 4 + child, value)
}

fn swap_i64(page: &mut [u8], off: usize, from: i64, to: i64) -> Result<()> {
    check_kind(page)?;
    if get_i64(page, off)? != from {
        return Err(StorageError::Corruption("bucket field does not match record"));
    }
    put_i64(page, off, to)
}

/// Formats a fresh page as an empty bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketInit {
    header: RecordHeader,
    /// Whether the bucket starts as a leaf.
    pub is_leaf: bool,
}

impl BucketInit {
    /// Formats `page` as an empty leaf or non-leaf bucket.
    pub fn new(page: PageKey, is_leaf: bool) -> Self {
        Self {
            header: RecordHeader::for_page(page),
            is_leaf,
        }
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            is_leaf: r.bool()?,
        }))
    }
}

impl OperationRecord for BucketInit {
    record_common!(INIT);

    fn payload_size(&self) -> usize {
        1
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_bool(self.is_leaf);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        if page_kind(page)? != PageKind::Unformatted || !is_zeroed(page, PAGE_HDR_LEN, BUCKET_DATA)? {
            return Err(StorageError::Corruption("bucket init target is not a fresh page"));
        }
        set_page_kind(page, PageKind::Bucket);
        put_u8(page, IS_LEAF, u8::from(self.is_leaf))?;
        put_i64(page, LEFT_SIBLING, NO_SIBLING)?;
        put_i64(page, RIGHT_SIBLING, NO_SIBLING)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        require_leaf(page, self.is_leaf)?;
        if entry_count(page)? != 0 {
            return Err(StorageError::Corruption("bucket init undone on a non-empty bucket"));
        }
        put_bytes(page, PAGE_HDR_LEN, &[0u8; BUCKET_DATA - PAGE_HDR_LEN])?;
        set_page_kind(page, PageKind::Unformatted);
        Ok(())
    }
}

/// Inserts a key/value entry into a leaf bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddLeafEntry {
    header: RecordHeader,
    /// Position of the new entry.
    pub index: u32,
    /// Entry key.
    pub key: Vec<u8>,
    /// Entry value.
    pub value: Vec<u8>,
}

impl AddLeafEntry {
    /// Inserts `key`/`value` at position `index`.
    pub fn new(page: PageKey, index: u32, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            header: RecordHeader::for_page(page),
            index,
            key,
            value,
        }
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            index: r.u32()?,
            key: r.bytes()?,
            value: r.bytes()?,
        }))
    }
}

impl OperationRecord for AddLeafEntry {
    record_common!(ADD_LEAF_ENTRY);

    fn payload_size(&self) -> usize {
        4 + bytes_len(self.key.len()) + bytes_len(self.value.len())
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.index);
        w.put_bytes(&self.key);
        w.put_bytes(&self.value);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        require_leaf(page, true)?;
        insert_entry(page, self.index, &encode_leaf_entry(&self.key, &self.value))
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        require_leaf(page, true)?;
        remove_entry(page, self.index, &encode_leaf_entry(&self.key, &self.value))
    }
}

/// Removes a key/value entry from a leaf bucket, keeping it for undo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveLeafEntry {
    header: RecordHeader,
    /// Position of the removed entry.
    pub index: u32,
    /// Removed key.
    pub key: Vec<u8>,
    /// Removed value.
    pub value: Vec<u8>,
}

impl RemoveLeafEntry {
    /// Builds the record from the entry currently stored at `index`.
    pub fn capture(key: PageKey, page: &[u8], index: u32) -> Result<Self> {
        let (k, v) = BucketView::new(page)?.leaf_entry(index)?;
        Ok(Self {
            header: RecordHeader::for_page(key),
            index,
            key: k.to_vec(),
            value: v.to_vec(),
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            index: r.u32()?,
            key: r.bytes()?,
            value: r.bytes()?,
        }))
    }
}

impl OperationRecord for RemoveLeafEntry {
    record_common!(REMOVE_LEAF_ENTRY);

    fn payload_size(&self) -> usize {
        4 + bytes_len(self.key.len()) + bytes_len(self.value.len())
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.index);
        w.put_bytes(&self.key);
        w.put_bytes(&self.value);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        require_leaf(page, true)?;
        remove_entry(page, self.index, &encode_leaf_entry(&self.key, &self.value))
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        require_leaf(page, true)?;
        insert_entry(page, self.index, &encode_leaf_entry(&self.key, &self.value))
    }
}

/// Inserts a separator entry into a non-leaf bucket. With
/// `update_neighbours` the right child of the previous entry and the left
/// child of the next entry are relinked to the new entry's children; their
/// prior values are kept for undo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddNonLeafEntry {
    header: RecordHeader,
    /// Position of the new entry.
    pub index: u32,
    /// Separator key.
    pub key: Vec<u8>,
    /// Child holding keys below `key`.
    pub left_child: i64,
    /// Child holding keys from `key` on.
    pub right_child: i64,
    /// Whether neighbouring entries are relinked.
    pub update_neighbours: bool,
    /// Right child of the previous entry before relinking.
    pub previous_left_neighbour_right: i64,
    /// Left child of the next entry before relinking.
    pub previous_right_neighbour_left: i64,
}

impl AddNonLeafEntry {
    /// Builds the record, reading the neighbour pointers it may overwrite.
    pub fn new(
        key: PageKey,
        page: &[u8],
        index: u32,
        separator: Vec<u8>,
        left_child: i64,
        right_child: i64,
        update_neighbours: bool,
    ) -> Result<Self> {
        let view = BucketView::new(page)?;
        let count = view.len()?;
        let mut previous_left_neighbour_right = 0;
        let mut previous_right_neighbour_left = 0;
        if update_neighbours {
            if index > 0 {
                previous_left_neighbour_right = view.non_leaf_entry(index - 1)?.1;
            }
            if index < count {
                previous_right_neighbour_left = view.non_leaf_entry(index)?.0;
            }
        }
        Ok(Self {
            header: RecordHeader::for_page(key),
            index,
            key: separator,
            left_child,
            right_child,
            update_neighbours,
            previous_left_neighbour_right,
            previous_right_neighbour_left,
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            index: r.u32()?,
            left_child: r.i64()?,
            right_child: r.i64()?,
            update_neighbours: r.bool()?,
            previous_left_neighbour_right: r.i64()?,
            previous_right_neighbour_left: r.i64()?,
            key: r.bytes()?,
        }))
    }

    fn relink(&self, page: &mut [u8], left: i64, right: i64) -> Result<()> {
        if self.index > 0 {
            set_child(page, self.index - 1, RIGHT_CHILD, left)?;
        }
        if self.index + 1 < entry_count(page)? {
            set_child(page, self.index + 1, LEFT_CHILD, right)?;
        }
        Ok(())
    }
}

impl OperationRecord for AddNonLeafEntry {
    record_common!(ADD_NON_LEAF_ENTRY);

    fn payload_size(&self) -> usize {
        4 + 8 + 8 + 1 + 8 + 8 + bytes_len(self.key.len())
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.index);
        w.put_i64(self.left_child);
        w.put_i64(self.right_child);
        w.put_bool(self.update_neighbours);
        w.put_i64(self.previous_left_neighbour_right);
        w.put_i64(self.previous_right_neighbour_left);
        w.put_bytes(&self.key);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        require_leaf(page, false)?;
        let body = encode_non_leaf_entry(self.left_child, self.right_child, &self.key);
        insert_entry(page, self.index, &body)?;
        if self.update_neighbours {
            self.relink(page, self.left_child, self.right_child)?;
        }
        Ok(())
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        require_leaf(page, false)?;
        if self.update_neighbours {
            self.relink(
                page,
                self.previous_left_neighbour_right,
                self.previous_right_neighbour_left,
            )?;
        }
        let body = encode_non_leaf_entry(self.left_child, self.right_child, &self.key);
        remove_entry(page, self.index, &body)
    }
}

/// Removes a separator entry from a non-leaf bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveNonLeafEntry {
    header: RecordHeader,
    /// Position of the removed entry.
    pub index: u32,
    /// Removed separator key.
    pub key: Vec<u8>,
    /// Removed left child.
    pub left_child: i64,
    /// Removed right child.
    pub right_child: i64,
}

impl RemoveNonLeafEntry {
    /// Builds the record from the entry currently stored at `index`.
    pub fn capture(key: PageKey, page: &[u8], index: u32) -> Result<Self> {
        let (left_child, right_child, separator) = BucketView::new(page)?.non_leaf_entry(index)?;
        Ok(Self {
            header: RecordHeader::for_page(key),
            index,
            key: separator.to_vec(),
            left_child,
            right_child,
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            index: r.u32()?,
            left_child: r.i64()?,
            right_child: r.i64()?,
            key: r.bytes()?,
        }))
    }
}

impl OperationRecord for RemoveNonLeafEntry {
    record_common!(REMOVE_NON_LEAF_ENTRY);

    fn payload_size(&self) -> usize {
        4 + 8 + 8 + bytes_len(self.key.len())
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.index);
        w.put_i64(self.left_child);
        w.put_i64(self.right_child);
        w.put_bytes(&self.key);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        require_leaf(page, false)?;
        let body = encode_non_leaf_entry(self.left_child, self.right_child, &self.key);
        remove_entry(page, self.index, &body)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        require_leaf(page, false)?;
        let body = encode_non_leaf_entry(self.left_child, self.right_child, &self.key);
        insert_entry(page, self.index, &body)
    }
}

/// Appends already encoded entry bodies in bulk, as a bucket split does.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddAll {
    header: RecordHeader,
    /// Encoded entry bodies, appended in order.
    pub entries: Vec<Vec<u8>>,
}

impl AddAll {
    /// Appends `entries` after the existing ones.
    pub fn new(page: PageKey, entries: Vec<Vec<u8>>) -> Self {
        Self {
            header: RecordHeader::for_page(page),
            entries,
        }
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            entries: r.byte_list()?,
        }))
    }
}

impl OperationRecord for AddAll {
    record_common!(ADD_ALL);

    fn payload_size(&self) -> usize {
        byte_list_len(&self.entries)
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_byte_list(&self.entries);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        check_kind(page)?;
        let added = self.entries.iter().map(|body| 4 + body.len()).sum();
        ensure_room(page, 0, added)?;
        for body in &self.entries {
            let count = entry_count(page)?;
            insert_entry(page, count, body)?;
        }
        Ok(())
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        check_kind(page)?;
        let count = entry_count(page)?;
        let added = self.entries.len() as u32;
        if count < added {
            return Err(StorageError::Corruption("bucket has fewer entries than were added"));
        }
        for (i, body) in self.entries.iter().enumerate().rev() {
            remove_entry(page, count - added + i as u32, body)?;
        }
        Ok(())
    }
}

/// Cuts a bucket down to its first `new_size` entries, keeping the removed
/// tail for undo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shrink {
    header: RecordHeader,
    /// Entry count after the cut.
    pub new_size: u32,
    /// Encoded bodies of the cut entries.
    pub removed: Vec<Vec<u8>>,
}

impl Shrink {
    /// Builds the record from the entries past `new_size`.
    pub fn capture(key: PageKey, page: &[u8], new_size: u32) -> Result<Self> {
        let view = BucketView::new(page)?;
        let removed = (new_size..view.len()?)
            .map(|i| view.entry(i).map(<[u8]>::to_vec))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            header: RecordHeader::for_page(key),
            new_size,
            removed,
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            new_size: r.u32()?,
            removed: r.byte_list()?,
        }))
    }
}

impl OperationRecord for Shrink {
    record_common!(SHRINK);

    fn payload_size(&self) -> usize {
        4 + byte_list_len(&self.removed)
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.new_size);
        w.put_byte_list(&self.removed);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        check_kind(page)?;
        if entry_count(page)? != self.new_size + self.removed.len() as u32 {
            return Err(StorageError::Corruption("bucket size does not match shrink record"));
        }
        for (i, body) in self.removed.iter().enumerate().rev() {
            remove_entry(page, self.new_size + i as u32, body)?;
        }
        Ok(())
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        check_kind(page)?;
        if entry_count(page)? != self.new_size {
            return Err(StorageError::Corruption("bucket size does not match shrink record"));
        }
        for (i, body) in self.removed.iter().enumerate() {
            insert_entry(page, self.new_size + i as u32, body)?;
        }
        Ok(())
    }
}

/// Replaces the value of a leaf entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateValue {
    header: RecordHeader,
    /// Position of the entry.
    pub index: u32,
    /// Value before the update.
    pub old_value: Vec<u8>,
    /// Value after the update.
    pub new_value: Vec<u8>,
}

impl UpdateValue {
    /// Builds the record from the value currently stored at `index`.
    pub fn capture(key: PageKey, page: &[u8], index: u32, new_value: Vec<u8>) -> Result<Self> {
        let (_, old) = BucketView::new(page)?.leaf_entry(index)?;
        Ok(Self {
            header: RecordHeader::for_page(key),
            index,
            old_value: old.to_vec(),
            new_value,
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            index: r.u32()?,
            old_value: r.bytes()?,
            new_value: r.bytes()?,
        }))
    }

    fn replace(&self, page: &mut [u8], from: &[u8], to: &[u8]) -> Result<()> {
        require_leaf(page, true)?;
        let current = entry_at(page, self.index)?.to_vec();
        let (key, value) = decode_leaf_entry(&current)?;
        if value != from {
            return Err(StorageError::Corruption("bucket value does not match record"));
        }
        let replacement = encode_leaf_entry(key, to);
        ensure_room(page, current.len(), replacement.len())?;
        remove_entry(page, self.index, &current)?;
        insert_entry(page, self.index, &replacement)
    }
}

impl OperationRecord for UpdateValue {
    record_common!(UPDATE_VALUE);

    fn payload_size(&self) -> usize {
        4 + bytes_len(self.old_value.len()) + bytes_len(self.new_value.len())
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u32(self.index);
        w.put_bytes(&self.old_value);
        w.put_bytes(&self.new_value);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        self.replace(page, &self.old_value, &self.new_value)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        self.replace(page, &self.new_value, &self.old_value)
    }
}

/// Flips an empty bucket between leaf and non-leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchBucketType {
    header: RecordHeader,
    /// Leaf flag before the switch.
    pub was_leaf: bool,
}

impl SwitchBucketType {
    /// Switches a bucket that currently has the `was_leaf` flag.
    pub fn new(page: PageKey, was_leaf: bool) -> Self {
        Self {
            header: RecordHeader::for_page(page),
            was_leaf,
        }
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            was_leaf: r.bool()?,
        }))
    }

    fn switch(page: &mut [u8], from: bool) -> Result<()> {
        require_leaf(page, from)?;
        if entry_count(page)? != 0 {
            return Err(StorageError::Invalid("only an empty bucket can switch type"));
        }
        put_u8(page, IS_LEAF, u8::from(!from))
    }
}

impl OperationRecord for SwitchBucketType {
    record_common!(SWITCH_BUCKET_TYPE);

    fn payload_size(&self) -> usize {
        1
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_bool(self.was_leaf);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        Self::switch(page, self.was_leaf)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        Self::switch(page, !self.was_leaf)
    }
}

macro_rules! sibling_record {
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
            /// Builds the record from the pointer currently stored.
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
                swap_i64(page, $offset, self.old, self.new)
            }

            fn undo(&self, page: &mut [u8]) -> Result<()> {
                swap_i64(page, $offset, self.new, self.old)
            }
        }
    };
}

sibling_record!(
    /// Relinks the left sibling pointer of a bucket.
    SetLeftSibling,
    SET_LEFT_SIBLING,
    LEFT_SIBLING
);
sibling_record!(
    /// Relinks the right sibling pointer of a bucket.
    SetRightSibling,
    SET_RIGHT_SIBLING,
    RIGHT_SIBLING
);

/// Adjusts the element counter a tree keeps in its root bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetTreeSize {
    header: RecordHeader,
    /// Counter before the update.
    pub old: u64,
    /// Counter after the update.
    pub new: u64,
}

impl SetTreeSize {
    /// Builds the record from the counter currently stored.
    pub fn capture(key: PageKey, page: &[u8], new: u64) -> Result<Self> {
        Ok(Self {
            header: RecordHeader::for_page(key),
            old: BucketView::new(page)?.tree_size()?,
            new,
        })
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            old: r.u64()?,
            new: r.u64()?,
        }))
    }

    fn set(page: &mut [u8], from: u64, to: u64) -> Result<()> {
        check_kind(page)?;
        if get_u64(page, TREE_SIZE)? != from {
            return Err(StorageError::Corruption("bucket tree size does not match record"));
        }
        put_u64(page, TREE_SIZE, to)
    }
}

impl OperationRecord for SetTreeSize {
    record_common!(SET_TREE_SIZE);

    fn payload_size(&self) -> usize {
        16
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_u64(self.old);
        w.put_u64(self.new);
    }

    fn redo(&self, page: &mut [u8]) -> Result<()> {
        Self::set(page, self.old, self.new)
    }

    fn undo(&self, page: &mut [u8]) -> Result<()> {
        Self::set(page, self.new, self.old)
    }
}
