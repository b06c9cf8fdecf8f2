//! Operation records: the replayable unit of mutation persisted by the WAL.
//!
//! Every record serializes as
//! `[type_id u16][unit_id u64][has_page u8][file_id u32][page_index u32][payload]`.
//! The header part is handled here; each concrete type only encodes its
//! payload. Replay rebuilds records through a [`RecordRegistry`], a table
//! from type id to factory function.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{PageKey, Result, StorageError, UnitId};

/// Stable numeric tag identifying a record type on disk.
pub type RecordTypeId = u16;

/// Fixed-size prefix shared by every serialized record.
pub const RECORD_HEADER_LEN: usize = 2 + 8 + 1 + 4 + 4;

/// Fields common to all records.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordHeader {
    /// Operation unit the record belongs to.
    pub unit_id: UnitId,
    /// Target page for page-level records, `None` for control records.
    pub page: Option<PageKey>,
}

impl RecordHeader {
    /// Header for a page-level record; the unit id is assigned on apply.
    pub fn for_page(page: PageKey) -> Self {
        Self {
            unit_id: UnitId::default(),
            page: Some(page),
        }
    }

    /// Header for a record that targets no page.
    pub fn control(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            page: None,
        }
    }
}

/// A self-describing, replayable page mutation.
///
/// `redo` and `undo` operate on a page the caller already holds exclusively
/// and must not perform I/O. For every record `undo` is the exact byte
/// inverse of `redo`.
pub trait OperationRecord: fmt::Debug + Send + Sync + 'static {
    /// Stable type id used for polymorphic reconstruction.
    fn record_type(&self) -> RecordTypeId;
    /// Common header.
    fn header(&self) -> &RecordHeader;
    /// Mutable access to the common header.
    fn header_mut(&mut self) -> &mut RecordHeader;
    /// Size of the type-specific payload in bytes.
    fn payload_size(&self) -> usize;
    /// Encodes the type-specific payload.
    fn encode_payload(&self, w: &mut ByteWriter<'_>);
    /// Reapplies the mutation to the page.
    fn redo(&self, page: &mut [u8]) -> Result<()>;
    /// Reverses the mutation on the page.
    fn undo(&self, page: &mut [u8]) -> Result<()>;
    /// Downcasting support for tests and collaborators.
    fn as_any(&self) -> &dyn Any;

    /// Operation unit the record belongs to.
    fn unit_id(&self) -> UnitId {
        self.header().unit_id
    }

    /// Target page, if any.
    fn page(&self) -> Option<PageKey> {
        self.header().page
    }
}

/// Total serialized size of a record including its header.
pub fn serialized_size(record: &dyn OperationRecord) -> usize {
    RECORD_HEADER_LEN + record.payload_size()
}

/// Appends the serialized record to `out`.
pub fn serialize_into(record: &dyn OperationRecord, out: &mut Vec<u8>) {
    out.reserve(serialized_size(record));
    let header = record.header();
    let mut w = ByteWriter::new(out);
    w.put_u16(record.record_type());
    w.put_u64(header.unit_id.0);
    match header.page {
        Some(page) => {
            w.put_u8(1);
            w.put_u32(page.file_id);
            w.put_u32(page.page_index);
        }
        None => {
            w.put_u8(0);
            w.put_u32(0);
            w.put_u32(0);
        }
    }
    record.encode_payload(&mut w);
}

/// Serializes a record into a fresh buffer.
pub fn serialize(record: &dyn OperationRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(serialized_size(record));
    serialize_into(record, &mut out);
    out
}

/// Builds a record of one type from its decoded header and payload reader.
pub type RecordFactory = fn(RecordHeader, &mut ByteReader<'_>) -> Result<Box<dyn OperationRecord>>;

#[derive(Clone, Copy)]
struct Registration {
    name: &'static str,
    factory: RecordFactory,
}

/// Type id to factory table used to rebuild records during replay.
#[derive(Clone, Default)]
pub struct RecordRegistry {
    entries: HashMap<RecordTypeId, Registration>,
}

impl fmt::Debug for RecordRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("RecordRegistry").field("types", &ids).finish()
    }
}

impl RecordRegistry {
    /// Creates a registry with no types registered.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a registry holding every record type defined by this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for &(id, name, factory) in crate::ops::BUILTIN_RECORDS {
            registry.entries.insert(id, Registration { name, factory });
        }
        registry
    }

    /// Registers a factory for `type_id`. Ids are never reused, so
    /// registering an id twice is an error.
    pub fn register(
        &mut self,
        type_id: RecordTypeId,
        name: &'static str,
        factory: RecordFactory,
    ) -> Result<()> {
        if let Some(existing) = self.entries.get(&type_id) {
            return Err(StorageError::InvalidOwned(format!(
                "record type id {type_id} already registered as {}",
                existing.name
            )));
        }
        self.entries.insert(type_id, Registration { name, factory });
        Ok(())
    }

    /// Returns true when a factory exists for `type_id`.
    pub fn contains(&self, type_id: RecordTypeId) -> bool {
        self.entries.contains_key(&type_id)
    }

    /// Human readable name of a registered type.
    pub fn name_of(&self, type_id: RecordTypeId) -> Option<&'static str> {
        self.entries.get(&type_id).map(|reg| reg.name)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decodes a record serialized by [`serialize`].
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Box<dyn OperationRecord>> {
        let mut r = ByteReader::new(bytes);
        let type_id = r.u16()?;
        let unit_id = UnitId(r.u64()?);
        let has_page = r.bool()?;
        let file_id = r.u32()?;
        let page_index = r.u32()?;
        let registration = self
            .entries
            .get(&type_id)
            .ok_or(StorageError::UnknownRecordType(type_id))?;
        let header = RecordHeader {
            unit_id,
            page: has_page.then(|| PageKey::new(file_id, page_index)),
        };
        let record = (registration.factory)(header, &mut r)?;
        r.finish()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct FillByte {
        header: RecordHeader,
        offset: u32,
        old: u8,
        new: u8,
    }

    impl OperationRecord for FillByte {
        fn record_type(&self) -> RecordTypeId {
            900
        }
        fn header(&self) -> &RecordHeader {
            &self.header
        }
        fn header_mut(&mut self) -> &mut RecordHeader {
            &mut self.header
        }
        fn payload_size(&self) -> usize {
            6
        }
        fn encode_payload(&self, w: &mut ByteWriter<'_>) {
            w.put_u32(self.offset);
            w.put_u8(self.old);
            w.put_u8(self.new);
        }
        fn redo(&self, page: &mut [u8]) -> Result<()> {
            page[self.offset as usize] = self.new;
            Ok(())
        }
        fn undo(&self, page: &mut [u8]) -> Result<()> {
            page[self.offset as usize] = self.old;
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn decode_fill(header: RecordHeader, r: &mut ByteReader<'_>) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(FillByte {
            header,
            offset: r.u32()?,
            old: r.u8()?,
            new: r.u8()?,
        }))
    }

    #[test]
    fn collaborator_type_roundtrips_through_registry() -> Result<()> {
        let mut registry = RecordRegistry::empty();
        registry.register(900, "test.fill_byte", decode_fill)?;
        let record = FillByte {
            header: RecordHeader {
                unit_id: UnitId(12),
                page: Some(PageKey::new(4, 9)),
            },
            offset: 77,
            old: 1,
            new: 2,
        };
        let bytes = serialize(&record);
        assert_eq!(bytes.len(), serialized_size(&record));
        let decoded = registry.deserialize(&bytes)?;
        assert_eq!(decoded.unit_id(), UnitId(12));
        assert_eq!(decoded.page(), Some(PageKey::new(4, 9)));
        let decoded = decoded.as_any().downcast_ref::<FillByte>().unwrap();
        assert_eq!(decoded, &record);
        Ok(())
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = RecordRegistry::empty();
        registry.register(900, "a", decode_fill).unwrap();
        assert!(registry.register(900, "b", decode_fill).is_err());
    }

    #[test]
    fn unknown_type_is_fatal() {
        let registry = RecordRegistry::builtin();
        let record = FillByte {
            header: RecordHeader::control(UnitId(1)),
            offset: 0,
            old: 0,
            new: 0,
        };
        let err = registry.deserialize(&serialize(&record)).unwrap_err();
        assert!(matches!(err, StorageError::UnknownRecordType(900)));
    }

    #[test]
    fn trailing_bytes_are_corruption() -> Result<()> {
        let mut registry = RecordRegistry::empty();
        registry.register(900, "test.fill_byte", decode_fill)?;
        let record = FillByte {
            header: RecordHeader::for_page(PageKey::new(0, 0)),
            offset: 1,
            old: 0,
            new: 1,
        };
        let mut bytes = serialize(&record);
        bytes.push(0);
        assert!(registry.deserialize(&bytes).is_err());
        Ok(())
    }
}
