//! Page-less records that structure the log: unit boundaries and checkpoints.

use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::primitives::wal::record::{OperationRecord, RecordHeader, RecordTypeId};
use crate::types::{Lsn, Result, UnitId};

/// Type id of [`AtomicUnitStart`].
pub const ATOMIC_UNIT_START: RecordTypeId = 1;
/// Type id of [`AtomicUnitEnd`].
pub const ATOMIC_UNIT_END: RecordTypeId = 2;
/// Type id of [`FullCheckpoint`].
pub const FULL_CHECKPOINT: RecordTypeId = 3;

/// First record of an operation unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AtomicUnitStart {
    header: RecordHeader,
}

impl AtomicUnitStart {
    /// Start marker of `unit_id`.
    pub fn new(unit_id: UnitId) -> Self {
        Self {
            header: RecordHeader::control(unit_id),
        }
    }

    pub(crate) fn decode(
        header: RecordHeader,
        _r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self { header }))
    }
}

impl OperationRecord for AtomicUnitStart {
    record_common!(ATOMIC_UNIT_START);

    fn payload_size(&self) -> usize {
        0
    }

    fn encode_payload(&self, _w: &mut ByteWriter<'_>) {}

    fn redo(&self, _page: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn undo(&self, _page: &mut [u8]) -> Result<()> {
        Ok(())
    }
}

/// Commit marker of an operation unit. Replay in
/// [`RecoveryMode::RedoCommitted`](crate::storage::RecoveryMode) only redoes
/// units that carry one. Rollback never writes it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AtomicUnitEnd {
    header: RecordHeader,
}

impl AtomicUnitEnd {
    /// Commit marker of `unit_id`.
    pub fn new(unit_id: UnitId) -> Self {
        Self {
            header: RecordHeader::control(unit_id),
        }
    }

    pub(crate) fn decode(
        header: RecordHeader,
        _r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self { header }))
    }
}

impl OperationRecord for AtomicUnitEnd {
    record_common!(ATOMIC_UNIT_END);

    fn payload_size(&self) -> usize {
        0
    }

    fn encode_payload(&self, _w: &mut ByteWriter<'_>) {}

    fn redo(&self, _page: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn undo(&self, _page: &mut [u8]) -> Result<()> {
        Ok(())
    }
}

/// Written after a checkpoint made every change below `flushed_up_to`
/// durable in the data files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FullCheckpoint {
    header: RecordHeader,
    /// Every change logged below this LSN is in the data files.
    pub flushed_up_to: Lsn,
}

impl FullCheckpoint {
    /// Checkpoint marker covering everything below `flushed_up_to`.
    pub fn new(flushed_up_to: Lsn) -> Self {
        Self {
            header: RecordHeader::control(UnitId::default()),
            flushed_up_to,
        }
    }

    pub(crate) fn decode(
        header: RecordHeader,
        r: &mut ByteReader<'_>,
    ) -> Result<Box<dyn OperationRecord>> {
        Ok(Box::new(Self {
            header,
            flushed_up_to: r.lsn()?,
        }))
    }
}

impl OperationRecord for FullCheckpoint {
    record_common!(FULL_CHECKPOINT);

    fn payload_size(&self) -> usize {
        16
    }

    fn encode_payload(&self, w: &mut ByteWriter<'_>) {
        w.put_lsn(self.flushed_up_to);
    }

    fn redo(&self, _page: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn undo(&self, _page: &mut [u8]) -> Result<()> {
        Ok(())
    }
}
