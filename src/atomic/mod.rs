#![forbid(unsafe_code)]

//! Atomic operations: groups of operation records under one unit id.
//!
//! Records are applied optimistically: `redo` runs on the exclusively held
//! page and the record is appended to the WAL right away. Rollback replays
//! `undo` in reverse order from memory and writes nothing to the WAL.
//! Page locking is the caller's job; two operations touching the same page
//! are serialized by that page's exclusive lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::ops::control::{AtomicUnitEnd, AtomicUnitStart};
use crate::primitives::pager::{PageHandle, PagePool};
use crate::primitives::wal::{OperationRecord, WriteAheadLog};
use crate::storage::{RecoveryMode, StorageHealth, StorageOptions};
use crate::types::{Lsn, PageKey, Result, StorageError, UnitId};

/// Lifecycle of an [`AtomicOperation`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperationState {
    /// Records may still be applied.
    Active,
    /// Every record is in the log; the unit is final.
    Committed,
    /// Every record was undone in memory.
    RolledBack,
}

struct AppliedRecord {
    lsn: Lsn,
    previous_lsn: Lsn,
    record: Box<dyn OperationRecord>,
}

/// One unit of records that becomes durable, or is undone, as a whole.
pub struct AtomicOperation {
    unit_id: UnitId,
    state: OperationState,
    started: bool,
    records: Vec<AppliedRecord>,
}

impl AtomicOperation {
    /// Unit id shared by every record of the operation.
    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OperationState {
        self.state
    }

    /// Number of records applied so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true before the first record is applied.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// LSN of the most recent record of the unit.
    pub fn last_lsn(&self) -> Option<Lsn> {
        self.records.last().map(|applied| applied.lsn)
    }

    /// Pages changed by the unit, in first-touch order.
    pub fn touched_pages(&self) -> Vec<PageKey> {
        let mut pages = Vec::new();
        for page in self.records.iter().filter_map(|applied| applied.record.page()) {
            if !pages.contains(&page) {
                pages.push(page);
            }
        }
        pages
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != OperationState::Active {
            return Err(StorageError::Invalid("atomic operation is no longer active"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AtomicOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicOperation")
            .field("unit_id", &self.unit_id)
            .field("state", &self.state)
            .field("records", &self.records.len())
            .finish()
    }
}

/// Hands out operation units and logs their records.
pub struct AtomicOperationsManager {
    wal: Arc<WriteAheadLog>,
    health: Arc<StorageHealth>,
    mode: RecoveryMode,
    sync_on_commit: bool,
    next_unit: AtomicU64,
}

impl AtomicOperationsManager {
    /// Unit ids continue after the highest one found in `wal`.
    pub fn new(wal: Arc<WriteAheadLog>, health: Arc<StorageHealth>, options: &StorageOptions) -> Self {
        let next_unit = wal.max_unit_id().0 + 1;
        Self {
            wal,
            health,
            mode: options.recovery_mode,
            sync_on_commit: options.wal_sync_on_commit,
            next_unit: AtomicU64::new(next_unit),
        }
    }

    /// Starts a new unit. Nothing is logged until its first record.
    pub fn begin(&self) -> AtomicOperation {
        let unit_id = UnitId(self.next_unit.fetch_add(1, Ordering::Relaxed));
        debug!(unit = %unit_id, "atomic.begin");
        AtomicOperation {
            unit_id,
            state: OperationState::Active,
            started: false,
            records: Vec::new(),
        }
    }

    fn ensure_started(&self, op: &mut AtomicOperation) -> Result<()> {
        if !op.started {
            self.wal.log(&AtomicUnitStart::new(op.unit_id))?;
            op.started = true;
        }
        Ok(())
    }

    /// Applies `record` to `page` and logs it under the unit. On a failed
    /// append the page change is undone before the error is returned.
    pub fn apply(
        &self,
        op: &mut AtomicOperation,
        page: &mut PageHandle,
        mut record: Box<dyn OperationRecord>,
    ) -> Result<Lsn> {
        op.ensure_active()?;
        self.health.check_writable()?;
        if record.page() != Some(page.key()) {
            return Err(StorageError::Invalid("record targets a different page"));
        }
        record.header_mut().unit_id = op.unit_id;
        self.ensure_started(op)?;
        record.redo(page)?;
        let lsn = match self.wal.log(record.as_ref()) {
            Ok(lsn) => lsn,
            Err(err) => {
                if let Err(undo_err) = record.undo(page) {
                    warn!(page = %page.key(), error = %undo_err, "atomic.apply.undo_failed");
                    self.health
                        .mark_read_only(format!("page {} left half-applied: {undo_err}", page.key()));
                }
                return Err(err);
            }
        };
        let previous_lsn = page.lsn();
        page.set_lsn(lsn);
        debug!(
            unit = %op.unit_id,
            page = %page.key(),
            lsn = %lsn,
            record_type = record.record_type(),
            "atomic.apply"
        );
        op.records.push(AppliedRecord {
            lsn,
            previous_lsn,
            record,
        });
        Ok(lsn)
    }

    /// Logs a record that targets no page under the unit.
    pub fn log(&self, op: &mut AtomicOperation, mut record: Box<dyn OperationRecord>) -> Result<Lsn> {
        op.ensure_active()?;
        self.health.check_writable()?;
        if record.page().is_some() {
            return Err(StorageError::Invalid("page records must go through apply"));
        }
        record.header_mut().unit_id = op.unit_id;
        self.ensure_started(op)?;
        let lsn = self.wal.log(record.as_ref())?;
        op.records.push(AppliedRecord {
            lsn,
            previous_lsn: Lsn::ZERO,
            record,
        });
        Ok(lsn)
    }

    /// Finishes the unit. Returns the last LSN written for it, or `None`
    /// when the unit logged nothing.
    pub fn commit(&self, op: &mut AtomicOperation) -> Result<Option<Lsn>> {
        op.ensure_active()?;
        self.health.check_writable()?;
        if op.records.iter().any(|applied| applied.lsn.is_zero()) {
            return Err(StorageError::Invalid("atomic operation holds an unlogged record"));
        }
        let mut last = op.last_lsn();
        if op.started {
            if self.mode == RecoveryMode::RedoCommitted {
                last = Some(self.wal.log(&AtomicUnitEnd::new(op.unit_id))?);
            }
            if self.sync_on_commit {
                self.wal.flush()?;
            }
        }
        op.state = OperationState::Committed;
        debug!(unit = %op.unit_id, records = op.records.len(), "atomic.commit");
        Ok(last)
    }

    /// Undoes every page record of the unit in reverse order, restoring each
    /// page's previous LSN. Nothing is logged, so this also works on a
    /// read-only storage. The caller must not hold any of the unit's pages.
    pub fn rollback(&self, op: &mut AtomicOperation, pool: &dyn PagePool) -> Result<()> {
        op.ensure_active()?;
        for applied in op.records.iter().rev() {
            let Some(key) = applied.record.page() else {
                continue;
            };
            let mut page = pool.acquire_exclusive(key)?;
            let undone = applied.record.undo(&mut page);
            if undone.is_ok() {
                page.set_lsn(applied.previous_lsn);
            }
            pool.release(page, true);
            undone?;
        }
        op.state = OperationState::RolledBack;
        debug!(unit = %op.unit_id, records = op.records.len(), "atomic.rollback");
        Ok(())
    }

    /// Replay policy the commit markers are written for.
    pub fn recovery_mode(&self) -> RecoveryMode {
        self.mode
    }

    /// Log the records are appended to.
    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }
}
