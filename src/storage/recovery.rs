//! Crash recovery: double-write repair of torn pages, then WAL replay.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::{RecoveryMode, StorageHealth};
use crate::dwl::DoubleWrite;
use crate::ops::control::AtomicUnitEnd;
use crate::primitives::pager::{BufferPool, DataFiles, PagePool};
use crate::primitives::wal::{OperationRecord, WriteAheadLog};
use crate::types::page::{check_page, page_lsn, PageCheck};
use crate::types::{Lsn, PageKey, Result, StorageError, UnitId};

/// What crash recovery found and did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    /// Pages rewritten from their double-write image
    pub pages_restored: usize,
    /// Records read from the WAL
    pub records_scanned: u64,
    /// Page records redone
    pub records_redone: u64,
    /// Page records whose effect the page already held
    pub records_already_applied: u64,
    /// Page records of units without a commit marker
    pub records_uncommitted: u64,
    /// Segments that reported corruption
    pub corrupt_segments: usize,
    /// Pages that failed validation or replay
    pub failed_pages: Vec<PageKey>,
    /// Last LSN seen in the log
    pub last_lsn: Option<Lsn>,
    /// Whether the storage ended up read-only
    pub read_only: bool,
}

/// Rewrites main-file pages that are torn or older than their latest
/// double-write image. The repaired pages are synced before returning.
pub(crate) fn restore_torn_pages(
    dwl: &dyn DoubleWrite,
    files: &DataFiles,
    report: &mut RecoveryReport,
) -> Result<()> {
    dwl.restore_mode_on()?;
    let mut touched = HashSet::new();
    for key in dwl.restored_pages() {
        let Some(image) = dwl.load_page(key)? else {
            continue;
        };
        if check_page(&image, key) != PageCheck::Valid {
            warn!(page = %key, "storage.recovery.bad_double_write_image");
            continue;
        }
        let on_disk = files.read_page(key)?;
        let stale = match check_page(&on_disk, key) {
            PageCheck::Invalid(_) | PageCheck::Fresh => true,
            PageCheck::Valid => page_lsn(&on_disk) < page_lsn(&image),
        };
        if stale {
            files.write_page(key, &image)?;
            touched.insert(key.file_id);
            report.pages_restored += 1;
            warn!(page = %key, "storage.recovery.page_restored");
        }
    }
    files.sync(touched)?;
    dwl.restore_mode_off();
    Ok(())
}

fn committed_units(wal: &WriteAheadLog) -> Result<HashSet<UnitId>> {
    let mut committed = HashSet::new();
    for item in wal.cursor(Lsn::ZERO) {
        let record = match item {
            Ok((_, record)) => record,
            Err(StorageError::SegmentCorrupt { .. }) => continue,
            Err(err) => return Err(err),
        };
        if let Some(end) = record.as_any().downcast_ref::<AtomicUnitEnd>() {
            committed.insert(end.unit_id());
        }
    }
    Ok(committed)
}

/// Redoes logged page records in LSN order. A record is applied only when
/// the page LSN is below the record LSN, so replaying twice is harmless.
pub(crate) fn replay(
    wal: &WriteAheadLog,
    pool: &BufferPool,
    health: &StorageHealth,
    mode: RecoveryMode,
    report: &mut RecoveryReport,
) -> Result<()> {
    let committed = match mode {
        RecoveryMode::RedoCommitted => Some(committed_units(wal)?),
        RecoveryMode::RedoAll => None,
    };
    let mut failed: HashSet<PageKey> = HashSet::new();
    for item in wal.cursor(Lsn::ZERO) {
        let (lsn, record) = match item {
            Ok(entry) => entry,
            Err(err @ StorageError::SegmentCorrupt { .. }) => {
                warn!(error = %err, "storage.recovery.corrupt_segment");
                report.corrupt_segments += 1;
                continue;
            }
            Err(err) => return Err(err),
        };
        report.records_scanned += 1;
        report.last_lsn = Some(lsn);
        let Some(key) = record.page() else {
            continue;
        };
        if let Some(committed) = &committed {
            if !committed.contains(&record.unit_id()) {
                report.records_uncommitted += 1;
                continue;
            }
        }
        if failed.contains(&key) {
            continue;
        }
        let mut page = match pool.acquire_exclusive(key) {
            Ok(page) => page,
            Err(StorageError::PageIntegrity { .. }) => {
                failed.insert(key);
                report.failed_pages.push(key);
                continue;
            }
            Err(err) => return Err(err),
        };
        if page.lsn() >= lsn {
            report.records_already_applied += 1;
            pool.release(page, false);
            continue;
        }
        match record.redo(&mut page) {
            Ok(()) => {
                page.set_lsn(lsn);
                pool.release(page, true);
                report.records_redone += 1;
            }
            Err(err) => {
                pool.release(page, false);
                health.mark_read_only(format!("replay of {lsn} on page {key} failed: {err}"));
                failed.insert(key);
                report.failed_pages.push(key);
            }
        }
    }
    debug!(
        scanned = report.records_scanned,
        redone = report.records_redone,
        "storage.recovery.replay"
    );
    if report.records_uncommitted > 0 {
        info!(skipped = report.records_uncommitted, "storage.recovery.uncommitted_units");
    }
    Ok(())
}
