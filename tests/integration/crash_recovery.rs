#![allow(missing_docs)]

use penumbra::dwl::{DoubleWrite, DoubleWriteLog};
use penumbra::ops::cluster::{AppendRecord, ClusterInit, ClusterView};
use penumbra::primitives::pager::{DataFiles, PagePool};
use penumbra::types::page::{check_page, PageCheck};
use penumbra::{DurableStorage, PageKey, RecoveryMode, Result, StorageError, StorageOptions};
use tempfile::tempdir;

const NAME: &str = "store";
const KEY: PageKey = PageKey::new(1, 3);

fn options(mode: RecoveryMode) -> StorageOptions {
    StorageOptions::default()
        .page_size(4096)
        .wal_segment_size(64 * 1024)
        .recovery_mode(mode)
}

/// Formats `KEY` and stores one record in it as a committed unit.
fn write_committed(storage: &DurableStorage, content: &[u8]) -> Result<()> {
    let atomic = storage.atomic();
    let mut op = atomic.begin();
    let mut page = storage.pool().acquire_exclusive(KEY)?;
    atomic.apply(&mut op, &mut page, Box::new(ClusterInit::new(KEY)))?;
    let append = AppendRecord::new(KEY, &page, 1, content.to_vec())?;
    atomic.apply(&mut op, &mut page, Box::new(append))?;
    storage.pool().release(page, true);
    atomic.commit(&mut op)?;
    Ok(())
}

/// Appends one record to `KEY` and flushes the log without committing.
fn write_uncommitted(storage: &DurableStorage, content: &[u8]) -> Result<()> {
    let atomic = storage.atomic();
    let mut op = atomic.begin();
    let mut page = storage.pool().acquire_exclusive(KEY)?;
    let append = AppendRecord::new(KEY, &page, 2, content.to_vec())?;
    atomic.apply(&mut op, &mut page, Box::new(append))?;
    storage.pool().release(page, true);
    storage.wal().flush()?;
    Ok(())
}

fn slots_on_disk(dir: &std::path::Path) -> Result<Vec<Vec<u8>>> {
    let image = DataFiles::new(dir, NAME, 4096)?.read_page(KEY)?;
    assert_eq!(check_page(&image, KEY), PageCheck::Valid);
    let view = ClusterView::new(&image)?;
    (0..view.slot_count()?)
        .map(|slot| {
            view.record(slot)
                .map(|record| record.map(|(_, content)| content.to_vec()).unwrap_or_default())
        })
        .collect()
}

#[test]
fn committed_unit_is_replayed_after_crash() -> Result<()> {
    let dir = tempdir()?;
    {
        let storage = DurableStorage::open(dir.path(), NAME, options(RecoveryMode::RedoCommitted))?;
        write_committed(&storage, b"survives")?;
        // Dropped without checkpoint: the page only exists in the log.
    }
    let on_disk = DataFiles::new(dir.path(), NAME, 4096)?.read_page(KEY)?;
    assert_eq!(check_page(&on_disk, KEY), PageCheck::Fresh);

    let storage = DurableStorage::open(dir.path(), NAME, options(RecoveryMode::RedoCommitted))?;
    let report = storage.last_recovery();
    assert_eq!(report.records_redone, 2);
    assert!(!report.read_only);
    assert!(report.failed_pages.is_empty());
    drop(storage);
    assert_eq!(slots_on_disk(dir.path())?, vec![b"survives".to_vec()]);

    // A second recovery finds everything applied already.
    let storage = DurableStorage::open(dir.path(), NAME, options(RecoveryMode::RedoCommitted))?;
    assert_eq!(storage.last_recovery().records_redone, 0);
    Ok(())
}

#[test]
fn uncommitted_unit_is_skipped_only_when_commits_are_tracked() -> Result<()> {
    for (mode, expected) in [
        (RecoveryMode::RedoCommitted, vec![b"base".to_vec()]),
        (RecoveryMode::RedoAll, vec![b"base".to_vec(), b"pending".to_vec()]),
    ] {
        let dir = tempdir()?;
        {
            let storage = DurableStorage::open(dir.path(), NAME, options(mode))?;
            write_committed(&storage, b"base")?;
            write_uncommitted(&storage, b"pending")?;
        }
        let storage = DurableStorage::open(dir.path(), NAME, options(mode))?;
        let skipped = storage.last_recovery().records_uncommitted;
        drop(storage);
        assert_eq!(skipped, u64::from(mode == RecoveryMode::RedoCommitted), "{mode:?}");
        assert_eq!(slots_on_disk(dir.path())?, expected, "{mode:?}");
    }
    Ok(())
}

#[test]
fn torn_page_is_repaired_from_double_write() -> Result<()> {
    let dir = tempdir()?;
    {
        let storage = DurableStorage::open(dir.path(), NAME, options(RecoveryMode::RedoCommitted))?;
        write_committed(&storage, b"intact")?;
        storage.close()?;
    }
    let files = DataFiles::new(dir.path(), NAME, 4096)?;
    let good = files.read_page(KEY)?;
    assert_eq!(check_page(&good, KEY), PageCheck::Valid);

    // Crash in the middle of a checkpoint: the image reached the
    // double-write log, the data file write was torn.
    {
        let dwl_options = options(RecoveryMode::RedoCommitted).double_write_options();
        let dwl = DoubleWriteLog::open(dir.path(), NAME, dwl_options)?;
        dwl.write(KEY.file_id, KEY.page_index, &[&good])?;
        dwl.close()?;
    }
    let mut torn = good.to_vec();
    torn[2048..].fill(0xA5);
    files.write_page(KEY, &torn)?;
    files.sync_all()?;
    drop(files);

    let storage = DurableStorage::open(dir.path(), NAME, options(RecoveryMode::RedoCommitted))?;
    let report = storage.last_recovery();
    assert_eq!(report.pages_restored, 1);
    assert!(!report.read_only);
    assert_eq!(storage.double_write().stats().log_size, 0);
    drop(storage);
    assert_eq!(slots_on_disk(dir.path())?, vec![b"intact".to_vec()]);
    Ok(())
}

#[test]
fn corrupt_page_without_double_write_copy_makes_storage_read_only() -> Result<()> {
    let dir = tempdir()?;
    {
        let storage = DurableStorage::open(dir.path(), NAME, options(RecoveryMode::RedoCommitted))?;
        write_committed(&storage, b"fragile")?;
        storage.close()?;
    }
    let files = DataFiles::new(dir.path(), NAME, 4096)?;
    let mut damaged = files.read_page(KEY)?.to_vec();
    damaged[100] ^= 0xFF;
    files.write_page(KEY, &damaged)?;
    files.sync_all()?;
    drop(files);

    let storage = DurableStorage::open(dir.path(), NAME, options(RecoveryMode::RedoCommitted))?;
    let report = storage.last_recovery();
    assert!(report.read_only);
    assert_eq!(report.failed_pages, vec![KEY]);
    assert!(storage.health().is_read_only());

    assert!(matches!(
        storage.pool().acquire_exclusive(KEY),
        Err(StorageError::PageIntegrity { .. })
    ));
    let mut op = storage.atomic().begin();
    let mut other = storage.pool().acquire_exclusive(PageKey::new(1, 40))?;
    let refused = storage
        .atomic()
        .apply(&mut op, &mut other, Box::new(ClusterInit::new(PageKey::new(1, 40))));
    storage.pool().release(other, false);
    assert!(matches!(refused, Err(StorageError::ReadOnly(_))));
    assert!(matches!(storage.checkpoint(), Err(StorageError::ReadOnly(_))));
    Ok(())
}
