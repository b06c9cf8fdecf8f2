#![allow(missing_docs)]

use penumbra::ops::cluster::{AppendRecord, ClusterInit, ClusterView, DeleteRecord, ReplaceRecord};
use penumbra::primitives::pager::PagePool;
use penumbra::{
    DurableStorage, OperationState, PageKey, RecoveryMode, Result, StorageError, StorageOptions,
};
use tempfile::tempdir;

fn options() -> StorageOptions {
    StorageOptions::default()
        .page_size(4096)
        .wal_segment_size(64 * 1024)
        .recovery_mode(RecoveryMode::RedoCommitted)
}

const PAGES: [PageKey; 3] = [PageKey::new(1, 0), PageKey::new(1, 1), PageKey::new(1, 5)];

fn seed(storage: &DurableStorage) -> Result<()> {
    let atomic = storage.atomic();
    let mut op = atomic.begin();
    for (n, &key) in PAGES.iter().enumerate() {
        let mut page = storage.pool().acquire_exclusive(key)?;
        atomic.apply(&mut op, &mut page, Box::new(ClusterInit::new(key)))?;
        let append = AppendRecord::new(key, &page, 1, format!("page-{n}").into_bytes())?;
        atomic.apply(&mut op, &mut page, Box::new(append))?;
        storage.pool().release(page, true);
    }
    atomic.commit(&mut op)?;
    Ok(())
}

#[test]
fn rollback_restores_every_touched_page() -> Result<()> {
    let dir = tempdir()?;
    let storage = DurableStorage::open(dir.path(), "store", options())?;
    seed(&storage)?;
    let before: Vec<Box<[u8]>> = PAGES
        .iter()
        .map(|&key| storage.pool().snapshot(key).ok_or(StorageError::NotFound))
        .collect::<Result<_>>()?;

    let atomic = storage.atomic();
    let mut op = atomic.begin();
    for &key in &PAGES {
        let mut page = storage.pool().acquire_exclusive(key)?;
        let append = AppendRecord::new(key, &page, 2, b"doomed".to_vec())?;
        atomic.apply(&mut op, &mut page, Box::new(append))?;
        let replace = ReplaceRecord::capture(key, &page, 0, 3, b"rewritten".to_vec())?;
        atomic.apply(&mut op, &mut page, Box::new(replace))?;
        storage.pool().release(page, true);
    }
    let mut page = storage.pool().acquire_exclusive(PAGES[1])?;
    let delete = DeleteRecord::capture(PAGES[1], &page, 1)?;
    atomic.apply(&mut op, &mut page, Box::new(delete))?;
    storage.pool().release(page, true);
    assert_eq!(op.touched_pages(), PAGES.to_vec());
    assert_eq!(op.len(), 7);

    atomic.rollback(&mut op, storage.pool().as_ref())?;
    assert_eq!(op.state(), OperationState::RolledBack);
    for (key, expected) in PAGES.iter().zip(&before) {
        let after = storage.pool().snapshot(*key).ok_or(StorageError::NotFound)?;
        assert_eq!(&after, expected, "page {key} differs after rollback");
    }

    assert!(matches!(atomic.commit(&mut op), Err(StorageError::Invalid(_))));
    assert!(matches!(
        atomic.rollback(&mut op, storage.pool().as_ref()),
        Err(StorageError::Invalid(_))
    ));
    storage.close()?;
    Ok(())
}

#[test]
fn rolled_back_unit_stays_undone_after_restart() -> Result<()> {
    let dir = tempdir()?;
    {
        let storage = DurableStorage::open(dir.path(), "store", options())?;
        seed(&storage)?;
        storage.checkpoint()?;

        let atomic = storage.atomic();
        let mut op = atomic.begin();
        let mut page = storage.pool().acquire_exclusive(PAGES[2])?;
        let append = AppendRecord::new(PAGES[2], &page, 9, b"never".to_vec())?;
        atomic.apply(&mut op, &mut page, Box::new(append))?;
        storage.pool().release(page, true);
        atomic.rollback(&mut op, storage.pool().as_ref())?;
        storage.wal().flush()?;
        // No close: the next open replays from the log.
    }

    let storage = DurableStorage::open(dir.path(), "store", options())?;
    assert!(storage.last_recovery().records_uncommitted >= 1);
    let image = storage.pool().files().read_page(PAGES[2])?;
    let view = ClusterView::new(&image)?;
    assert_eq!(view.slot_count()?, 1);
    assert_eq!(view.record(0)?, Some((1, &b"page-2"[..])));
    Ok(())
}

#[test]
fn rollback_works_on_read_only_storage() -> Result<()> {
    let dir = tempdir()?;
    let storage = DurableStorage::open(dir.path(), "store", options())?;
    seed(&storage)?;
    let before = storage.pool().snapshot(PAGES[0]).ok_or(StorageError::NotFound)?;

    let atomic = storage.atomic();
    let mut op = atomic.begin();
    let mut page = storage.pool().acquire_exclusive(PAGES[0])?;
    let append = AppendRecord::new(PAGES[0], &page, 4, b"late".to_vec())?;
    atomic.apply(&mut op, &mut page, Box::new(append))?;
    storage.pool().release(page, true);

    storage.health().mark_read_only("disk went away");
    let mut page = storage.pool().acquire_exclusive(PAGES[0])?;
    let more = AppendRecord::new(PAGES[0], &page, 5, b"more".to_vec())?;
    let refused = atomic.apply(&mut op, &mut page, Box::new(more));
    storage.pool().release(page, false);
    assert!(matches!(refused, Err(StorageError::ReadOnly(_))));
    assert!(matches!(atomic.commit(&mut op), Err(StorageError::ReadOnly(_))));

    atomic.rollback(&mut op, storage.pool().as_ref())?;
    assert_eq!(storage.pool().snapshot(PAGES[0]).ok_or(StorageError::NotFound)?, before);
    Ok(())
}
