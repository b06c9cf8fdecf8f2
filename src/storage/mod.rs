#![forbid(unsafe_code)]

//! Durable storage: data files, buffer pool, WAL, double-write log and
//! free-space maps wired together with checkpoint and crash recovery.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::atomic::AtomicOperationsManager;
use crate::dwl::{DoubleWrite, DoubleWriteLog, NoDoubleWrite};
use crate::fsm::FreeSpaceMap;
use crate::ops::control::FullCheckpoint;
use crate::primitives::io::{segment_path, StdFileIo};
use crate::primitives::pager::{BufferPool, DataFiles};
use crate::primitives::wal::{RecordRegistry, WriteAheadLog};
use crate::types::page::seal_page;
use crate::types::{Lsn, PageKey, Result};

mod health;
mod options;
mod recovery;

pub use health::StorageHealth;
pub use options::{RecoveryMode, StorageOptions};
pub use recovery::RecoveryReport;

/// File extension of free-space map files.
pub const FSM_EXTENSION: &str = "fsm";
/// Longest run of pages written as one double-write entry.
const MAX_PAGES_PER_ENTRY: usize = 64;

/// Outcome of one checkpoint.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CheckpointReport {
    /// Pages written to the data files
    pub pages_written: usize,
    /// WAL segments removed afterwards
    pub wal_segments_removed: usize,
    /// LSN of the `FullCheckpoint` record
    pub checkpoint_lsn: Option<Lsn>,
}

/// One storage instance. Every component is owned here and passed down
/// explicitly, so several instances can live in one process.
pub struct DurableStorage {
    dir: PathBuf,
    name: String,
    options: StorageOptions,
    health: Arc<StorageHealth>,
    wal: Arc<WriteAheadLog>,
    dwl: Box<dyn DoubleWrite>,
    pool: Arc<BufferPool>,
    atomic: AtomicOperationsManager,
    free_space_maps: Mutex<HashMap<u32, Arc<FreeSpaceMap>>>,
    checkpoint_lock: Mutex<()>,
    last_recovery: RecoveryReport,
}

impl DurableStorage {
    /// Opens (or creates) the storage `name` in `dir` with the built-in
    /// record types, running crash recovery first.
    pub fn open(dir: impl AsRef<Path>, name: &str, options: StorageOptions) -> Result<Self> {
        Self::open_with_registry(dir, name, options, RecordRegistry::builtin())
    }

    /// Like [`DurableStorage::open`] with a caller-extended record registry.
    pub fn open_with_registry(
        dir: impl AsRef<Path>,
        name: &str,
        options: StorageOptions,
        registry: RecordRegistry,
    ) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let health = Arc::new(StorageHealth::new());
        let files = DataFiles::new(&dir, name, options.page_size)?;
        let mut report = RecoveryReport::default();

        // Leftover double-write segments are replayed even when double-write
        // is now disabled, then dropped once the repaired pages are synced.
        let leftover = DoubleWriteLog::open(&dir, name, options.double_write_options())?;
        recovery::restore_torn_pages(&leftover, &files, &mut report)?;
        leftover.truncate()?;
        drop(leftover);

        let dwl: Box<dyn DoubleWrite> = if options.double_write {
            Box::new(DoubleWriteLog::open(&dir, name, options.double_write_options())?)
        } else {
            Box::new(NoDoubleWrite)
        };
        let wal = Arc::new(WriteAheadLog::open(
            &dir,
            name,
            Arc::new(registry),
            options.wal_options(),
        )?);
        let pool = Arc::new(BufferPool::new(files, Arc::clone(&health)));
        recovery::replay(&wal, &pool, &health, options.recovery_mode, &mut report)?;

        let atomic = AtomicOperationsManager::new(Arc::clone(&wal), Arc::clone(&health), &options);
        let mut storage = Self {
            dir,
            name: name.to_owned(),
            options,
            health,
            wal,
            dwl,
            pool,
            atomic,
            free_space_maps: Mutex::new(HashMap::new()),
            checkpoint_lock: Mutex::new(()),
            last_recovery: RecoveryReport::default(),
        };
        if !storage.health.is_read_only() {
            storage.checkpoint()?;
        }
        report.read_only = storage.health.is_read_only();
        info!(
            name,
            restored = report.pages_restored,
            redone = report.records_redone,
            corrupt_segments = report.corrupt_segments,
            read_only = report.read_only,
            "storage.recovery.done"
        );
        storage.last_recovery = report;
        Ok(storage)
    }

    /// Writes every dirty page to the data files.
    ///
    /// The WAL is flushed before any page leaves memory and every run of
    /// pages goes through the double-write log before its main-file write.
    /// Afterwards the double-write log is truncated and WAL segments older
    /// than the checkpoint are removed. Must not be called while the calling
    /// thread holds a page handle.
    pub fn checkpoint(&self) -> Result<CheckpointReport> {
        let _exclusive = self.checkpoint_lock.lock();
        self.health.check_writable()?;
        let captured = self.wal.end();
        let keys = self.pool.take_flush_set();
        let result = self.write_pages(&keys);
        if result.is_err() {
            self.pool.mark_dirty(keys.iter().copied());
        }
        let pages_written = result?;

        let checkpoint_lsn = self
            .wal
            .log(&FullCheckpoint::new(captured.unwrap_or(Lsn::ZERO)))?;
        self.wal.flush()?;
        self.dwl.truncate()?;
        for map in self.free_space_maps.lock().values() {
            map.flush()?;
        }
        let wal_segments_removed = match captured {
            Some(end) => self.wal.cut_till(end)?,
            None => 0,
        };
        self.pool.evict_clean();
        info!(
            pages = pages_written,
            wal_segments_removed,
            lsn = %checkpoint_lsn,
            "storage.checkpoint"
        );
        Ok(CheckpointReport {
            pages_written,
            wal_segments_removed,
            checkpoint_lsn: Some(checkpoint_lsn),
        })
    }

    fn write_pages(&self, keys: &[PageKey]) -> Result<usize> {
        let mut images: Vec<(PageKey, Box<[u8]>)> = keys
            .iter()
            .filter_map(|&key| self.pool.snapshot(key).map(|image| (key, image)))
            .collect();
        // WAL before page: the copies may hold changes logged up to now.
        self.wal.flush()?;
        for (key, image) in &mut images {
            seal_page(image, *key)?;
        }
        for run in contiguous_runs(&images) {
            let first = run[0].0;
            let pages: Vec<&[u8]> = run.iter().map(|(_, image)| &image[..]).collect();
            if self.dwl.write(first.file_id, first.page_index, &pages)? {
                debug!(file_id = first.file_id, "storage.checkpoint.double_write_full");
            }
        }
        for (key, image) in &images {
            self.pool.files().write_page(*key, image)?;
        }
        let mut file_ids: Vec<u32> = images.iter().map(|(key, _)| key.file_id).collect();
        file_ids.dedup();
        self.pool.files().sync(file_ids)?;
        Ok(images.len())
    }

    /// Free-space map of data file `file_id`, opened on first use and
    /// flushed by every checkpoint.
    pub fn free_space_map(&self, file_id: u32) -> Result<Arc<FreeSpaceMap>> {
        let mut maps = self.free_space_maps.lock();
        if let Some(map) = maps.get(&file_id) {
            return Ok(Arc::clone(map));
        }
        let path = segment_path(&self.dir, &self.name, u64::from(file_id), FSM_EXTENSION);
        let map = Arc::new(FreeSpaceMap::open(
            Arc::new(StdFileIo::open(path)?),
            self.options.page_size,
        )?);
        maps.insert(file_id, Arc::clone(&map));
        Ok(map)
    }

    /// Checkpoints (unless read-only) and closes the logs.
    pub fn close(&self) -> Result<()> {
        if !self.health.is_read_only() {
            self.checkpoint()?;
        }
        self.wal.close()?;
        self.dwl.close()?;
        info!(name = %self.name, "storage.close");
        Ok(())
    }

    /// Atomic operation manager bound to this storage.
    pub fn atomic(&self) -> &AtomicOperationsManager {
        &self.atomic
    }

    /// Buffer pool serving the data files.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// The write-ahead log.
    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    /// The double-write log, or a no-op when disabled.
    pub fn double_write(&self) -> &dyn DoubleWrite {
        self.dwl.as_ref()
    }

    /// Read-only flag and reason.
    pub fn health(&self) -> &Arc<StorageHealth> {
        &self.health
    }

    /// Options the storage was opened with.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Report of the recovery run by the last open.
    pub fn last_recovery(&self) -> &RecoveryReport {
        &self.last_recovery
    }
}

impl fmt::Debug for DurableStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableStorage")
            .field("dir", &self.dir)
            .field("name", &self.name)
            .field("read_only", &self.health.is_read_only())
            .finish()
    }
}

/// Splits key-sorted images into runs of consecutive pages of one file.
fn contiguous_runs(images: &[(PageKey, Box<[u8]>)]) -> Vec<&[(PageKey, Box<[u8]>)]> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=images.len() {
        let split = i == images.len()
            || i - start == MAX_PAGES_PER_ENTRY
            || images[i - 1].0.successor() != Some(images[i].0);
        if split {
            runs.push(&images[start..i]);
            start = i;
        }
    }
    runs
}
