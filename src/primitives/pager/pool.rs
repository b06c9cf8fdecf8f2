use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{lock_api::ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use tracing::{debug, trace};

use super::files::DataFiles;
use crate::storage::StorageHealth;
use crate::types::page::{check_page, page_lsn, set_page_lsn, PageCheck};
use crate::types::{Lsn, PageKey, Result, StorageError};

type PageBuf = Arc<RwLock<Box<[u8]>>>;

/// Exclusive access to one in-memory page. Dropping the handle without
/// [`PagePool::release`] unlocks the page but leaves it marked in use until
/// the next checkpoint picks it up.
pub struct PageHandle {
    key: PageKey,
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
}

impl PageHandle {
    /// Address of the held page.
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// LSN of the last record applied to the page.
    pub fn lsn(&self) -> Lsn {
        page_lsn(&self.guard)
    }

    /// Stamps the LSN of the record just applied.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        set_page_lsn(&mut self.guard, lsn);
    }
}

impl Deref for PageHandle {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for PageHandle {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("key", &self.key)
            .field("lsn", &self.lsn())
            .finish()
    }
}

/// Source of exclusively locked page buffers.
pub trait PagePool: Send + Sync {
    fn page_size(&self) -> usize;
    /// Locks `key` for mutation, loading it first if needed.
    fn acquire_exclusive(&self, key: PageKey) -> Result<PageHandle>;
    /// Unlocks the page; `mark_dirty` schedules it for the next checkpoint.
    fn release(&self, handle: PageHandle, mark_dirty: bool);
}

#[derive(Default)]
struct Tracking {
    dirty: BTreeSet<PageKey>,
    in_flight: BTreeSet<PageKey>,
}

/// Counters of the buffer pool.
#[derive(Clone, Debug, Default)]
pub struct PoolStats {
    /// Acquisitions served from memory
    pub hits: u64,
    /// Acquisitions that read the data file
    pub misses: u64,
    /// Pages held in memory
    pub frames: usize,
    /// Pages waiting for a checkpoint
    pub dirty: usize,
}

/// Page pool backed by [`DataFiles`]. Every page loaded from disk is
/// checksum-verified; a failing page switches the storage read-only.
///
/// Pages stay in memory until a checkpoint has written them, so the pool
/// holds at most the working set between two checkpoints.
pub struct BufferPool {
    files: DataFiles,
    health: Arc<StorageHealth>,
    frames: Mutex<HashMap<PageKey, PageBuf>>,
    tracking: Mutex<Tracking>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    /// Empty pool over `files`; integrity failures are reported to `health`.
    pub fn new(files: DataFiles, health: Arc<StorageHealth>) -> Self {
        Self {
            files,
            health,
            frames: Mutex::new(HashMap::new()),
            tracking: Mutex::new(Tracking::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Backing data files.
    pub fn files(&self) -> &DataFiles {
        &self.files
    }

    /// Read-only flag shared with the storage.
    pub fn health(&self) -> &Arc<StorageHealth> {
        &self.health
    }

    fn frame(&self, key: PageKey) -> Result<PageBuf> {
        let mut frames = self.frames.lock();
        if let Some(buf) = frames.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(buf));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let image = self.files.read_page(key)?;
        if let PageCheck::Invalid(reason) = check_page(&image, key) {
            self.health
                .mark_read_only(format!("page {key} failed integrity check: {reason}"));
            return Err(StorageError::PageIntegrity {
                file_id: key.file_id,
                page_index: key.page_index,
                reason,
            });
        }
        trace!(page = %key, "pager.pool.load");
        let buf = Arc::new(RwLock::new(image));
        frames.insert(key, Arc::clone(&buf));
        Ok(buf)
    }

    /// Drains the pages a checkpoint must write: every dirty page plus every
    /// page currently held for mutation.
    pub fn take_flush_set(&self) -> Vec<PageKey> {
        let mut tracking = self.tracking.lock();
        let mut keys = std::mem::take(&mut tracking.dirty);
        keys.extend(std::mem::take(&mut tracking.in_flight));
        keys.into_iter().collect()
    }

    /// Copy of the in-memory image of `key`, taken under its read lock.
    pub fn snapshot(&self, key: PageKey) -> Option<Box<[u8]>> {
        let buf = self.frames.lock().get(&key).cloned()?;
        let image = buf.read().clone();
        Some(image)
    }

    /// Schedules pages for the next checkpoint again.
    pub fn mark_dirty(&self, keys: impl IntoIterator<Item = PageKey>) {
        self.tracking.lock().dirty.extend(keys);
    }

    /// Number of pages waiting for a checkpoint.
    pub fn dirty_pages(&self) -> usize {
        self.tracking.lock().dirty.len()
    }

    /// Drops clean pages nobody holds. Only safe once every page taken by
    /// [`BufferPool::take_flush_set`] has reached the data file.
    pub(crate) fn evict_clean(&self) -> usize {
        let mut frames = self.frames.lock();
        let tracking = self.tracking.lock();
        let before = frames.len();
        frames.retain(|key, buf| {
            Arc::strong_count(buf) > 1
                || tracking.dirty.contains(key)
                || tracking.in_flight.contains(key)
        });
        let evicted = before - frames.len();
        if evicted > 0 {
            debug!(evicted, resident = frames.len(), "pager.pool.evict");
        }
        evicted
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            frames: self.frames.lock().len(),
            dirty: self.dirty_pages(),
        }
    }
}

impl PagePool for BufferPool {
    fn page_size(&self) -> usize {
        self.files.page_size()
    }

    fn acquire_exclusive(&self, key: PageKey) -> Result<PageHandle> {
        let guard = self.frame(key)?.write_arc();
        self.tracking.lock().in_flight.insert(key);
        Ok(PageHandle { key, guard })
    }

    fn release(&self, handle: PageHandle, mark_dirty: bool) {
        let mut tracking = self.tracking.lock();
        tracking.in_flight.remove(&handle.key);
        if mark_dirty {
            tracking.dirty.insert(handle.key);
        }
        drop(tracking);
        drop(handle);
    }
}
