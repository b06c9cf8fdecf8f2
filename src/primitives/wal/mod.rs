#![forbid(unsafe_code)]

//! Segmented write-ahead log of operation records.
//!
//! The log is a sequence of segment files `{name}_{id}.wal`. Exactly one
//! segment (the newest) accepts appends; all older segments are sealed and
//! read-only. Records are addressed by [`Lsn`], whose position part is the
//! byte offset of the record's frame inside its segment.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::io::{list_segments, remove_file, sync_dir};
use crate::types::{Lsn, Result, StorageError, UnitId};

pub mod record;
pub mod segment;

pub use record::{OperationRecord, RecordHeader, RecordRegistry, RecordTypeId};
pub use segment::{LogSegment, WriteResult, SEGMENT_HEADER_LEN, WAL_EXTENSION};

/// Configuration options for opening a write-ahead log.
#[derive(Clone, Debug)]
pub struct WalOptions {
    /// Maximum size of one segment file in bytes, header included.
    pub segment_size: usize,
}

impl WalOptions {
    /// Creates options with the given segment size.
    pub fn new(segment_size: usize) -> Self {
        Self { segment_size }
    }
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            segment_size: 64 * 1024 * 1024,
        }
    }
}

/// Statistics tracking WAL operations.
#[derive(Clone, Debug, Default)]
pub struct WalStats {
    /// Number of records appended since open
    pub records_appended: u64,
    /// Total frame bytes appended since open
    pub bytes_appended: u64,
    /// Number of flushes that reached the disk
    pub flushes: u64,
    /// Number of segment rotations
    pub rotations: u64,
    /// Number of segments removed by `cut_till`
    pub segments_removed: u64,
    /// Sealed segments currently retained
    pub sealed_segments: usize,
    /// Id of the segment accepting appends
    pub current_segment: u64,
}

struct WalState {
    sealed: BTreeMap<u64, LogSegment>,
    current: LogSegment,
    flushed: Lsn,
    max_unit: u64,
    poisoned: bool,
    stats: WalStats,
}

impl WalState {
    fn segment(&self, id: u64) -> Option<&LogSegment> {
        if id == self.current.id() {
            Some(&self.current)
        } else {
            self.sealed.get(&id)
        }
    }

    /// Segments with id >= `from`, in id order.
    fn segments_from(&self, from: u64) -> impl Iterator<Item = &LogSegment> {
        self.sealed
            .range(from..)
            .map(|(_, segment)| segment)
            .chain(std::iter::once(&self.current).filter(move |s| s.id() >= from))
    }
}

/// Write-ahead log over a directory of segment files.
pub struct WriteAheadLog {
    dir: PathBuf,
    name: String,
    registry: Arc<RecordRegistry>,
    options: WalOptions,
    state: Mutex<WalState>,
}

impl WriteAheadLog {
    /// Opens the log named `name` in `dir`.
    ///
    /// Every existing segment is loaded read-only and a fresh segment is
    /// created for appends, so a torn tail left by a crash is never extended.
    /// The torn tail of the newest segment is cut off the file first. Corrupt
    /// segments are kept; their damage is reported by [`WalCursor`].
    pub fn open(
        dir: impl AsRef<Path>,
        name: &str,
        registry: Arc<RecordRegistry>,
        options: WalOptions,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut sealed = BTreeMap::new();
        let mut max_unit = 0;
        let mut flushed = Lsn::ZERO;
        let listed = list_segments(&dir, name, WAL_EXTENSION)?;
        let newest = listed.last().map(|(id, _)| *id);
        let mut next_id = newest.map_or(1, |id| id + 1);
        for (id, path) in listed {
            let is_newest = Some(id) == newest;
            let mut segment = LogSegment::open_read_only(&path, id, is_newest)?;
            if is_newest {
                if !segment.has_header() {
                    // Crashed before the header was synced; reuse the id.
                    next_id = id;
                    continue;
                }
                segment.drop_torn_tail()?;
            }
            if let Some(err) = segment.corruption() {
                warn!(segment = id, error = %err, "wal.open.corrupt_segment");
            }
            max_unit = max_unit.max(segment.max_unit_id());
            if let Some(end) = segment.end() {
                flushed = end;
            }
            sealed.insert(id, segment);
        }
        let current = LogSegment::create(&dir, name, next_id, options.segment_size)?;
        sync_dir(&dir)?;
        info!(
            dir = %dir.display(),
            sealed = sealed.len(),
            segment = next_id,
            max_unit,
            "wal.open"
        );
        let stats = WalStats {
            sealed_segments: sealed.len(),
            current_segment: next_id,
            ..WalStats::default()
        };
        Ok(Self {
            dir,
            name: name.to_owned(),
            registry,
            options,
            state: Mutex::new(WalState {
                sealed,
                current,
                flushed,
                max_unit,
                poisoned: false,
                stats,
            }),
        })
    }

    /// Appends a record and returns its LSN. The record is not durable until
    /// the next [`WriteAheadLog::flush`].
    pub fn log(&self, record: &dyn OperationRecord) -> Result<Lsn> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(StorageError::WalPoisoned);
        }
        let lsn = match state.current.write(record)? {
            WriteResult::Appended(lsn) => lsn,
            WriteResult::SegmentFull => {
                if let Err(err) = self.rotate(&mut state) {
                    state.poisoned = true;
                    warn!(error = %err, "wal.rotate.failed");
                    return Err(err);
                }
                match state.current.write(record)? {
                    WriteResult::Appended(lsn) => lsn,
                    WriteResult::SegmentFull => {
                        return Err(StorageError::Invalid("record rejected by empty segment"))
                    }
                }
            }
        };
        state.max_unit = state.max_unit.max(record.unit_id().0);
        state.stats.records_appended += 1;
        state.stats.bytes_appended +=
            (segment::FRAME_HEADER_LEN + record::serialized_size(record)) as u64;
        Ok(lsn)
    }

    fn rotate(&self, state: &mut WalState) -> Result<()> {
        state.current.seal()?;
        let next_id = state.current.id() + 1;
        let fresh = LogSegment::create(&self.dir, &self.name, next_id, self.options.segment_size)?;
        sync_dir(&self.dir)?;
        let old = std::mem::replace(&mut state.current, fresh);
        if let Some(end) = old.end() {
            state.flushed = state.flushed.max(end);
        }
        debug!(sealed = old.id(), segment = next_id, records = old.len(), "wal.rotate");
        state.sealed.insert(old.id(), old);
        state.stats.rotations += 1;
        state.stats.sealed_segments = state.sealed.len();
        state.stats.current_segment = next_id;
        Ok(())
    }

    /// Reads and decodes the record stored at `lsn`.
    pub fn read(&self, lsn: Lsn) -> Result<Box<dyn OperationRecord>> {
        let state = self.state.lock();
        let segment = state.segment(lsn.segment).ok_or(StorageError::NotFound)?;
        self.registry.deserialize(segment.read(lsn)?)
    }

    /// LSN of the record following `lsn`, crossing segment boundaries.
    pub fn next(&self, lsn: Lsn) -> Option<Lsn> {
        let state = self.state.lock();
        if let Some(next) = state.segment(lsn.segment).and_then(|s| s.next(lsn)) {
            return Some(next);
        }
        let next = state
            .segments_from(lsn.segment.saturating_add(1))
            .find_map(LogSegment::begin);
        next
    }

    /// LSN of the oldest retained record.
    pub fn begin(&self) -> Option<Lsn> {
        self.state.lock().segments_from(0).find_map(LogSegment::begin)
    }

    /// LSN of the newest record.
    pub fn end(&self) -> Option<Lsn> {
        let state = self.state.lock();
        let end = state
            .current
            .end()
            .or_else(|| state.sealed.values().rev().find_map(LogSegment::end));
        end
    }

    /// Makes every appended record durable.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(StorageError::WalPoisoned);
        }
        if let Err(err) = state.current.sync() {
            state.poisoned = true;
            warn!(segment = state.current.id(), error = %err, "wal.flush.failed");
            return Err(err);
        }
        if let Some(end) = state.current.end() {
            state.flushed = state.flushed.max(end);
        }
        state.stats.flushes += 1;
        Ok(())
    }

    /// Highest LSN known to be on disk.
    pub fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed
    }

    /// Iterates records in LSN order starting at `from` (inclusive).
    pub fn cursor(&self, from: Lsn) -> WalCursor<'_> {
        WalCursor {
            wal: self,
            position: from,
        }
    }

    /// Removes sealed segments whose records all precede `lsn`. Returns the
    /// number of segments removed. The appendable segment is never removed.
    pub fn cut_till(&self, lsn: Lsn) -> Result<usize> {
        let mut state = self.state.lock();
        let doomed: Vec<u64> = state
            .sealed
            .values()
            .take_while(|s| s.id() < lsn.segment || s.end().map_or(true, |end| end < lsn))
            .map(LogSegment::id)
            .collect();
        for id in &doomed {
            if let Some(segment) = state.sealed.remove(id) {
                remove_file(segment.path())?;
            }
        }
        if !doomed.is_empty() {
            sync_dir(&self.dir)?;
            debug!(removed = doomed.len(), till = %lsn, "wal.cut_till");
        }
        state.stats.segments_removed += doomed.len() as u64;
        state.stats.sealed_segments = state.sealed.len();
        Ok(doomed.len())
    }

    /// Flushes and seals the appendable segment. Later appends fail.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(StorageError::WalPoisoned);
        }
        state.current.seal()?;
        if let Some(end) = state.current.end() {
            state.flushed = state.flushed.max(end);
        }
        info!(segment = state.current.id(), "wal.close");
        Ok(())
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats.clone()
    }

    /// Highest operation unit id found in the log.
    pub fn max_unit_id(&self) -> UnitId {
        UnitId(self.state.lock().max_unit)
    }

    /// Registry used to decode records.
    pub fn registry(&self) -> &Arc<RecordRegistry> {
        &self.registry
    }

    /// Returns true once an I/O failure has stopped the log.
    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }
}

impl fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("dir", &self.dir)
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Iterator over decoded WAL records.
///
/// A corrupt segment yields its readable prefix followed by one
/// [`StorageError::SegmentCorrupt`] item; iteration then resumes with the
/// next segment.
pub struct WalCursor<'a> {
    wal: &'a WriteAheadLog,
    position: Lsn,
}

impl Iterator for WalCursor<'_> {
    type Item = Result<(Lsn, Box<dyn OperationRecord>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let state = self.wal.state.lock();
        for segment in state.segments_from(self.position.segment) {
            let from = if segment.id() == self.position.segment {
                self.position.position
            } else {
                0
            };
            if let Some(lsn) = segment.first_from(from) {
                self.position = Lsn::new(lsn.segment, lsn.position + 1);
                let item = segment
                    .read(lsn)
                    .and_then(|bytes| self.wal.registry.deserialize(bytes))
                    .map(|record| (lsn, record));
                return Some(item);
            }
            self.position = Lsn::new(segment.id() + 1, 0);
            if let Some(err) = segment.corruption() {
                return Some(Err(err));
            }
        }
        None
    }
}
