#![forbid(unsafe_code)]

//! Double-write log: compressed full-page images written and fsynced before
//! the same pages overwrite the main data file.
//!
//! Segment files are named `{name}_{id}.dwl`. Each entry is
//! `[file_id u32][page_index u32][page_count u32][compressed_len u32]`
//! followed by the Snappy-compressed concatenation of the pages, zero padded
//! to the block size so a torn write can only damage the entry being written.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::io::{list_segments, remove_file, segment_path, sync_dir, FileIo, StdFileIo};
use crate::types::page::PAGE_HDR_LEN;
use crate::types::{PageKey, Result, StorageError};

/// File extension of double-write segments.
pub const DWL_EXTENSION: &str = "dwl";
const ENTRY_HEADER_LEN: usize = 16;

/// Tunables of the on-disk double-write log.
#[derive(Clone, Debug)]
pub struct DoubleWriteOptions {
    /// Every entry is padded to a multiple of this size.
    pub block_size: usize,
    /// A segment is rotated once it reaches this size.
    pub segment_size: u64,
    /// `write` asks for a checkpoint once all segments together reach this size.
    pub max_log_size: u64,
}

impl Default for DoubleWriteOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            segment_size: 32 * 1024 * 1024,
            max_log_size: 256 * 1024 * 1024,
        }
    }
}

/// Counters describing double-write activity since open.
#[derive(Clone, Debug, Default)]
pub struct DoubleWriteStats {
    /// Entries appended
    pub entries: u64,
    /// Pages covered by appended entries
    pub pages: u64,
    /// Bytes written, padding included
    pub bytes_written: u64,
    /// Completed truncations
    pub truncations: u64,
    /// Current on-disk size of all segments
    pub log_size: u64,
}

/// Torn-write protection for page flushes.
pub trait DoubleWrite: Send + Sync {
    /// Durably records images of `pages`, which cover consecutive page
    /// indexes of `file_id` starting at `page_index`. Returns true once the
    /// log has grown past its ceiling and a checkpoint should follow.
    fn write(&self, file_id: u32, page_index: u32, pages: &[&[u8]]) -> Result<bool>;
    /// Drops every entry once the pages they cover are durable in the main
    /// file. Ignored in restore mode.
    fn truncate(&self) -> Result<()>;
    /// Scans the log and builds the page index used by [`DoubleWrite::load_page`].
    fn restore_mode_on(&self) -> Result<()>;
    /// Discards the restore index.
    fn restore_mode_off(&self);
    /// Latest image of `key`, or `None` if it was never double-written.
    fn load_page(&self, key: PageKey) -> Result<Option<Box<[u8]>>>;
    /// Pages covered by the restore index, sorted.
    fn restored_pages(&self) -> Vec<PageKey>;
    /// Releases the open segment.
    fn close(&self) -> Result<()>;
    /// Current statistics snapshot.
    fn stats(&self) -> DoubleWriteStats;
}

/// Double-write disabled: nothing is written and nothing can be restored.
#[derive(Debug, Default)]
pub struct NoDoubleWrite;

impl DoubleWrite for NoDoubleWrite {
    fn write(&self, _file_id: u32, _page_index: u32, _pages: &[&[u8]]) -> Result<bool> {
        Ok(false)
    }

    fn truncate(&self) -> Result<()> {
        Ok(())
    }

    fn restore_mode_on(&self) -> Result<()> {
        Ok(())
    }

    fn restore_mode_off(&self) {}

    fn load_page(&self, _key: PageKey) -> Result<Option<Box<[u8]>>> {
        Ok(None)
    }

    fn restored_pages(&self) -> Vec<PageKey> {
        Vec::new()
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> DoubleWriteStats {
        DoubleWriteStats::default()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct EntryHeader {
    file_id: u32,
    page_index: u32,
    page_count: u32,
    compressed_len: u32,
}

impl EntryHeader {
    fn encode(&self) -> [u8; ENTRY_HEADER_LEN] {
        let mut buf = [0u8; ENTRY_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.file_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.page_index.to_be_bytes());
        buf[8..12].copy_from_slice(&self.page_count.to_be_bytes());
        buf[12..16].copy_from_slice(&self.compressed_len.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Option<Self> {
        let src = src.get(..ENTRY_HEADER_LEN)?;
        let header = Self {
            file_id: u32::from_be_bytes(src[0..4].try_into().unwrap()),
            page_index: u32::from_be_bytes(src[4..8].try_into().unwrap()),
            page_count: u32::from_be_bytes(src[8..12].try_into().unwrap()),
            compressed_len: u32::from_be_bytes(src[12..16].try_into().unwrap()),
        };
        (header.page_count > 0 && header.compressed_len > 0).then_some(header)
    }

    fn covers(&self, key: PageKey) -> bool {
        key.file_id == self.file_id
            && key.page_index >= self.page_index
            && u64::from(key.page_index) < u64::from(self.page_index) + u64::from(self.page_count)
    }
}

/// Size of one page image in an entry that decompressed to `total` bytes,
/// `None` unless the images split evenly and each can hold a page header.
fn entry_page_len(total: usize, page_count: u32) -> Option<usize> {
    let page_count = page_count as usize;
    if page_count == 0 || total % page_count != 0 {
        return None;
    }
    let page_len = total / page_count;
    (page_len >= PAGE_HDR_LEN).then_some(page_len)
}

struct OpenSegment {
    id: u64,
    io: StdFileIo,
    len: u64,
}

struct DwlState {
    current: Option<OpenSegment>,
    sealed: BTreeMap<u64, PathBuf>,
    next_id: u64,
    log_size: u64,
    restore: Option<HashMap<PageKey, (u64, u64)>>,
    stats: DoubleWriteStats,
}

/// On-disk double-write log. Appends and truncation are serialized by one
/// mutex.
pub struct DoubleWriteLog {
    dir: PathBuf,
    name: String,
    options: DoubleWriteOptions,
    state: Mutex<DwlState>,
}

impl DoubleWriteLog {
    /// Opens the log in `dir`. Segments left by an earlier run are kept for
    /// [`DoubleWrite::restore_mode_on`]; new entries go to a fresh segment.
    pub fn open(dir: impl AsRef<Path>, name: &str, options: DoubleWriteOptions) -> Result<Self> {
        if options.block_size == 0 || !options.block_size.is_power_of_two() {
            return Err(StorageError::Invalid("double-write block size must be a power of two"));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut sealed = BTreeMap::new();
        let mut log_size = 0;
        for (id, path) in list_segments(&dir, name, DWL_EXTENSION)? {
            log_size += fs::metadata(&path)?.len();
            sealed.insert(id, path);
        }
        let next_id = sealed.keys().next_back().map_or(1, |id| id + 1);
        info!(dir = %dir.display(), segments = sealed.len(), log_size, "dwl.open");
        Ok(Self {
            dir,
            name: name.to_owned(),
            options,
            state: Mutex::new(DwlState {
                current: None,
                sealed,
                next_id,
                log_size,
                restore: None,
                stats: DoubleWriteStats::default(),
            }),
        })
    }

    fn padded(&self, len: usize) -> usize {
        len.div_ceil(self.options.block_size) * self.options.block_size
    }

    fn seal_current(state: &mut DwlState) {
        if let Some(segment) = state.current.take() {
            state.sealed.insert(segment.id, segment.io.path().to_path_buf());
        }
    }

    fn ensure_segment<'s>(&self, state: &'s mut DwlState) -> Result<&'s mut OpenSegment> {
        let full = state
            .current
            .as_ref()
            .is_some_and(|segment| segment.len >= self.options.segment_size);
        if full {
            Self::seal_current(state);
        }
        if state.current.is_none() {
            let id = state.next_id;
            let io = StdFileIo::open(segment_path(&self.dir, &self.name, id, DWL_EXTENSION))?;
            io.truncate(0)?;
            sync_dir(&self.dir)?;
            state.next_id += 1;
            debug!(segment = id, "dwl.segment.create");
            state.current = Some(OpenSegment { id, io, len: 0 });
        }
        state
            .current
            .as_mut()
            .ok_or(StorageError::Invalid("double-write segment missing"))
    }

    fn scan_segment(id: u64, path: &Path, index: &mut HashMap<PageKey, (u64, u64)>, block_size: usize) -> Result<()> {
        let data = StdFileIo::open_read_only(path)?.read_all()?;
        let mut off = 0usize;
        while let Some(header) = EntryHeader::decode(&data[off.min(data.len())..]) {
            let body_start = off + ENTRY_HEADER_LEN;
            let body_end = body_start + header.compressed_len as usize;
            let Some(body) = data.get(body_start..body_end) else {
                debug!(segment = id, offset = off, "dwl.restore.torn_tail");
                break;
            };
            match snap::raw::Decoder::new().decompress_vec(body) {
                Ok(pages) if entry_page_len(pages.len(), header.page_count).is_some() => {}
                _ => {
                    warn!(segment = id, offset = off, "dwl.restore.bad_entry");
                    break;
                }
            }
            for i in 0..header.page_count {
                let Some(page_index) = header.page_index.checked_add(i) else {
                    break;
                };
                index.insert(PageKey::new(header.file_id, page_index), (id, off as u64));
            }
            off = body_end.div_ceil(block_size) * block_size;
        }
        Ok(())
    }
}

impl DoubleWrite for DoubleWriteLog {
    fn write(&self, file_id: u32, page_index: u32, pages: &[&[u8]]) -> Result<bool> {
        let first = pages
            .first()
            .ok_or(StorageError::Invalid("double-write needs at least one page"))?;
        if pages.iter().any(|p| p.len() != first.len()) {
            return Err(StorageError::Invalid("double-write pages differ in size"));
        }
        if first.len() < PAGE_HDR_LEN {
            return Err(StorageError::Invalid("double-write page smaller than a page header"));
        }
        let page_count = u32::try_from(pages.len())
            .map_err(|_| StorageError::Invalid("too many pages in one double-write entry"))?;
        let raw = pages.concat();
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&raw)
            .map_err(|err| StorageError::InvalidOwned(format!("double-write compression: {err}")))?;
        let header = EntryHeader {
            file_id,
            page_index,
            page_count,
            compressed_len: u32::try_from(compressed.len())
                .map_err(|_| StorageError::Invalid("double-write entry too large"))?,
        };
        let mut entry = Vec::with_capacity(self.padded(ENTRY_HEADER_LEN + compressed.len()));
        entry.extend_from_slice(&header.encode());
        entry.extend_from_slice(&compressed);
        entry.resize(self.padded(entry.len()), 0);

        let mut state = self.state.lock();
        if state.restore.is_some() {
            return Err(StorageError::Invalid("double-write log is in restore mode"));
        }
        let segment = self.ensure_segment(&mut state)?;
        segment.io.write_at(segment.len, &entry)?;
        segment.io.sync_all()?;
        segment.len += entry.len() as u64;
        let segment_id = segment.id;
        state.log_size += entry.len() as u64;
        state.stats.entries += 1;
        state.stats.pages += u64::from(page_count);
        state.stats.bytes_written += entry.len() as u64;
        debug!(
            segment = segment_id,
            file_id,
            page_index,
            pages = page_count,
            bytes = entry.len(),
            "dwl.write"
        );
        Ok(state.log_size >= self.options.max_log_size)
    }

    fn truncate(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.restore.is_some() {
            debug!("dwl.truncate.skipped_in_restore_mode");
            return Ok(());
        }
        Self::seal_current(&mut state);
        let removed = state.sealed.len();
        for path in state.sealed.values() {
            remove_file(path)?;
        }
        state.sealed.clear();
        if removed > 0 {
            sync_dir(&self.dir)?;
        }
        state.log_size = 0;
        state.stats.truncations += 1;
        debug!(removed, "dwl.truncate");
        Ok(())
    }

    fn restore_mode_on(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::seal_current(&mut state);
        let mut index = HashMap::new();
        for (&id, path) in &state.sealed {
            Self::scan_segment(id, path, &mut index, self.options.block_size)?;
        }
        info!(segments = state.sealed.len(), pages = index.len(), "dwl.restore_mode_on");
        state.restore = Some(index);
        Ok(())
    }

    fn restore_mode_off(&self) {
        let mut state = self.state.lock();
        if state.restore.take().is_some() {
            debug!("dwl.restore_mode_off");
        }
    }

    fn load_page(&self, key: PageKey) -> Result<Option<Box<[u8]>>> {
        let state = self.state.lock();
        let index = state
            .restore
            .as_ref()
            .ok_or(StorageError::Invalid("double-write log is not in restore mode"))?;
        let Some(&(segment, offset)) = index.get(&key) else {
            return Ok(None);
        };
        let path = state.sealed.get(&segment).ok_or(StorageError::NotFound)?;
        let corrupt = |reason| StorageError::SegmentCorrupt {
            segment,
            offset,
            reason,
        };
        let io = StdFileIo::open_read_only(path)?;
        let mut raw_header = [0u8; ENTRY_HEADER_LEN];
        io.read_at(offset, &mut raw_header)?;
        let header = EntryHeader::decode(&raw_header)
            .filter(|header| header.covers(key))
            .ok_or_else(|| corrupt("double-write entry header changed"))?;
        let mut body = vec![0u8; header.compressed_len as usize];
        io.read_at(offset + ENTRY_HEADER_LEN as u64, &mut body)?;
        let pages = snap::raw::Decoder::new()
            .decompress_vec(&body)
            .map_err(|_| corrupt("double-write entry does not decompress"))?;
        let page_len = entry_page_len(pages.len(), header.page_count)
            .ok_or_else(|| corrupt("double-write entry has a bad page size"))?;
        let start = (key.page_index - header.page_index) as usize * page_len;
        Ok(Some(pages[start..start + page_len].into()))
    }

    fn restored_pages(&self) -> Vec<PageKey> {
        let state = self.state.lock();
        let mut pages: Vec<PageKey> = state
            .restore
            .as_ref()
            .map(|index| index.keys().copied().collect())
            .unwrap_or_default();
        pages.sort_unstable();
        pages
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(segment) = &state.current {
            segment.io.sync_all()?;
        }
        Self::seal_current(&mut state);
        Ok(())
    }

    fn stats(&self) -> DoubleWriteStats {
        let state = self.state.lock();
        DoubleWriteStats {
            log_size: state.log_size,
            ..state.stats.clone()
        }
    }
}
