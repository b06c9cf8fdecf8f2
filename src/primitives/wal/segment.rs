#![forbid(unsafe_code)]

//! One WAL segment file: a 32-byte header followed by back-to-back frames
//! `[record_len u32][crc32 u32][record]`. An LSN position is the byte offset
//! of a frame inside its segment.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::record::{serialize_into, serialized_size, OperationRecord};
use crate::primitives::io::{segment_path, FileIo, StdFileIo};
use crate::types::checksum::crc32_of;
use crate::types::{Lsn, Result, StorageError};

const WAL_MAGIC: [u8; 4] = *b"PNWL";
const WAL_FORMAT_VERSION: u16 = 1;
/// Size of the segment file header.
pub const SEGMENT_HEADER_LEN: usize = 32;
/// Size of the per-frame header.
pub const FRAME_HEADER_LEN: usize = 8;
/// File extension of WAL segments.
pub const WAL_EXTENSION: &str = "wal";

/// Outcome of appending to a modifiable segment.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteResult {
    /// The record was appended at this LSN.
    Appended(Lsn),
    /// The record does not fit; the caller rotates to a new segment.
    SegmentFull,
}

#[derive(Clone, Debug)]
struct SegmentHeader {
    segment_id: u64,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; SEGMENT_HEADER_LEN] {
        let mut buf = [0u8; SEGMENT_HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.segment_id.to_be_bytes());
        let crc = crc32_of(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> std::result::Result<Self, &'static str> {
        if src.len() < SEGMENT_HEADER_LEN {
            return Err("wal segment header truncated");
        }
        if src[0..4] != WAL_MAGIC {
            return Err("wal segment magic mismatch");
        }
        if src[4..6] != WAL_FORMAT_VERSION.to_be_bytes() {
            return Err("wal segment format version mismatch");
        }
        let stored_crc = u32::from_be_bytes(src[28..32].try_into().unwrap());
        if crc32_of(&[&src[..28]]) != stored_crc {
            return Err("wal segment header crc mismatch");
        }
        Ok(Self {
            segment_id: u64::from_be_bytes(src[8..16].try_into().unwrap()),
        })
    }
}

enum SegmentState {
    Modifiable {
        io: Arc<dyn FileIo>,
        synced_len: usize,
    },
    ReadOnly,
}

/// Why a scan stopped before the end of the file.
enum ScanStop {
    /// Unfinished final write; acceptable only in the newest segment.
    Torn(&'static str),
    Corrupt(&'static str),
}

/// A WAL segment held in memory.
///
/// A modifiable segment buffers appends and writes them out on
/// [`LogSegment::sync`]; reads are served from memory before and after the
/// sync. A read-only segment is loaded from disk once and scanned to rebuild
/// its frame index.
pub struct LogSegment {
    id: u64,
    path: PathBuf,
    capacity: usize,
    data: Vec<u8>,
    frames: Vec<u64>,
    state: SegmentState,
    corruption: Option<(u64, &'static str)>,
    max_unit: u64,
    file_len: usize,
}

impl LogSegment {
    /// Creates segment `id` in `dir`, replacing any stale file of that name,
    /// and makes its header durable.
    pub fn create(dir: &Path, name: &str, id: u64, capacity: usize) -> Result<Self> {
        if capacity < SEGMENT_HEADER_LEN + FRAME_HEADER_LEN {
            return Err(StorageError::Invalid("wal segment capacity too small"));
        }
        let path = segment_path(dir, name, id, WAL_EXTENSION);
        let io = StdFileIo::open(&path)?;
        let header = SegmentHeader { segment_id: id }.encode();
        io.truncate(0)?;
        io.write_at(0, &header)?;
        io.sync_all()?;
        debug!(segment = id, capacity, "wal.segment.create");
        Ok(Self {
            id,
            path,
            capacity,
            data: header.to_vec(),
            frames: Vec::new(),
            state: SegmentState::Modifiable {
                io: Arc::new(io),
                synced_len: SEGMENT_HEADER_LEN,
            },
            corruption: None,
            max_unit: 0,
            file_len: SEGMENT_HEADER_LEN,
        })
    }

    /// Loads an existing segment for reading only.
    ///
    /// Only the `newest` segment may end in an incomplete tail: a frame
    /// running past the end of the file, a zero length followed by zeros, or
    /// a bad checksum on the very last frame. Such a tail simply ends the
    /// segment. In an older segment every one of them is corruption, since
    /// the segment was synced before its successor was created. Corruption is
    /// recorded at its offset; frames before it stay readable.
    pub fn open_read_only(path: &Path, id: u64, newest: bool) -> Result<Self> {
        let data = StdFileIo::open_read_only(path)?.read_all()?;
        let mut segment = Self {
            id,
            path: path.to_path_buf(),
            capacity: data.len(),
            file_len: data.len(),
            data,
            frames: Vec::new(),
            state: SegmentState::ReadOnly,
            corruption: None,
            max_unit: 0,
        };
        segment.scan(newest);
        Ok(segment)
    }

    fn scan(&mut self, newest: bool) {
        if self.data.len() < SEGMENT_HEADER_LEN
            || self.data[..SEGMENT_HEADER_LEN].iter().all(|&b| b == 0)
        {
            if !newest {
                warn!(segment = self.id, "wal.segment.header_missing");
                self.corruption = Some((0, "wal segment header missing"));
            }
            self.data.clear();
            return;
        }
        match SegmentHeader::decode(&self.data) {
            Ok(header) if header.segment_id == self.id => {}
            Ok(_) => {
                self.corruption = Some((0, "wal segment id mismatch"));
                return;
            }
            Err(reason) => {
                self.corruption = Some((0, reason));
                return;
            }
        }
        let len = self.data.len();
        let mut off = SEGMENT_HEADER_LEN;
        let mut stop = None;
        while off < len {
            if off + FRAME_HEADER_LEN > len {
                stop = Some(ScanStop::Torn("wal frame header truncated"));
                break;
            }
            let record_len = u32::from_be_bytes(self.data[off..off + 4].try_into().unwrap()) as usize;
            let stored_crc = u32::from_be_bytes(self.data[off + 4..off + 8].try_into().unwrap());
            if record_len == 0 {
                stop = Some(if self.data[off..].iter().all(|&b| b == 0) {
                    ScanStop::Torn("wal segment zero-filled tail")
                } else {
                    ScanStop::Corrupt("wal frame length is zero")
                });
                break;
            }
            let end = off + FRAME_HEADER_LEN + record_len;
            if end > len {
                stop = Some(ScanStop::Torn("wal frame runs past segment end"));
                break;
            }
            let record = &self.data[off + FRAME_HEADER_LEN..end];
            if crc32_of(&[&self.data[off..off + 4], record]) != stored_crc {
                stop = Some(if end < len {
                    ScanStop::Corrupt("wal frame crc mismatch")
                } else {
                    ScanStop::Torn("wal frame crc mismatch")
                });
                break;
            }
            self.max_unit = self.max_unit.max(unit_of(record));
            self.frames.push(off as u64);
            off = end;
        }
        match stop {
            None => {}
            Some(ScanStop::Torn(reason)) if newest => {
                debug!(segment = self.id, valid_up_to = off, len, reason, "wal.segment.torn_tail");
            }
            Some(ScanStop::Torn(reason) | ScanStop::Corrupt(reason)) => {
                warn!(segment = self.id, offset = off, reason, "wal.segment.corrupt");
                self.corruption = Some((off as u64, reason));
            }
        }
        self.data.truncate(off);
    }

    /// Cuts an incomplete tail off the file, so the segment scans clean once
    /// a newer segment exists. Returns true when the file was shortened.
    pub fn drop_torn_tail(&mut self) -> Result<bool> {
        if self.corruption.is_some() || self.file_len <= self.data.len() {
            return Ok(false);
        }
        let io = StdFileIo::open(&self.path)?;
        io.truncate(self.data.len() as u64)?;
        io.sync_all()?;
        warn!(
            segment = self.id,
            from = self.file_len,
            to = self.data.len(),
            "wal.segment.torn_tail_dropped"
        );
        self.file_len = self.data.len();
        Ok(true)
    }

    /// Returns false when the header never reached the disk.
    pub fn has_header(&self) -> bool {
        !self.data.is_empty()
    }

    /// Appends a record. Returns [`WriteResult::SegmentFull`] when the frame
    /// does not fit into the remaining capacity.
    pub fn write(&mut self, record: &dyn OperationRecord) -> Result<WriteResult> {
        if matches!(self.state, SegmentState::ReadOnly) {
            return Err(StorageError::Invalid("wal segment is read-only"));
        }
        let record_len = serialized_size(record);
        let frame_len = FRAME_HEADER_LEN + record_len;
        if self.data.len() + frame_len > self.capacity {
            if self.frames.is_empty() {
                return Err(StorageError::RecordTooLarge {
                    size: frame_len,
                    capacity: self.capacity - SEGMENT_HEADER_LEN,
                });
            }
            return Ok(WriteResult::SegmentFull);
        }
        let len_field = u32::try_from(record_len)
            .map_err(|_| StorageError::Invalid("wal record larger than 4 GiB"))?;
        let off = self.data.len();
        self.data.extend_from_slice(&len_field.to_be_bytes());
        self.data.extend_from_slice(&[0u8; 4]);
        serialize_into(record, &mut self.data);
        let crc = crc32_of(&[&self.data[off..off + 4], &self.data[off + FRAME_HEADER_LEN..]]);
        self.data[off + 4..off + 8].copy_from_slice(&crc.to_be_bytes());
        self.frames.push(off as u64);
        self.max_unit = self.max_unit.max(record.unit_id().0);
        Ok(WriteResult::Appended(Lsn::new(self.id, off as u64)))
    }

    /// Writes buffered frames to the file and fsyncs it.
    pub fn sync(&mut self) -> Result<()> {
        if let SegmentState::Modifiable { io, synced_len } = &mut self.state {
            if *synced_len < self.data.len() {
                io.write_at(*synced_len as u64, &self.data[*synced_len..])?;
                io.sync_all()?;
                *synced_len = self.data.len();
            }
        }
        Ok(())
    }

    /// Syncs and turns the segment read-only.
    pub fn seal(&mut self) -> Result<()> {
        self.sync()?;
        self.state = SegmentState::ReadOnly;
        Ok(())
    }

    /// Serialized record stored at `lsn`.
    pub fn read(&self, lsn: Lsn) -> Result<&[u8]> {
        if lsn.segment != self.id {
            return Err(StorageError::NotFound);
        }
        self.frames
            .binary_search(&lsn.position)
            .map_err(|_| StorageError::NotFound)?;
        let off = lsn.position as usize;
        let record_len = u32::from_be_bytes(self.data[off..off + 4].try_into().unwrap()) as usize;
        Ok(&self.data[off + FRAME_HEADER_LEN..off + FRAME_HEADER_LEN + record_len])
    }

    /// LSN of the first frame at or after `position`.
    pub fn first_from(&self, position: u64) -> Option<Lsn> {
        let idx = self.frames.partition_point(|&off| off < position);
        self.frames.get(idx).map(|&off| Lsn::new(self.id, off))
    }

    /// LSN of the frame following `lsn` in this segment.
    pub fn next(&self, lsn: Lsn) -> Option<Lsn> {
        if lsn.segment != self.id {
            return None;
        }
        self.first_from(lsn.position + 1)
    }

    /// LSN of the first record, if any.
    pub fn begin(&self) -> Option<Lsn> {
        self.frames.first().map(|&off| Lsn::new(self.id, off))
    }

    /// LSN of the last record, if any.
    pub fn end(&self) -> Option<Lsn> {
        self.frames.last().map(|&off| Lsn::new(self.id, off))
    }

    /// Segment id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Path of the segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true once the segment no longer accepts appends.
    pub fn is_read_only(&self) -> bool {
        matches!(self.state, SegmentState::ReadOnly)
    }

    /// Number of records in the segment.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true when the segment holds no records.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Bytes used, header included.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Highest operation unit id recorded in the segment.
    pub fn max_unit_id(&self) -> u64 {
        self.max_unit
    }

    /// Corruption found while loading the segment.
    pub fn corruption(&self) -> Option<StorageError> {
        self.corruption.map(|(offset, reason)| StorageError::SegmentCorrupt {
            segment: self.id,
            offset,
            reason,
        })
    }
}

fn unit_of(record: &[u8]) -> u64 {
    record
        .get(2..10)
        .map(|raw| u64::from_be_bytes(raw.try_into().unwrap()))
        .unwrap_or(0)
}
