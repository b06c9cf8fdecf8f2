use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::io::{segment_path, FileIo, StdFileIo};
use crate::types::{PageKey, Result, StorageError};

/// File extension of main data files.
pub const DATA_EXTENSION: &str = "pcl";

/// Main data files of one storage: `{name}_{file_id}.pcl`, page `i` at byte
/// offset `i * page_size`. Files are opened (and created) on first use.
pub struct DataFiles {
    dir: PathBuf,
    name: String,
    page_size: usize,
    files: Mutex<HashMap<u32, Arc<StdFileIo>>>,
}

impl DataFiles {
    /// Data files named `{name}_{file_id}.pcl` in `dir`.
    pub fn new(dir: impl AsRef<Path>, name: &str, page_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            name: name.to_owned(),
            page_size,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Size of every page in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Path of the data file for `file_id`.
    pub fn path_of(&self, file_id: u32) -> PathBuf {
        segment_path(&self.dir, &self.name, u64::from(file_id), DATA_EXTENSION)
    }

    fn file(&self, file_id: u32) -> Result<Arc<StdFileIo>> {
        let mut files = self.files.lock();
        if let Some(io) = files.get(&file_id) {
            return Ok(Arc::clone(io));
        }
        let io = Arc::new(StdFileIo::open(self.path_of(file_id))?);
        debug!(file_id, path = %io.path().display(), "pager.files.open");
        files.insert(file_id, Arc::clone(&io));
        Ok(io)
    }

    fn offset_of(&self, key: PageKey) -> u64 {
        u64::from(key.page_index) * self.page_size as u64
    }

    /// Reads a page image. Bytes past the end of the file read as zero, so a
    /// page that was never written comes back fresh.
    pub fn read_page(&self, key: PageKey) -> Result<Box<[u8]>> {
        let io = self.file(key.file_id)?;
        let mut buf = vec![0u8; self.page_size].into_boxed_slice();
        let off = self.offset_of(key);
        let len = io.len()?;
        if off < len {
            let available = (len - off).min(self.page_size as u64) as usize;
            io.read_at(off, &mut buf[..available])?;
        }
        Ok(buf)
    }

    /// Writes a full page image at its offset. Not synced.
    pub fn write_page(&self, key: PageKey, buf: &[u8]) -> Result<()> {
        if buf.len() != self.page_size {
            return Err(StorageError::Invalid("page image has the wrong size"));
        }
        self.file(key.file_id)?.write_at(self.offset_of(key), buf)
    }

    /// Number of pages the file currently spans, a partial last page included.
    pub fn page_count(&self, file_id: u32) -> Result<u32> {
        let len = self.file(file_id)?.len()?;
        u32::try_from(len.div_ceil(self.page_size as u64))
            .map_err(|_| StorageError::Corruption("data file larger than addressable pages"))
    }

    /// Fsyncs the given files.
    pub fn sync(&self, file_ids: impl IntoIterator<Item = u32>) -> Result<()> {
        for file_id in file_ids {
            self.file(file_id)?.sync_all()?;
        }
        Ok(())
    }

    /// Fsyncs every file opened so far.
    pub fn sync_all(&self) -> Result<()> {
        let open: Vec<Arc<StdFileIo>> = self.files.lock().values().cloned().collect();
        for io in open {
            io.sync_all()?;
        }
        Ok(())
    }
}
