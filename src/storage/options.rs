use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dwl::DoubleWriteOptions;
use crate::primitives::wal::segment::{FRAME_HEADER_LEN, SEGMENT_HEADER_LEN};
use crate::primitives::wal::WalOptions;
use crate::types::{Result, StorageError};

/// Which logged page records crash recovery redoes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Redo every page record in the log, committed or not.
    RedoAll,
    /// Log a commit marker per unit and redo only units that have one.
    #[default]
    RedoCommitted,
}

/// Configuration options supplied when opening a [`super::DurableStorage`].
///
/// Options can be built in code with the setters or loaded from TOML:
///
/// ```toml
/// page_size = 16384
/// wal_segment_size = 4194304
/// recovery_mode = "redo_all"
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Size of every data page in bytes
    pub page_size: usize,
    /// Maximum size of one WAL segment in bytes
    pub wal_segment_size: usize,
    /// Whether commit waits for the WAL to reach the disk
    pub wal_sync_on_commit: bool,
    /// Whether page flushes go through the double-write log
    pub double_write: bool,
    /// Padding unit of double-write entries
    pub dwl_block_size: usize,
    /// Maximum size of one double-write segment in bytes
    pub dwl_segment_size: u64,
    /// Double-write size that triggers a checkpoint
    pub dwl_max_log_size: u64,
    /// Recovery model, see [`RecoveryMode`]
    pub recovery_mode: RecoveryMode,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,
            wal_segment_size: 16 * 1024 * 1024,
            wal_sync_on_commit: true,
            double_write: true,
            dwl_block_size: 4096,
            dwl_segment_size: 32 * 1024 * 1024,
            dwl_max_log_size: 256 * 1024 * 1024,
            recovery_mode: RecoveryMode::default(),
        }
    }
}

impl StorageOptions {
    /// Sets the data page size.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the WAL segment size.
    pub fn wal_segment_size(mut self, bytes: usize) -> Self {
        self.wal_segment_size = bytes;
        self
    }

    /// Sets whether commits flush the WAL.
    pub fn wal_sync_on_commit(mut self, enabled: bool) -> Self {
        self.wal_sync_on_commit = enabled;
        self
    }

    /// Enables or disables the double-write log.
    pub fn double_write(mut self, enabled: bool) -> Self {
        self.double_write = enabled;
        self
    }

    /// Sets the double-write block size.
    pub fn dwl_block_size(mut self, bytes: usize) -> Self {
        self.dwl_block_size = bytes;
        self
    }

    /// Sets the double-write segment size.
    pub fn dwl_segment_size(mut self, bytes: u64) -> Self {
        self.dwl_segment_size = bytes;
        self
    }

    /// Sets the double-write size that asks for a checkpoint.
    pub fn dwl_max_log_size(mut self, bytes: u64) -> Self {
        self.dwl_max_log_size = bytes;
        self
    }

    /// Sets the recovery model.
    pub fn recovery_mode(mut self, mode: RecoveryMode) -> Self {
        self.recovery_mode = mode;
        self
    }

    /// Parses options from TOML; missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let options: Self = toml::from_str(contents)
            .map_err(|err| StorageError::InvalidOwned(format!("invalid storage options: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|err| StorageError::InvalidOwned(format!("cannot serialize storage options: {err}")))
    }

    /// Rejects combinations the storage cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || !(4096..=1024 * 1024).contains(&self.page_size) {
            return Err(StorageError::InvalidOwned(format!(
                "page size {} must be a power of two between 4 KiB and 1 MiB",
                self.page_size
            )));
        }
        if self.dwl_block_size == 0 || !self.dwl_block_size.is_power_of_two() {
            return Err(StorageError::InvalidOwned(format!(
                "double-write block size {} must be a power of two",
                self.dwl_block_size
            )));
        }
        if self.wal_segment_size < SEGMENT_HEADER_LEN + FRAME_HEADER_LEN {
            return Err(StorageError::InvalidOwned(format!(
                "wal segment size {} cannot hold a single frame",
                self.wal_segment_size
            )));
        }
        if self.dwl_segment_size == 0 || self.dwl_max_log_size == 0 {
            return Err(StorageError::Invalid("double-write sizes must be positive"));
        }
        Ok(())
    }

    /// Options for the write-ahead log.
    pub fn wal_options(&self) -> WalOptions {
        WalOptions::new(self.wal_segment_size)
    }

    /// Options for the double-write log.
    pub fn double_write_options(&self) -> DoubleWriteOptions {
        DoubleWriteOptions {
            block_size: self.dwl_block_size,
            segment_size: self.dwl_segment_size,
            max_log_size: self.dwl_max_log_size,
        }
    }
}
