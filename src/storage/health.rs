use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::error;

use crate::types::{Result, StorageError};

/// Shared read-only flag of one storage. Once set it stays set until the
/// storage is reopened.
#[derive(Debug, Default)]
pub struct StorageHealth {
    read_only: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl StorageHealth {
    /// Health of a storage that still accepts writes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches the storage to read-only. The first reason is kept.
    pub fn mark_read_only(&self, reason: impl Into<String>) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            let reason = reason.into();
            error!(reason = %reason, "storage.read_only");
            *slot = Some(reason);
        }
        self.read_only.store(true, Ordering::Release);
    }

    /// Returns true once the storage refuses writes.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Why the storage went read-only.
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Fails with [`StorageError::ReadOnly`] once the flag is set.
    pub fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            let reason = self.reason().unwrap_or_default();
            return Err(StorageError::ReadOnly(reason));
        }
        Ok(())
    }
}
