//! Error type, result alias and the propagation classes of the durability
//! core.

use thiserror::Error;

/// How far an error reaches once it is observed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// The same call may succeed if retried. Nothing in the durability core
    /// produces this class today.
    Retryable,
    /// The call was refused before touching any state: a bad argument, a
    /// missing target, or a write against read-only storage. The caller
    /// fixes the request; the storage keeps running.
    Rejected,
    /// The owning storage must stop accepting writes (switch to read-only).
    FatalToStorage,
    /// The engine instance cannot continue safely.
    FatalToEngine,
}

/// Errors produced by the durability core.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Structural corruption detected outside of a specific segment or page.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A WAL or double-write segment is corrupt at the given byte offset.
    #[error("segment {segment} corrupt at offset {offset}: {reason}")]
    SegmentCorrupt {
        /// Segment identifier.
        segment: u64,
        /// Byte offset of the first unreadable frame or entry.
        offset: u64,
        /// Short description of what failed to validate.
        reason: &'static str,
    },
    /// A page read from the main data file failed validation.
    #[error("page {file_id}:{page_index} failed integrity check: {reason}")]
    PageIntegrity {
        /// File the page belongs to.
        file_id: u32,
        /// Index of the page inside the file.
        page_index: u32,
        /// Short description of what failed to validate.
        reason: &'static str,
    },
    /// The storage was switched to read-only after detecting corruption.
    #[error("storage is read-only due to detected corruption: {0}")]
    ReadOnly(String),
    /// Replay met a record type that no factory is registered for.
    #[error("unknown operation record type id {0}")]
    UnknownRecordType(u16),
    /// An earlier append or fsync failed; the log accepts no more writes.
    #[error("write-ahead log is poisoned by an earlier I/O failure")]
    WalPoisoned,
    /// A record does not fit into an empty segment.
    #[error("record of {size} bytes exceeds segment capacity of {capacity} bytes")]
    RecordTooLarge {
        /// Serialized frame size.
        size: usize,
        /// Usable capacity of a segment.
        capacity: usize,
    },
    /// Invalid argument or state.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid argument with a formatted message.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// Lookup target is missing.
    #[error("not found")]
    NotFound,
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Classifies the error for the storage's propagation policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::Io(_)
            | StorageError::WalPoisoned
            | StorageError::UnknownRecordType(_) => ErrorClass::FatalToEngine,
            StorageError::Corruption(_)
            | StorageError::SegmentCorrupt { .. }
            | StorageError::PageIntegrity { .. } => ErrorClass::FatalToStorage,
            StorageError::ReadOnly(_)
            | StorageError::RecordTooLarge { .. }
            | StorageError::Invalid(_)
            | StorageError::InvalidOwned(_)
            | StorageError::NotFound => ErrorClass::Rejected,
        }
    }

    /// Returns true when the error means on-disk data failed validation.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::Corruption(_)
                | StorageError::SegmentCorrupt { .. }
                | StorageError::PageIntegrity { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_separates_storage_and_engine_faults() {
        let io = StorageError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.class(), ErrorClass::FatalToEngine);
        let page = StorageError::PageIntegrity {
            file_id: 1,
            page_index: 2,
            reason: "crc mismatch",
        };
        assert_eq!(page.class(), ErrorClass::FatalToStorage);
        assert!(page.is_corruption());
        assert_eq!(
            StorageError::UnknownRecordType(900).class(),
            ErrorClass::FatalToEngine
        );
    }

    #[test]
    fn caller_mistakes_do_not_condemn_the_storage() {
        let rejected = [
            StorageError::Invalid("bad size"),
            StorageError::InvalidOwned("bad filter".into()),
            StorageError::NotFound,
            StorageError::ReadOnly("page 1:2 failed".into()),
            StorageError::RecordTooLarge {
                size: 9000,
                capacity: 4064,
            },
        ];
        for err in rejected {
            assert_eq!(err.class(), ErrorClass::Rejected, "{err}");
            assert!(!err.is_corruption());
        }
    }
}
