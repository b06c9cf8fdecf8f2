//! Penumbra: the durability core of a page-oriented storage engine.
//!
//! Page mutations are expressed as operation records with exact `redo` and
//! `undo`, appended to a segmented write-ahead log, grouped into atomic
//! units, and flushed to the data files through a double-write log that
//! protects against torn page writes. A bucketed free-space map answers
//! "which page has room for N bytes".
//!
//! The entry point is [`storage::DurableStorage`].

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod atomic;
pub mod dwl;
pub mod fsm;
pub mod logging;
pub mod ops;
pub mod primitives;
pub mod storage;
pub mod types;

pub use atomic::{AtomicOperation, AtomicOperationsManager, OperationState};
pub use storage::{DurableStorage, RecoveryMode, RecoveryReport, StorageOptions};
pub use types::{Lsn, PageKey, Result, StorageError, UnitId};
