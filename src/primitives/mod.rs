//! Low-level primitives the durability core is built from.
//!
//! Includes byte utilities, positioned file I/O, the page pool and data
//! files, and the write-ahead log.

/// Byte-level encoding and decoding.
pub mod bytes;

/// Positioned file I/O and segment file naming.
pub mod io;

/// Page pool and main data files.
pub mod pager;

/// Write-ahead logging (WAL) for crash recovery.
///
/// Ensures durability through sequential logging of operation records.
pub mod wal;
