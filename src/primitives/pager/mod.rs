#![forbid(unsafe_code)]

mod files;
mod pool;

pub use files::{DataFiles, DATA_EXTENSION};
pub use pool::{BufferPool, PageHandle, PagePool, PoolStats};
