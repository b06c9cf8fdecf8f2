//! Process-wide `tracing` subscriber setup for binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, StorageError};

/// Installs a global `fmt` subscriber filtered by `filter`, e.g.
/// `"info,penumbra::primitives::wal=debug"`. Library code never calls this.
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| StorageError::InvalidOwned(format!("Invalid log filter: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| StorageError::Invalid("Logging already initialized"))
}
