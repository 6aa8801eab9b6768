//! Multi-step deployment sequences a leading phaser runs

mod create;
mod shutdown;

use flork_common::crd::ResourceKey;
use flork_common::{Error, Result};
use tempfile::TempDir;

pub use create::CreatePhase;
pub use shutdown::ShutdownPhase;

/// Scratch directory for one resource's configuration, removed on drop
fn scratch_dir(key: &ResourceKey) -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix(&key.scratch_prefix())
        .tempdir()
        .map_err(|e| Error::internal("scratch_dir", format!("{key}: {e}")))
}
