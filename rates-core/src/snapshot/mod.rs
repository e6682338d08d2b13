//! Versioned snapshot of every source's rate map

pub mod model;
pub mod store;

pub use model::Snapshot;
pub use store::SnapshotStore;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
