//! Storage node: ingests file chunks over bidirectional WebSocket streams,
//! persists them at exact offsets with durable acks, and reports the
//! resume offset to reconnecting uploaders.
//!
//! The on-disk layout is deliberately minimal (one blob file per file id);
//! the contract the rest of the system relies on is write-at-offset with a
//! durable ack, plus offset recovery by stat on stream open.

mod node;
mod store;

pub use node::StorageNode;
pub use store::BlobStore;

use std::path::PathBuf;
use std::time::Duration;

/// Storage node configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Directory holding blob files.
    pub root: PathBuf,
    /// Emit a status record at least every N in-sequence chunks...
    pub status_every_chunks: u32,
    /// ...or every this often, whichever comes first.
    pub status_interval: Duration,
    /// Sessions idle longer than this are evicted from the registry.
    pub session_ttl: Duration,
    /// How often the expiry sweeper runs.
    pub sweep_interval: Duration,
    /// Verify chunk checksums before persisting.
    pub verify_checksums: bool,
    /// Shared secret for validating upload tokens minted by the master.
    pub token_secret: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            port: 0,
            root: PathBuf::from("packmule-data"),
            status_every_chunks: 8,
            status_interval: Duration::from_millis(500),
            session_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            verify_checksums: true,
            token_secret: String::new(),
        }
    }
}

/// Errors produced by the storage node.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file id: {0}")]
    InvalidFileId(String),

    #[error(transparent)]
    Registry(#[from] packmule_registry::RegistryError),
}
