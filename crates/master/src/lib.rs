//! Master service: allocates upload sessions and routes uploaders to
//! storage nodes.
//!
//! The master is consulted once per file, never per retry: the returned
//! [`FileHandle`](packmule_protocol::messages::FileHandle) is immutable and
//! the uploader reuses it across every resume attempt. Allocation is not
//! idempotent: a retried `request_upload` yields a fresh handle, and the
//! uploader pins whichever handle it first receives.

mod service;

pub use service::MasterService;

/// Master configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Storage node WebSocket addresses, e.g. `ws://10.0.0.5:7411`.
    /// Selected round-robin per allocation.
    pub storage_nodes: Vec<String>,
    /// Shared secret for minting upload tokens; must match the storage
    /// nodes' configuration.
    pub token_secret: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            port: 0,
            storage_nodes: Vec::new(),
            token_secret: String::new(),
        }
    }
}
