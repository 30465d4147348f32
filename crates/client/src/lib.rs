//! Uploader side of packmule: the transfer channel, the master client and
//! the retry/resume state machine.
//!
//! The entry point is [`UploadController`]: it asks the master for a
//! [`FileHandle`](packmule_protocol::messages::FileHandle), opens a
//! [`TransferChannel`] to the assigned storage node, streams chunks while
//! consuming status records, and on transport failure reconnects and
//! resumes from the offset the storage node reports.

mod backoff;
mod channel;
mod controller;
mod master;

pub use backoff::BackoffConfig;
pub use channel::{ChannelEvent, TransferChannel};
pub use controller::{UploadController, UploadEvent, UploadReport, UploadState};
pub use master::MasterClient;

use std::time::Duration;

use packmule_protocol::constants::{
    DEFAULT_CHUNK_SIZE, ERR_CODE_UNAVAILABLE, WS_REQUEST_TIMEOUT,
};

/// Uploader configuration.
///
/// Every knob the transfer depends on is named here; nothing is an implicit
/// global. The chunk size must match what the storage node expects only in
/// spirit; offsets, not indices, are authoritative on the wire.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Chunk payload size in bytes.
    pub chunk_size: usize,
    /// Deadline for establishing a WebSocket connection.
    pub connect_timeout: Duration,
    /// Deadline for request/response exchanges (open, complete, query).
    pub request_timeout: Duration,
    /// Maximum quiet time on the status stream before the attempt is
    /// declared interrupted.
    pub status_idle_timeout: Duration,
    /// Backoff between reconnect attempts.
    pub backoff: BackoffConfig,
    /// Consecutive retryable failures tolerated before giving up.
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(10),
            request_timeout: WS_REQUEST_TIMEOUT,
            status_idle_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            max_retries: 5,
        }
    }
}

/// Errors produced by the uploader.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Transfer(#[from] packmule_transfer::TransferError),

    #[error("operation timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("rejected by server ({code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("cancelled")]
    Cancelled,

    #[error("retry budget exhausted; last durable offset {last_offset}")]
    RetriesExhausted { last_offset: i64 },
}

impl ClientError {
    /// Whether the failure is transient: reconnect-and-resume may succeed.
    ///
    /// Auth rejections, protocol violations and local I/O failures are
    /// terminal; transport unavailability and timeouts are not. A 503 from
    /// the master ("no storage capacity") is also worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Ws(_) | ClientError::Timeout | ClientError::Closed => true,
            ClientError::Rejected { code, .. } => *code == ERR_CODE_UNAVAILABLE,
            _ => false,
        }
    }
}
