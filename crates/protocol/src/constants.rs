use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Chunk size shared by uploader and storage node (64 KiB).
///
/// The wire format does not assume equal-length chunks; the final chunk of a
/// file may be shorter, and the receiver trusts each chunk's `offset` field
/// rather than `chunk_index * DEFAULT_CHUNK_SIZE`.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum WebSocket message size (4 MiB).
///
/// Must comfortably exceed the chunk size plus the binary frame header.
pub const WS_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// How often each side sends WS pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Read deadline: if *nothing* arrives within this window (no pong, no
/// response, no status push), the connection is considered dead. Set high
/// enough to tolerate slow disk syncs on the storage side.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Timeout for request/response exchanges (stream open, complete, query).
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Master surface
    #[serde(rename = "request_upload")]
    RequestUpload,
    #[serde(rename = "upload_granted")]
    UploadGranted,
    #[serde(rename = "query_file")]
    QueryFile,
    #[serde(rename = "file_location")]
    FileLocation,

    // Storage node surface
    #[serde(rename = "stream_open")]
    StreamOpen,
    #[serde(rename = "transfer_status")]
    TransferStatus,
    #[serde(rename = "complete_upload")]
    CompleteUpload,
    #[serde(rename = "upload_complete")]
    UploadComplete,
    #[serde(rename = "query_offset")]
    QueryOffset,
    #[serde(rename = "cancel_upload")]
    CancelUpload,
    #[serde(rename = "upload_cancelled")]
    UploadCancelled,

    // Control
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common error codes carried in envelope error bodies.
pub const ERR_CODE_BAD_REQUEST: i32 = 400;
pub const ERR_CODE_UNAUTHORIZED: i32 = 401;
pub const ERR_CODE_NOT_FOUND: i32 = 404;
pub const ERR_CODE_CONFLICT: i32 = 409;
pub const ERR_CODE_INTERNAL: i32 = 500;
pub const ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
pub const ERR_CODE_UNAVAILABLE: i32 = 503;
