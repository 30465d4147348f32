use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Master surface
// ---------------------------------------------------------------------------

/// Metadata describing a file the uploader wants to store.
///
/// Payload of `request_upload`. A zero-byte file is valid; the master still
/// allocates a handle for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub filename: String,
    pub size_bytes: i64,
}

/// The handle the master returns for a new upload.
///
/// Payload of `upload_granted`. Immutable once issued; the uploader reuses
/// it for every resume attempt of the same upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHandle {
    pub file_id: String,
    pub storage_address: String,
    pub token: String,
}

/// Looks up a previously allocated file. Payload of `query_file`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileQuery {
    pub file_id: String,
}

/// Where an allocated file lives. Payload of `file_location`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLocation {
    pub file_id: String,
    pub filename: String,
    pub size_bytes: i64,
    pub storage_address: String,
}

// ---------------------------------------------------------------------------
// Storage node surface
// ---------------------------------------------------------------------------

/// Opens a chunk stream for one file on a storage node.
///
/// First message on a new connection. The token is checked here, once per
/// connection; chunks themselves carry no credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOpenRequest {
    pub file_id: String,
    pub size_bytes: i64,
    pub token: String,
}

/// Durability watermark for one file.
///
/// The reply to `stream_open` and `query_offset`, and the payload of
/// periodic `transfer_status` pushes. The first status on a new connection
/// is the authoritative resume point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    pub file_id: String,
    /// Bytes durably persisted so far; non-decreasing per file.
    pub offset: i64,
}

/// Finalizes an upload. Payload of `complete_upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub file_id: String,
}

/// Acknowledges a finished upload. Payload of `upload_complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub file_id: String,
    /// Final persisted offset; equals the file size.
    pub offset: i64,
}

/// Asks for the current persisted offset. Payload of `query_offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetQuery {
    pub file_id: String,
}

/// Discards an in-progress upload. Payload of `cancel_upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub file_id: String,
}

/// Acknowledges a cancelled upload. Payload of `upload_cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub file_id: String,
}
