//! Binary chunk frames: 4-byte big-endian header length + JSON header + raw bytes.
//!
//! Chunk payloads travel as WebSocket binary frames so the data bytes are
//! never JSON-escaped. Each frame carries exactly one chunk.

use serde::{Deserialize, Serialize};

/// Header for a binary chunk frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFrameHeader {
    pub file_id: String,
    /// 0-based sequential index. Informational; the receiver trusts `offset`
    /// for placement.
    pub chunk_index: i64,
    /// Byte position of the chunk start within the file.
    pub offset: i64,
    /// SHA-256 hex digest of the payload (empty disables verification).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

/// Encodes a chunk frame for sending over WebSocket.
pub fn encode_chunk_frame(
    header: &ChunkFrameHeader,
    data: &[u8],
) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + data.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(data);
    Ok(buf)
}

/// Parses a raw binary WebSocket frame into a header and payload.
pub fn parse_chunk_frame(data: &[u8]) -> Result<(ChunkFrameHeader, Vec<u8>), FrameError> {
    if data.len() < 4 {
        return Err(FrameError::TooShort);
    }

    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if data.len() < 4 + header_len {
        return Err(FrameError::HeaderTruncated {
            expected: header_len,
            got: data.len() - 4,
        });
    }

    let header: ChunkFrameHeader = serde_json::from_slice(&data[4..4 + header_len])
        .map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    let payload = data[4 + header_len..].to_vec();

    Ok((header, payload))
}

/// Errors from chunk frame parsing.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short (need at least 4 bytes)")]
    TooShort,

    #[error("frame header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid frame header JSON: {0}")]
    InvalidJson(String),
}
