use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use packmule_protocol::constants::DEFAULT_CHUNK_SIZE;

use crate::TransferError;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub async fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// ChunkSource
// ---------------------------------------------------------------------------

/// A chunk of file data ready to send.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub file_id: String,
    /// 0-based sequential index: `offset / chunk_size`.
    pub chunk_index: i64,
    /// Byte offset of the chunk start within the file.
    pub offset: i64,
    pub data: Vec<u8>,
    /// SHA-256 hex digest of `data`.
    pub checksum: String,
}

/// Reads a file as an ordered, finite sequence of chunks.
///
/// The sequence is lazy and non-restartable: create a fresh source (seeked
/// to the new resume offset) for every transfer attempt. The underlying file
/// handle is owned by the source and closed when it is dropped, on every
/// exit path.
pub struct ChunkSource {
    file: File,
    file_id: String,
    chunk_size: usize,
    offset: i64,
    chunk_index: i64,
    file_size: i64,
}

impl ChunkSource {
    /// Opens `path` for chunked reading from offset 0.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub async fn open(
        path: &Path,
        file_id: impl Into<String>,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        let file = File::open(path).await?;
        let file_size = file.metadata().await?.len() as i64;
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Ok(Self {
            file,
            file_id: file_id.into(),
            chunk_size,
            offset: 0,
            chunk_index: 0,
            file_size,
        })
    }

    /// Seeks to the given byte offset (the resume point).
    ///
    /// The chunk index is re-derived as `offset / chunk_size`, so resumed
    /// sequences continue the original numbering.
    pub async fn seek_to(&mut self, offset: i64) -> Result<(), TransferError> {
        if offset < 0 || offset > self.file_size {
            return Err(TransferError::OffsetOutOfBounds {
                offset,
                size: self.file_size,
            });
        }
        self.file.seek(SeekFrom::Start(offset as u64)).await?;
        self.offset = offset;
        self.chunk_index = offset / self.chunk_size as i64;
        Ok(())
    }

    /// Reads the next chunk. Returns `None` when the file is exhausted.
    ///
    /// Chunks are contiguous and strictly increasing; all are `chunk_size`
    /// bytes except possibly the last.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let remaining = self.file_size - self.offset;
        if remaining <= 0 {
            return Ok(None);
        }

        let want = std::cmp::min(remaining as usize, self.chunk_size);
        let mut buf = vec![0u8; want];
        self.file.read_exact(&mut buf).await?;

        let checksum = checksum_bytes(&buf);
        let chunk = Chunk {
            file_id: self.file_id.clone(),
            chunk_index: self.chunk_index,
            offset: self.offset,
            data: buf,
            checksum,
        };
        self.offset += want as i64;
        self.chunk_index += 1;
        Ok(Some(chunk))
    }

    /// Current byte offset.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> i64 {
        self.file_size
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> i64 {
        self.file_size - self.offset
    }
}
