//! Chunked file reading with resume support and progress tracking.
//!
//! [`ChunkSource`] turns a local file plus a resume offset into a lazy,
//! finite sequence of chunks; [`ProgressGauge`] tracks the acknowledged
//! high-water mark and transfer speed across reconnects.

mod chunked;
mod progress;

pub use chunked::{Chunk, ChunkSource, calculate_file_checksum, checksum_bytes};
pub use progress::{ProgressGauge, SpeedCalculator, TransferProgress};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset {offset} outside file bounds [0, {size}]")]
    OffsetOutOfBounds { offset: i64, size: i64 },
}
