//! Wire protocol for packmule.
//!
//! Three parties speak this protocol over WebSocket:
//! - the **master**, which allocates upload sessions and routes uploaders
//!   to storage nodes,
//! - a **storage node**, which ingests file chunks and acknowledges the
//!   durably persisted offset,
//! - the **uploader**, which drives the transfer and resumes it after
//!   interruptions.
//!
//! Control messages are JSON text frames wrapped in the [`envelope::Message`]
//! envelope; chunk data travels as binary frames (see [`frame`]).

pub mod auth;
pub mod constants;
pub mod envelope;
pub mod frame;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{ErrorBody, Message};
pub use frame::{ChunkFrameHeader, encode_chunk_frame, parse_chunk_frame};
pub use messages::{FileHandle, FileMetadata, TransferStatus};
