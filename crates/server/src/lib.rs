//! WebSocket server core for packmule services.
//!
//! Both the master and the storage node accept connections over WebSocket,
//! dispatch JSON envelopes and binary chunk frames to a [`Handler`], and
//! manage connection lifecycle (ping/pong, graceful shutdown). This crate
//! holds the machinery they share; domain logic lives in the handlers.

mod connection;
mod handler;
mod server;

pub use connection::{Sender, SendError, spawn_connection};
pub use handler::{Handler, HandlerFuture};
pub use server::{ServerConfig, WsServer};

/// Send buffer capacity per connection.
///
/// During chunk ingestion the storage node pushes status updates in addition
/// to request replies; a small buffer can saturate and cause `try_send()` to
/// silently drop messages.
pub const SEND_BUFFER_SIZE: usize = 1024;

/// Errors produced by the server core.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
