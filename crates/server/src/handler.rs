//! Handler trait for processing incoming messages.
//!
//! Implementors provide domain logic (the master's allocation, the storage
//! node's chunk ingestion) while the server core handles connection
//! management, routing, and the binary frame format.

use std::future::Future;
use std::pin::Pin;

use packmule_protocol::constants::ERR_CODE_NOT_IMPLEMENTED;
use packmule_protocol::envelope::Message;
use packmule_protocol::frame::ChunkFrameHeader;

use crate::connection::Sender;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling messages from a connected peer.
///
/// The server dispatches parsed messages to the appropriate method. Each
/// method receives a `sender` for responses/pushes and the parsed envelope
/// (or frame). Default implementations reply "not implemented", so a
/// service only overrides the message types it serves.
pub trait Handler: Send + Sync + 'static {
    /// Called for `request_upload` (master surface).
    fn on_request_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `query_file` (master surface).
    fn on_query_file(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `stream_open` (storage surface). The handler must reply
    /// with the file's current persisted offset before consuming any chunk.
    fn on_stream_open(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `complete_upload` (storage surface).
    fn on_complete_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `query_offset` (storage surface).
    fn on_query_offset(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `cancel_upload` (storage surface).
    fn on_cancel_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `ping` messages.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) =
                msg.reply(packmule_protocol::MessageType::Pong, Option::<&()>::None)
            {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for a binary chunk frame.
    fn on_chunk_frame(
        &self,
        sender: Sender,
        header: ChunkFrameHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        let _ = (header, data);
        Box::pin(async move {
            // Binary frames carry no request id; log and drop.
            tracing::warn!(conn = sender.id(), "chunk frame received but handler not implemented");
        })
    }

    /// Called when a peer disconnects (cleanup hook).
    fn on_disconnected(&self, sender: Sender) -> HandlerFuture<'_> {
        let _ = sender;
        Box::pin(async {})
    }
}
