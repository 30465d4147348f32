//! Per-connection plumbing: read/write pumps, ping/pong, send buffering.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use packmule_protocol::constants::{
    ERR_CODE_NOT_IMPLEMENTED, MessageType, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use packmule_protocol::envelope::Message;
use packmule_protocol::frame::parse_chunk_frame;

use crate::SEND_BUFFER_SIZE;
use crate::handler::Handler;

/// Monotonic connection id source, for logging and handler bookkeeping.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Handle for sending messages to a connected peer.
///
/// Cloneable and cheap. Carries the connection id so handlers can tell
/// connections apart (e.g. when a new stream supersedes an old one for the
/// same file).
#[derive(Clone)]
pub struct Sender {
    id: u64,
    tx: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
}

impl Sender {
    /// The connection's id. Stable for the connection lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` only if the send buffer is full or the peer is gone.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!(conn = self.id, "send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Tears the connection down (both pumps stop).
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Spawns the read and write pumps for an accepted WebSocket connection.
///
/// The pumps run as background tokio tasks and stop when the peer
/// disconnects, the handler closes the connection, or `server_cancel`
/// fires. Returns the connection's [`Sender`].
pub fn spawn_connection<S, H>(
    ws_stream: S,
    remote_addr: String,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> Sender
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender {
        id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
        tx,
        cancel: cancel.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    // Write pump.
    let write_cancel = cancel.clone();
    tokio::spawn(write_pump(ws_sink, rx, write_cancel));

    // Read pump.
    let read_cancel = cancel.clone();
    let read_sender = sender.clone();
    tokio::spawn(async move {
        read_pump(ws_stream, read_sender.clone(), handler.clone(), read_cancel.clone()).await;
        // When the read pump exits, stop the write pump too.
        read_cancel.cancel();
        handler.on_disconnected(read_sender).await;
        tracing::info!(peer = %remote_addr, "peer disconnected");
    });

    sender
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Flush anything already queued (e.g. the error reply that
                // triggered the close) before dropping the connection.
                while let Ok(ws_msg) = rx.try_recv() {
                    if sink.send(ws_msg).await.is_err() {
                        break;
                    }
                }
                break;
            }

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches to the handler.
///
/// Any incoming frame resets the read deadline; if nothing arrives within
/// [`WS_PONG_WAIT`] the connection is considered dead.
async fn read_pump<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut alive = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !alive {
                    tracing::warn!(conn = sender.id(), "read deadline exceeded, closing connection");
                    break;
                }
                alive = false;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        alive = true;
                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                dispatch_text(&handler, &sender, &text).await;
                            }
                            WsMessage::Binary(data) => {
                                if data.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("binary frame exceeds max size ({} > {})", data.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                dispatch_binary(&handler, &sender, &data).await;
                            }
                            WsMessage::Ping(data) => {
                                // Auto-respond to peer pings.
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Pong(_) => {}
                            WsMessage::Close(_) => {
                                tracing::debug!(conn = sender.id(), "received close frame");
                                break;
                            }
                            WsMessage::Frame(_) => {} // Raw frames ignored.
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                }
            }
        }
    }
}

/// Dispatches a text (JSON) message to the appropriate handler method.
async fn dispatch_text<H: Handler>(handler: &Arc<H>, sender: &Sender, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("invalid message JSON: {e}");
            return;
        }
    };

    let s = sender.clone();
    match msg.msg_type {
        MessageType::RequestUpload => handler.on_request_upload(s, msg).await,
        MessageType::QueryFile => handler.on_query_file(s, msg).await,
        MessageType::StreamOpen => handler.on_stream_open(s, msg).await,
        MessageType::CompleteUpload => handler.on_complete_upload(s, msg).await,
        MessageType::QueryOffset => handler.on_query_offset(s, msg).await,
        MessageType::CancelUpload => handler.on_cancel_upload(s, msg).await,
        MessageType::Ping => handler.on_ping(s, msg).await,
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
            let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "unknown message type");
        }
    }
}

/// Dispatches a binary WebSocket frame (a chunk) to the handler.
async fn dispatch_binary<H: Handler>(handler: &Arc<H>, sender: &Sender, data: &[u8]) {
    match parse_chunk_frame(data) {
        Ok((header, payload)) => {
            handler.on_chunk_frame(sender.clone(), header, payload).await;
        }
        Err(e) => {
            tracing::error!("failed to parse chunk frame: {e}");
        }
    }
}
