//! The transfer channel: one WebSocket connection carrying chunks outbound
//! and status records inbound, as two independently progressing flows.
//!
//! A write pump drains a bounded send queue (chunk frames, requests,
//! pings); a read pump routes replies to pending requests and forwards
//! status pushes to the controller over an mpsc channel. Neither direction
//! blocks on the other: a quiet status stream never stalls chunk sending,
//! and a busy chunk queue never delays status consumption.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use packmule_protocol::constants::{
    MessageType, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use packmule_protocol::envelope::Message;
use packmule_protocol::frame::{ChunkFrameHeader, encode_chunk_frame};
use packmule_protocol::messages::{
    CancelRequest, CancelResponse, CompleteRequest, CompleteResponse, OffsetQuery,
    StreamOpenRequest, TransferStatus,
};
use packmule_transfer::Chunk;

use crate::{ClientConfig, ClientError};

/// Send queue capacity (chunk frames + requests).
const SEND_QUEUE_SIZE: usize = 64;

/// Status event queue capacity.
const EVENT_QUEUE_SIZE: usize = 256;

/// Inbound events decoded by the read pump.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A status record: the storage node's durability watermark.
    Status(TransferStatus),
    /// An unsolicited error push (gap, checksum mismatch, ...). The server
    /// aborts the stream after sending one of these.
    Rejected { code: i32, message: String },
    /// The connection ended.
    Closed,
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// An open chunk stream to a storage node.
///
/// Created by [`TransferChannel::open`], which also performs the
/// `stream_open` handshake and returns the server's resume offset.
pub struct TransferChannel {
    write_tx: mpsc::Sender<WsMessage>,
    pending: PendingMap,
    request_timeout: std::time::Duration,
    cancel: CancellationToken,
    read_handle: tokio::task::JoinHandle<()>,
    write_handle: tokio::task::JoinHandle<()>,
}

impl TransferChannel {
    /// Connects to `url`, performs the `stream_open` handshake and returns
    /// the channel, the inbound event stream, and the server's resume
    /// offset (the authoritative resume point, superseding whatever offset
    /// the caller believed).
    pub async fn open(
        url: &str,
        open: &StreamOpenRequest,
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ChannelEvent>, i64), ClientError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

        let connect = tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false);
        let (ws_stream, _) = match tokio::time::timeout(config.connect_timeout, connect).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ClientError::Timeout),
        };
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<WsMessage>(SEND_QUEUE_SIZE);
        let (events_tx, events_rx) = mpsc::channel::<ChannelEvent>(EVENT_QUEUE_SIZE);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(write_pump(write, write_rx, cancel.clone()));
        let read_handle = tokio::spawn(read_pump(
            read,
            pending.clone(),
            events_tx,
            write_tx.clone(),
            cancel.clone(),
        ));

        let channel = Self {
            write_tx,
            pending,
            request_timeout: config.request_timeout,
            cancel,
            read_handle,
            write_handle,
        };

        // Handshake: the reply is the first status record, emitted before
        // the server consumes any chunk.
        let reply = channel
            .request(MessageType::StreamOpen, Some(open))
            .await?;
        let status: TransferStatus = reply
            .parse_payload()?
            .ok_or_else(|| ClientError::ProtocolViolation("empty stream_open reply".into()))?;

        tracing::info!(
            file_id = %status.file_id,
            offset = status.offset,
            "transfer channel open, server resume point received"
        );

        Ok((channel, events_rx, status.offset))
    }

    /// Queues a chunk for sending. Applies backpressure when the write
    /// queue is full; fails only when the connection is gone.
    pub async fn send_chunk(&self, chunk: &Chunk) -> Result<(), ClientError> {
        let header = ChunkFrameHeader {
            file_id: chunk.file_id.clone(),
            chunk_index: chunk.chunk_index,
            offset: chunk.offset,
            checksum: chunk.checksum.clone(),
        };
        let frame = encode_chunk_frame(&header, &chunk.data)?;
        self.write_tx
            .send(WsMessage::Binary(frame.into()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Finalizes the upload. Succeeds only once the storage node has
    /// durably persisted every byte.
    pub async fn complete(&self, file_id: &str) -> Result<CompleteResponse, ClientError> {
        let req = CompleteRequest {
            file_id: file_id.to_string(),
        };
        let reply = self.request(MessageType::CompleteUpload, Some(&req)).await?;
        reply
            .parse_payload()?
            .ok_or_else(|| ClientError::ProtocolViolation("empty upload_complete reply".into()))
    }

    /// Asks for the current persisted offset (the "fresh query" path).
    pub async fn query_offset(&self, file_id: &str) -> Result<TransferStatus, ClientError> {
        let req = OffsetQuery {
            file_id: file_id.to_string(),
        };
        let reply = self.request(MessageType::QueryOffset, Some(&req)).await?;
        reply
            .parse_payload()?
            .ok_or_else(|| ClientError::ProtocolViolation("empty query_offset reply".into()))
    }

    /// Discards the upload on the storage node (partial data is deleted).
    pub async fn cancel_upload(&self, file_id: &str) -> Result<CancelResponse, ClientError> {
        let req = CancelRequest {
            file_id: file_id.to_string(),
        };
        let reply = self.request(MessageType::CancelUpload, Some(&req)).await?;
        reply
            .parse_payload()?
            .ok_or_else(|| ClientError::ProtocolViolation("empty upload_cancelled reply".into()))
    }

    /// Token that tears the channel down when cancelled. Lets the owner of
    /// the event stream close a channel whose handle lives in another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Closes the channel; both pumps stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Sends a request and waits for the correlated reply.
    async fn request<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self
            .write_tx
            .send(WsMessage::Text(json.into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Closed);
        }

        let result = tokio::time::timeout(self.request_timeout, rx).await;

        // Clean up the pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(reply)) => {
                if let Some(err) = &reply.error {
                    return Err(ClientError::Rejected {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
                Ok(reply)
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }
}

impl Drop for TransferChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

/// Write pump: drains the send queue and keeps the connection alive with
/// pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Flush anything already queued before dropping the
                // connection.
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
                            tracing::warn!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::warn!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Read pump: routes replies to pending requests and pushes everything else
/// to the controller's event stream.
async fn read_pump<S>(
    mut stream: S,
    pending: PendingMap,
    events_tx: mpsc::Sender<ChannelEvent>,
    write_tx: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut alive = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !alive {
                    tracing::warn!("read deadline exceeded, closing channel");
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
                                if handle_text(&text, &pending, &events_tx).await.is_err() {
                                    break; // Event receiver gone.
                                }
                            }
                            WsMessage::Ping(data) => {
                                let _ = write_tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Pong(_) => {}
                            WsMessage::Close(_) => {
                                tracing::debug!("received close frame");
                                break;
                            }
                            _ => {} // Binary from the server is not part of the protocol.
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // Wake any in-flight request and tell the controller the stream ended.
    pending.lock().await.clear();
    let _ = events_tx.send(ChannelEvent::Closed).await;
    cancel.cancel();
}

/// Routes one text frame. `Err` means the event receiver hung up.
async fn handle_text(
    text: &str,
    pending: &PendingMap,
    events_tx: &mpsc::Sender<ChannelEvent>,
) -> Result<(), ()> {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("failed to parse message: {e}");
            return Ok(());
        }
    };

    // Replies go to the pending request.
    let mut map = pending.lock().await;
    if let Some(tx) = map.remove(&msg.id) {
        let _ = tx.send(msg);
        return Ok(());
    }
    drop(map);

    // Unsolicited pushes go to the controller.
    match msg.msg_type {
        MessageType::TransferStatus => match msg.parse_payload::<TransferStatus>() {
            Ok(Some(status)) => {
                events_tx
                    .send(ChannelEvent::Status(status))
                    .await
                    .map_err(|_| ())?;
            }
            _ => tracing::warn!("transfer_status push without payload"),
        },
        MessageType::Error => {
            let (code, message) = msg
                .error
                .map(|e| (e.code, e.message))
                .unwrap_or((0, "unknown error".into()));
            events_tx
                .send(ChannelEvent::Rejected { code, message })
                .await
                .map_err(|_| ())?;
        }
        other => {
            tracing::debug!(msg_type = ?other, id = %msg.id, "ignoring unexpected push");
        }
    }
    Ok(())
}
