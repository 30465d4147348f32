//! The storage node's upload handler.
//!
//! Each WebSocket connection carries at most one file's chunk stream, bound
//! by the `stream_open` handshake. The handshake checks the upload token
//! (once per connection; chunks carry no credentials) and replies with the
//! file's persisted offset, which is the uploader's authoritative resume
//! point. Chunks below that offset are duplicates from a prior attempt and
//! are ignored; chunks above it are protocol violations and abort the
//! stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use packmule_protocol::auth;
use packmule_protocol::constants::{
    ERR_CODE_BAD_REQUEST, ERR_CODE_CONFLICT, ERR_CODE_INTERNAL, ERR_CODE_NOT_FOUND,
    ERR_CODE_UNAUTHORIZED, MessageType,
};
use packmule_protocol::envelope::Message;
use packmule_protocol::frame::ChunkFrameHeader;
use packmule_protocol::messages::{
    CancelRequest, CancelResponse, CompleteRequest, CompleteResponse, OffsetQuery,
    StreamOpenRequest, TransferStatus,
};
use packmule_registry::{ChunkDisposition, RegistryError, SessionRegistry};
use packmule_server::{Handler, HandlerFuture, Sender};
use packmule_transfer::checksum_bytes;

use crate::{BlobStore, StorageConfig};

/// Bookkeeping for the connection currently streaming a file.
struct ActiveStream {
    conn_id: u64,
    sender: Sender,
    chunks_since_status: u32,
    last_status: Instant,
}

/// The storage node service.
pub struct StorageNode {
    config: StorageConfig,
    registry: Arc<SessionRegistry>,
    store: BlobStore,
    /// file_id -> the connection allowed to stream it. A new `stream_open`
    /// for an already-active file supersedes the old connection.
    active: Mutex<HashMap<String, ActiveStream>>,
}

impl StorageNode {
    pub fn new(config: StorageConfig) -> Self {
        let store = BlobStore::new(config.root.clone());
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            store,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// The session registry (shared with the expiry sweeper).
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Spawns the background task that evicts idle sessions.
    ///
    /// Durable bytes survive eviction: the blob remains on disk and the
    /// resume offset is re-derived from its length on the next stream open.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = node.registry.purge_expired(node.config.session_ttl);
                        if evicted > 0 {
                            tracing::debug!(evicted, "expired sessions evicted");
                        }
                    }
                }
            }
        })
    }

    /// Returns the connection id registered for `file_id`, if any.
    fn active_conn(&self, file_id: &str) -> Option<u64> {
        self.active.lock().unwrap().get(file_id).map(|a| a.conn_id)
    }

    /// Registers `sender` as the active stream for `file_id`, superseding
    /// (and closing) any previous connection.
    fn register_stream(&self, file_id: &str, sender: &Sender) {
        let mut map = self.active.lock().unwrap();
        if let Some(old) = map.insert(
            file_id.to_string(),
            ActiveStream {
                conn_id: sender.id(),
                sender: sender.clone(),
                chunks_since_status: 0,
                last_status: Instant::now(),
            },
        ) && old.conn_id != sender.id()
        {
            tracing::warn!(
                file_id,
                old_conn = old.conn_id,
                new_conn = sender.id(),
                "superseding active stream"
            );
            old.sender.close();
        }
    }

    /// Drops the active-stream entry for `file_id` if it belongs to `conn_id`.
    fn unregister_stream(&self, file_id: &str, conn_id: u64) {
        let mut map = self.active.lock().unwrap();
        if map.get(file_id).is_some_and(|a| a.conn_id == conn_id) {
            map.remove(file_id);
        }
    }

    /// Decides whether a status record is due after an in-sequence chunk.
    fn status_due(&self, file_id: &str) -> bool {
        let mut map = self.active.lock().unwrap();
        let Some(entry) = map.get_mut(file_id) else {
            return false;
        };
        entry.chunks_since_status += 1;
        if entry.chunks_since_status >= self.config.status_every_chunks
            || entry.last_status.elapsed() >= self.config.status_interval
        {
            entry.chunks_since_status = 0;
            entry.last_status = Instant::now();
            true
        } else {
            false
        }
    }

    /// Pushes an unsolicited `transfer_status` record.
    fn push_status(&self, sender: &Sender, file_id: &str, offset: i64) {
        let status = TransferStatus {
            file_id: file_id.to_string(),
            offset,
        };
        if let Ok(msg) = Message::new(
            uuid::Uuid::new_v4().to_string(),
            MessageType::TransferStatus,
            Some(&status),
        ) {
            let _ = sender.send_msg(msg);
        }
    }

    /// Sends an error push and tears the stream down. One policy for every
    /// protocol violation: reject and abort.
    fn abort_stream(&self, sender: &Sender, file_id: &str, code: i32, reason: &str) {
        tracing::error!(file_id, conn = sender.id(), code, reason, "aborting stream");
        let _ = sender.send_msg(Message::error(
            uuid::Uuid::new_v4().to_string(),
            code,
            reason,
        ));
        self.unregister_stream(file_id, sender.id());
        sender.close();
    }

    async fn handle_stream_open(&self, sender: Sender, msg: Message) {
        let Some(req) = parse_req::<StreamOpenRequest>(&sender, &msg) else {
            return;
        };

        if req.size_bytes < 0 {
            let _ = sender.send_error(&msg, ERR_CODE_BAD_REQUEST, "negative file size");
            return;
        }

        if !auth::validate_token(&self.config.token_secret, &req.file_id, &req.token) {
            tracing::warn!(file_id = %req.file_id, conn = sender.id(), "rejected stream: invalid token");
            let _ = sender.send_error(&msg, ERR_CODE_UNAUTHORIZED, "invalid token");
            sender.close();
            return;
        }

        // Recover the resume point: a live registry entry wins, otherwise
        // the blob length (highest offset ever synced) seeds the session.
        let recovered = match self.store.len(&req.file_id).await {
            Ok(len) => len,
            Err(e) => {
                let _ = sender.send_error(&msg, ERR_CODE_INTERNAL, &e.to_string());
                return;
            }
        };
        let offset = match self.registry.open(&req.file_id, req.size_bytes, recovered) {
            Ok(offset) => offset,
            Err(e @ RegistryError::SizeMismatch { .. }) => {
                let _ = sender.send_error(&msg, ERR_CODE_CONFLICT, &e.to_string());
                sender.close();
                return;
            }
            Err(e) => {
                let _ = sender.send_error(&msg, ERR_CODE_INTERNAL, &e.to_string());
                return;
            }
        };

        self.register_stream(&req.file_id, &sender);

        tracing::info!(
            file_id = %req.file_id,
            conn = sender.id(),
            offset,
            size = req.size_bytes,
            "stream opened"
        );

        let status = TransferStatus {
            file_id: req.file_id,
            offset,
        };
        if let Ok(reply) = msg.reply(MessageType::TransferStatus, Some(&status)) {
            let _ = sender.send_msg(reply);
        }
    }

    async fn handle_chunk(&self, sender: Sender, header: ChunkFrameHeader, data: Vec<u8>) {
        let file_id = header.file_id.clone();

        match self.active_conn(&file_id) {
            Some(id) if id == sender.id() => {}
            Some(_) => {
                // A superseded connection still draining its queue.
                tracing::debug!(file_id = %file_id, conn = sender.id(), "dropping chunk from superseded stream");
                return;
            }
            None => {
                self.abort_stream(&sender, &file_id, ERR_CODE_UNAUTHORIZED, "no open stream");
                return;
            }
        }

        let disposition = match self.registry.classify(&file_id, header.offset, data.len()) {
            Ok(d) => d,
            Err(RegistryError::UnknownFile(_)) => {
                self.abort_stream(&sender, &file_id, ERR_CODE_NOT_FOUND, "unknown file");
                return;
            }
            Err(e) => {
                self.abort_stream(&sender, &file_id, ERR_CODE_INTERNAL, &e.to_string());
                return;
            }
        };

        match disposition {
            ChunkDisposition::Duplicate => {
                // Already persisted by a prior attempt. Not re-applied, not
                // an error.
                tracing::debug!(
                    file_id = %file_id,
                    chunk_index = header.chunk_index,
                    offset = header.offset,
                    "skipping duplicate chunk"
                );
            }
            ChunkDisposition::Gap => {
                self.abort_stream(
                    &sender,
                    &file_id,
                    ERR_CODE_CONFLICT,
                    &format!(
                        "chunk gap: offset {} is ahead of persisted offset {}",
                        header.offset,
                        self.registry.offset(&file_id).unwrap_or(0)
                    ),
                );
            }
            ChunkDisposition::Overrun => {
                self.abort_stream(
                    &sender,
                    &file_id,
                    ERR_CODE_CONFLICT,
                    &format!("chunk at offset {} overruns declared size", header.offset),
                );
            }
            ChunkDisposition::InSequence => {
                if self.config.verify_checksums
                    && !header.checksum.is_empty()
                    && checksum_bytes(&data) != header.checksum
                {
                    self.abort_stream(
                        &sender,
                        &file_id,
                        ERR_CODE_BAD_REQUEST,
                        &format!("checksum mismatch at offset {}", header.offset),
                    );
                    return;
                }

                if let Err(e) = self.store.write_at(&file_id, header.offset, &data).await {
                    self.abort_stream(&sender, &file_id, ERR_CODE_INTERNAL, &e.to_string());
                    return;
                }

                let new_offset = header.offset + data.len() as i64;
                if let Err(e) = self.registry.advance(&file_id, new_offset) {
                    self.abort_stream(&sender, &file_id, ERR_CODE_INTERNAL, &e.to_string());
                    return;
                }

                if self.status_due(&file_id) {
                    self.push_status(&sender, &file_id, new_offset);
                }
            }
        }
    }

    async fn handle_complete(&self, sender: Sender, msg: Message) {
        let Some(req) = parse_req::<CompleteRequest>(&sender, &msg) else {
            return;
        };

        if self.active_conn(&req.file_id) != Some(sender.id()) {
            let _ = sender.send_error(&msg, ERR_CODE_UNAUTHORIZED, "no open stream");
            return;
        }

        match self.registry.complete(&req.file_id) {
            Ok(offset) => {
                self.unregister_stream(&req.file_id, sender.id());
                tracing::info!(file_id = %req.file_id, bytes = offset, "upload completed");
                let resp = CompleteResponse {
                    file_id: req.file_id,
                    offset,
                };
                if let Ok(reply) = msg.reply(MessageType::UploadComplete, Some(&resp)) {
                    let _ = sender.send_msg(reply);
                }
            }
            Err(e @ RegistryError::Incomplete { .. }) => {
                let _ = sender.send_error(&msg, ERR_CODE_CONFLICT, &e.to_string());
            }
            Err(RegistryError::UnknownFile(_)) => {
                let _ = sender.send_error(&msg, ERR_CODE_NOT_FOUND, "unknown file");
            }
            Err(e) => {
                let _ = sender.send_error(&msg, ERR_CODE_INTERNAL, &e.to_string());
            }
        }
    }

    async fn handle_query_offset(&self, sender: Sender, msg: Message) {
        let Some(req) = parse_req::<OffsetQuery>(&sender, &msg) else {
            return;
        };

        // Only the authenticated stream connection may query.
        if self.active_conn(&req.file_id) != Some(sender.id()) {
            let _ = sender.send_error(&msg, ERR_CODE_UNAUTHORIZED, "no open stream");
            return;
        }

        let offset = match self.registry.offset(&req.file_id) {
            Some(offset) => offset,
            None => match self.store.len(&req.file_id).await {
                Ok(len) => len,
                Err(e) => {
                    let _ = sender.send_error(&msg, ERR_CODE_INTERNAL, &e.to_string());
                    return;
                }
            },
        };

        let status = TransferStatus {
            file_id: req.file_id,
            offset,
        };
        if let Ok(reply) = msg.reply(MessageType::TransferStatus, Some(&status)) {
            let _ = sender.send_msg(reply);
        }
    }

    async fn handle_cancel(&self, sender: Sender, msg: Message) {
        let Some(req) = parse_req::<CancelRequest>(&sender, &msg) else {
            return;
        };

        if self.active_conn(&req.file_id) != Some(sender.id()) {
            let _ = sender.send_error(&msg, ERR_CODE_UNAUTHORIZED, "no open stream");
            return;
        }

        self.unregister_stream(&req.file_id, sender.id());
        self.registry.remove(&req.file_id);
        if let Err(e) = self.store.remove(&req.file_id).await {
            let _ = sender.send_error(&msg, ERR_CODE_INTERNAL, &e.to_string());
            return;
        }

        tracing::info!(file_id = %req.file_id, "upload cancelled, partial data discarded");
        let resp = CancelResponse {
            file_id: req.file_id,
        };
        if let Ok(reply) = msg.reply(MessageType::UploadCancelled, Some(&resp)) {
            let _ = sender.send_msg(reply);
        }
    }
}

impl Handler for StorageNode {
    fn on_stream_open(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.handle_stream_open(sender, msg))
    }

    fn on_chunk_frame(
        &self,
        sender: Sender,
        header: ChunkFrameHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        Box::pin(self.handle_chunk(sender, header, data))
    }

    fn on_complete_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.handle_complete(sender, msg))
    }

    fn on_query_offset(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.handle_query_offset(sender, msg))
    }

    fn on_cancel_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.handle_cancel(sender, msg))
    }

    fn on_disconnected(&self, sender: Sender) -> HandlerFuture<'_> {
        Box::pin(async move {
            let mut map = self.active.lock().unwrap();
            map.retain(|file_id, entry| {
                let keep = entry.conn_id != sender.id();
                if !keep {
                    // The session stays in the registry; it is the resume
                    // point for the next connection.
                    tracing::info!(file_id = %file_id, conn = sender.id(), "stream connection lost");
                }
                keep
            });
        })
    }
}

/// Parses a request payload, replying 400 on failure.
fn parse_req<T: serde::de::DeserializeOwned>(sender: &Sender, msg: &Message) -> Option<T> {
    match msg.parse_payload::<T>() {
        Ok(Some(req)) => Some(req),
        _ => {
            let _ = sender.send_error(msg, ERR_CODE_BAD_REQUEST, "missing or malformed payload");
            None
        }
    }
}
