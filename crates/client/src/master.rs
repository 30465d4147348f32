//! One-shot client for the master's allocation surface.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use packmule_protocol::constants::{MessageType, WS_MAX_MESSAGE_SIZE};
use packmule_protocol::envelope::Message;
use packmule_protocol::messages::{FileHandle, FileMetadata};

use crate::{ClientConfig, ClientError};

/// Client for the master service.
///
/// The master is consulted once per file, not per retry, so the client
/// holds no connection state: it connects, asks, and hangs up.
pub struct MasterClient;

impl MasterClient {
    /// Requests an upload allocation and returns the handle.
    ///
    /// Allocation is not idempotent: calling this again yields a fresh
    /// handle. Callers pin the first handle they receive and reuse it for
    /// every resume attempt.
    pub async fn request_upload(
        master_url: &str,
        meta: &FileMetadata,
        config: &ClientConfig,
    ) -> Result<FileHandle, ClientError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

        let connect =
            tokio_tungstenite::connect_async_with_config(master_url, Some(ws_config), false);
        let (mut ws, _) = match tokio::time::timeout(config.connect_timeout, connect).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ClientError::Timeout),
        };

        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, MessageType::RequestUpload, Some(meta))?;
        ws.send(WsMessage::Text(serde_json::to_string(&msg)?.into()))
            .await?;

        let reply = tokio::time::timeout(config.request_timeout, async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Ok(reply) = serde_json::from_str::<Message>(&text)
                            && reply.id == id
                        {
                            return Ok(reply);
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Err(ClientError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ClientError::Ws(e)),
                }
            }
        })
        .await
        .map_err(|_| ClientError::Timeout)??;

        let _ = ws.close(None).await;

        if let Some(err) = reply.error {
            return Err(ClientError::Rejected {
                code: err.code,
                message: err.message,
            });
        }

        let handle: FileHandle = reply
            .parse_payload()?
            .ok_or_else(|| ClientError::ProtocolViolation("empty upload_granted reply".into()))?;

        tracing::info!(
            file_id = %handle.file_id,
            storage = %handle.storage_address,
            "upload granted"
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_upload_against_dead_port_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let meta = FileMetadata {
            filename: "x.bin".into(),
            size_bytes: 10,
        };
        let config = ClientConfig {
            connect_timeout: std::time::Duration::from_millis(500),
            ..ClientConfig::default()
        };
        let result =
            MasterClient::request_upload(&format!("ws://127.0.0.1:{port}"), &meta, &config).await;
        assert!(result.err().unwrap().is_retryable());
    }
}
