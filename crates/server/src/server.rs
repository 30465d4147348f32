//! WebSocket listener and accept loop.
//!
//! Unlike a point-to-point deployment link, a packmule service serves many
//! peers at once (one upload per connection), so every accepted connection
//! gets its own pump tasks. Per-file "who is the active stream" bookkeeping
//! belongs to the storage handler, not the listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use packmule_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::ServerError;
use crate::connection::spawn_connection;
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 0 }
    }
}

/// A WebSocket server dispatching connections to a [`Handler`].
pub struct WsServer<H: Handler> {
    listener: TcpListener,
    handler: Arc<H>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

impl<H: Handler> WsServer<H> {
    /// Binds the listening socket. The server does not accept connections
    /// until [`run`](Self::run) is called.
    pub async fn bind(config: ServerConfig, handler: H) -> Result<Arc<Self>, ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Arc::new(Self {
            listener,
            handler: Arc::new(handler),
            cancel: CancellationToken::new(),
            local_addr,
        }))
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The handler shared by all connections.
    pub fn handler(&self) -> Arc<H> {
        Arc::clone(&self.handler)
    }

    /// Gracefully shuts down the server and all connections.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        tracing::info!(addr = %self.local_addr, "server listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades a TCP connection to WebSocket and spawns its pumps.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        // WebSocket upgrade with size limits matching the protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let sender = spawn_connection(
            ws_stream,
            peer_addr.to_string(),
            self.handler(),
            self.cancel.clone(),
        );
        tracing::info!(%peer_addr, conn = sender.id(), "WebSocket connection established");

        Ok(())
    }
}
