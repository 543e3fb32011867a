//! WebSocket live-connection server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── poke ──► Client A
//!             ├── /ws/d/{doc}?clientID=…           │
//! Client B ──┘         │                           ├── poke ──► Client B
//!                      ▼                           │
//!            ┌──────────────────┐      ┌───────────┴───────┐
//!            │    SyncEngine    │      │ ConnectionRegistry │
//!            │  (push / pull)   │      │ (one conn/client)  │
//!            └──────────────────┘      └───────────────────┘
//! ```
//!
//! A connection registers under its client id, then sits in a select loop:
//! incoming frames may mirror push/pull requests over the socket, and the
//! poke channel delivers "something changed" signals raised by any
//! successful push on the same document. Push and pull stay independent
//! request/response operations; nothing in the loop blocks the fan-out.

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use ripple_sync::engine::SyncEngine;
use ripple_sync::protocol::{MessageType, SocketMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::ConnectionRegistry;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address for the WebSocket listener
    pub ws_addr: String,
    /// Address for the HTTP push/pull listener
    pub http_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_addr: "127.0.0.1:9090".to_string(),
            http_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl ServerConfig {
    /// Build a config from `RIPPLE_WS_ADDR` / `RIPPLE_HTTP_ADDR`,
    /// falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ws_addr: std::env::var("RIPPLE_WS_ADDR").unwrap_or(defaults.ws_addr),
            http_addr: std::env::var("RIPPLE_HTTP_ADDR").unwrap_or(defaults.http_addr),
        }
    }
}

/// The live-connection server.
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    registry: Arc<ConnectionRegistry>,
}

impl SyncServer {
    /// Create a server over a shared engine and connection registry.
    pub fn new(
        config: ServerConfig,
        engine: Arc<SyncEngine>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            config,
            engine,
            registry,
        }
    }

    /// Get the configured WebSocket bind address.
    pub fn ws_addr(&self) -> &str {
        &self.config.ws_addr
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the accept loop forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.ws_addr).await?;
        info!("WebSocket server listening on {}", self.config.ws_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let registry = self.registry.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, registry).await {
                    warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<SyncEngine>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Capture the request path during the handshake
        let mut request_uri = None;
        let mut ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| {
                request_uri = Some(req.uri().to_string());
                Ok(resp)
            },
        )
        .await?;

        let uri = request_uri.unwrap_or_default();
        let (document_id, client_id) = match parse_ws_path(&uri) {
            Ok(ids) => ids,
            Err(reason) => {
                ws_stream.send(Message::text(reason)).await?;
                ws_stream.send(Message::Close(None)).await?;
                return Ok(());
            }
        };

        info!("client {client_id} connected to document {document_id} from {addr}");

        let (connection_id, mut poke_rx) = registry.register(&client_id, &document_id).await;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Pokes carry no state; encode the frame once
        let poke_frame = SocketMessage::poke(&document_id).encode()?;

        loop {
            tokio::select! {
                // Incoming WebSocket frame
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let frame = match SocketMessage::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    // Malformed frames are dropped, not fatal
                                    warn!("client {client_id}: undecodable frame: {e}");
                                    continue;
                                }
                            };

                            match frame.msg_type {
                                MessageType::PushReq => {
                                    match frame.push_request() {
                                        Ok(push) => match engine.push(&document_id, &push).await {
                                            Ok(outcome) => {
                                                debug!(
                                                    "client {client_id}: socket push applied {} mutation(s)",
                                                    outcome.applied
                                                );
                                                registry.poke(&document_id).await;
                                            }
                                            Err(e) => {
                                                warn!("client {client_id}: push failed: {e}");
                                            }
                                        },
                                        Err(e) => warn!("client {client_id}: bad push payload: {e}"),
                                    }
                                }

                                MessageType::PullReq => {
                                    match frame.pull_request() {
                                        Ok(pull) => match engine.pull(&document_id, &pull) {
                                            Ok(resp) => {
                                                let reply = SocketMessage::pull_resp(
                                                    &pull.client_id,
                                                    &document_id,
                                                    &resp,
                                                );
                                                ws_sender
                                                    .send(Message::Binary(reply.encode()?.into()))
                                                    .await?;
                                            }
                                            Err(e) => {
                                                warn!("client {client_id}: pull failed: {e}");
                                            }
                                        },
                                        Err(e) => warn!("client {client_id}: bad pull payload: {e}"),
                                    }
                                }

                                MessageType::Ping => {
                                    let pong = SocketMessage::pong(&client_id);
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                }

                                other => {
                                    debug!("client {client_id}: unhandled frame type {other:?}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            info!("client {client_id} disconnected");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            warn!("client {client_id}: socket error: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Poke signal from a push on this document
                poke = poke_rx.recv() => {
                    match poke {
                        Some(_) => {
                            ws_sender
                                .send(Message::Binary(poke_frame.clone().into()))
                                .await?;
                        }
                        // Channel closed: a newer connection evicted this one
                        None => {
                            info!("client {client_id}: connection replaced, closing");
                            break;
                        }
                    }
                }
            }
        }

        registry.unregister(&client_id, connection_id).await;
        Ok(())
    }
}

/// Parse `/ws/d/{document_id}?clientID={client_id}` from a request URI.
fn parse_ws_path(uri: &str) -> Result<(String, String), String> {
    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (uri, None),
    };

    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() != 4
        || !segments[0].is_empty()
        || segments[1] != "ws"
        || segments[2] != "d"
        || segments[3].is_empty()
    {
        return Err("invalid url - no document id".to_string());
    }
    let document_id = segments[3].to_string();

    let client_id = query
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("clientID="))
        })
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| "invalid url - no client ID".to_string())?;

    Ok((document_id, client_id))
}
