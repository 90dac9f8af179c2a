//! WebSocket relay server implementation
//!
//! Listens on a configurable address, binds each accepted connection to the
//! room named in its handshake query, and runs one relay loop per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::{accept_hdr_async_with_config, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::connection::{CloseRequest, ConnectionHandle, Outbound, PeerConnection, RoomId};
use super::handler::{ConnectionHandler, FrameOutcome};
use super::protocol::{
    CLOSE_GOING_AWAY, CLOSE_SEND_FAILURE, DEFAULT_MAX_CONTENT_LENGTH, ROOM_QUERY_PARAM,
};
use super::registry::ConnectionRegistry;

/// Configuration for the relay server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Upper bound on a single socket write
    pub send_timeout: Duration,
    /// Per-connection outbound queue capacity
    pub outbound_queue: usize,
    /// Maximum accepted message content length in bytes
    pub max_message_bytes: usize,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            send_timeout: Duration::from_secs(5),
            outbound_queue: 256,
            max_message_bytes: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }

    /// Set the per-write timeout
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Set the per-connection queue capacity
    pub fn with_outbound_queue(mut self, capacity: usize) -> Self {
        self.outbound_queue = capacity.max(1);
        self
    }

    /// Set the maximum content length
    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        // Leave room for the JSON envelope around the content.
        config.max_message_size = Some(self.max_message_bytes.saturating_mul(2));
        config
    }
}

/// WebSocket relay server
pub struct RelayServer {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new relay server with an empty registry
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown_tx,
        }
    }

    /// Shared connection registry
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    ///
    /// On shutdown every open connection is closed with 1001 and the
    /// registry is cleared before this returns.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Relay listening on ws://{}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let config = Arc::clone(&self.config);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            let _ = connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, registry, config, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping relay");
                    break;
                }
            }
        }

        self.registry.shutdown_all().await;

        if !connections.is_empty() {
            info!("Waiting for {} connections to close...", connections.len());
        }
        let drain = async { while connections.join_next().await.is_some() {} };
        if timeout(self.config.send_timeout, drain).await.is_err() {
            warn!("Aborting connections that did not close in time");
            connections.shutdown().await;
        }

        Ok(())
    }
}

/// Extract the room identifier from the handshake query string
fn room_from_request(request: &Request) -> Option<RoomId> {
    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == ROOM_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
        .map(RoomId::new)
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Run the relay loop for a single connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    config: Arc<ServerConfig>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    debug!("New connection from {}", peer_addr);

    let mut bound_room = None;
    let handshake = accept_hdr_async_with_config(
        stream,
        |request: &Request, response: Response| match room_from_request(request) {
            Some(room) => {
                bound_room = Some(room);
                Ok(response)
            }
            None => Err(reject(
                StatusCode::BAD_REQUEST,
                "missing conversationId query parameter",
            )),
        },
        Some(config.websocket_config()),
    )
    .await;

    let (ws_stream, room) = match (handshake, bound_room) {
        (Ok(ws_stream), Some(room)) => (ws_stream, room),
        (Ok(_), None) => return Ok(()),
        (Err(e), None) => {
            warn!("Rejected handshake from {}: {}", peer_addr, e);
            return Ok(());
        }
        (Err(e), Some(_)) => return Err(e.into()),
    };

    let (tx, rx) = mpsc::channel(config.outbound_queue);
    let peer = Arc::new(PeerConnection::new(room.clone(), tx));
    let connection_id = peer.id();
    let (sink, mut stream) = ws_stream.split();
    let (close_tx, close_rx) = oneshot::channel();

    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        close_rx,
        Arc::clone(&peer),
        config.send_timeout,
    ));

    let _ = peer.mark_open();
    registry.register(&room, connection_id, peer.clone()).await;
    info!(
        "Connection {} from {} bound to room {}",
        connection_id, peer_addr, room
    );

    let handler = ConnectionHandler::new(
        connection_id,
        room.clone(),
        Arc::clone(&registry),
        config.max_message_bytes,
    );

    let close = loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let FrameOutcome::Relayed { message_id, outcome } = handler.handle_text(&text).await {
                            debug!(
                                "Message {} in room {}: {} delivered, {} dropped, {} evicted",
                                message_id, room, outcome.delivered, outcome.dropped, outcome.evicted
                            );
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", connection_id, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        peer.pong(data);
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Client {} requested close: {:?}", connection_id, frame);
                        break None;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", connection_id, e);
                        break None;
                    }
                    None => {
                        debug!("Stream from {} ended", connection_id);
                        break None;
                    }
                }
            }
            _ = peer.close_requested() => {
                break peer.take_close_request();
            }
            _ = shutdown_rx.recv() => {
                break Some(CloseRequest {
                    code: CLOSE_GOING_AWAY,
                    reason: "relay shutting down".to_string(),
                });
            }
        }
    };

    if peer.finish() {
        let _ = registry.unregister(&room, connection_id).await;
    }
    let _ = close_tx.send(close);
    if let Err(e) = writer.await {
        warn!("Writer task for {} failed: {}", connection_id, e);
    }

    info!("Connection {} from {} closed", connection_id, peer_addr);
    Ok(())
}

/// Drain a connection's outbound queue onto its socket
///
/// Owns the write half; it is released exactly once, when this returns.
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    mut close_rx: oneshot::Receiver<Option<CloseRequest>>,
    peer: Arc<PeerConnection>,
    send_timeout: Duration,
) {
    let mut failed = false;

    let close = loop {
        tokio::select! {
            biased;
            close = &mut close_rx => break close.ok().flatten(),
            outbound = rx.recv(), if !failed => {
                let message = match outbound {
                    Some(Outbound::Payload(payload)) => Message::Text(payload.to_string()),
                    Some(Outbound::Pong(data)) => Message::Pong(data),
                    None => break None,
                };

                match timeout(send_timeout, sink.send(message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Send to {} failed: {}", peer.id(), e);
                        failed = true;
                        peer.close(CLOSE_SEND_FAILURE, "send failure");
                    }
                    Err(_) => {
                        warn!("Send to {} timed out after {:?}", peer.id(), send_timeout);
                        failed = true;
                        peer.close(CLOSE_SEND_FAILURE, "send timeout");
                    }
                }
            }
        }
    };

    if failed {
        return;
    }

    let frame = close.map(|request| CloseFrame {
        code: CloseCode::from(request.code),
        reason: request.reason.into(),
    });
    match timeout(send_timeout, sink.send(Message::Close(frame))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Close handshake with {} ended: {}", peer.id(), e),
        Err(_) => debug!("Close frame to {} timed out", peer.id()),
    }
}
