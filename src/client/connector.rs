//! Reconnecting relay client
//!
//! Connects to one room on the relay, forwards relayed messages to the caller
//! and reconnects after abnormal closures according to a [`ReconnectPolicy`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use super::backoff::{ReconnectDecision, ReconnectPolicy};
use crate::server::{InboundFrame, ProtocolError, RelayedMessage, CLOSE_NORMAL, ROOM_QUERY_PARAM};

/// Errors surfaced by the relay client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Relay rejected the connection with HTTP {0}")]
    Rejected(u16),

    #[error("Gave up after {0} reconnect attempts")]
    AttemptsExhausted(u32),

    #[error("Not connected to the relay")]
    NotConnected,

    #[error("A connection is already in flight")]
    AlreadyRunning,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Connection status observed by callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStatus {
    Idle,
    /// `attempt` counts abnormal closures since the last successful connection
    Connecting { attempt: u32 },
    Open,
    Reconnecting { attempt: u32, delay: Duration },
    Closed,
    /// The attempt ceiling was reached or the relay refused the request
    Failed,
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closure {
    Normal,
    Abnormal(Option<u16>),
}

/// Ends a `run`, even a cancelled one: consumes any close request and clears
/// the in-flight flag
struct InFlight<'a>(&'a RelayClient);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let _ = self.0.closing_tx.send_replace(false);
        self.0.in_flight.store(false, Ordering::Release);
    }
}

/// Client for one relay room
pub struct RelayClient {
    endpoint: Url,
    conversation_id: String,
    policy: ReconnectPolicy,
    in_flight: AtomicBool,
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    status_tx: watch::Sender<ClientStatus>,
    closing_tx: watch::Sender<bool>,
}

impl RelayClient {
    /// Create a client for `conversation_id` on the relay at `base_url`
    pub fn new(
        base_url: &str,
        conversation_id: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Result<Self, ClientError> {
        let conversation_id = conversation_id.into();
        let mut endpoint = Url::parse(base_url)?;
        let _ = endpoint
            .query_pairs_mut()
            .append_pair(ROOM_QUERY_PARAM, &conversation_id);

        let (status_tx, _) = watch::channel(ClientStatus::Idle);
        let (closing_tx, _) = watch::channel(false);

        Ok(Self {
            endpoint,
            conversation_id,
            policy,
            in_flight: AtomicBool::new(false),
            outbound: RwLock::new(None),
            status_tx,
            closing_tx,
        })
    }

    /// Full handshake URL, including the room parameter
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Current status
    pub fn status(&self) -> ClientStatus {
        self.status_tx.borrow().clone()
    }

    /// Watch status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ClientStatus> {
        self.status_tx.subscribe()
    }

    /// Connect and keep the connection alive until closed or exhausted
    ///
    /// Relayed messages are delivered to `events`. Returns `Ok(())` after a
    /// clean close and an error once the relay refuses the request or the
    /// attempt ceiling is reached. Only one call may be in flight at a time.
    pub async fn run(&self, events: mpsc::Sender<RelayedMessage>) -> Result<(), ClientError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Connection to {} already in flight", self.conversation_id);
            return Err(ClientError::AlreadyRunning);
        }
        let _guard = InFlight(self);

        let mut closing = self.closing_tx.subscribe();
        let mut backoff = self.policy.backoff();

        loop {
            self.set_status(ClientStatus::Connecting {
                attempt: backoff.attempts(),
            });
            debug!("Connecting to {}", self.endpoint);

            let connected = tokio::select! {
                result = connect_async(self.endpoint.as_str()) => result,
                _ = closed(&mut closing) => {
                    self.set_status(ClientStatus::Closed);
                    return Ok(());
                }
            };

            let closure = match connected {
                Ok((ws_stream, _)) => {
                    backoff.reset();
                    info!("Connected to room {}", self.conversation_id);
                    self.set_status(ClientStatus::Open);
                    self.drive(ws_stream, &events, &mut closing).await
                }
                Err(WsError::Http(response)) if response.status().is_client_error() => {
                    let status = response.status().as_u16();
                    error!("Relay rejected connection to {}: HTTP {}", self.conversation_id, status);
                    self.set_status(ClientStatus::Failed);
                    return Err(ClientError::Rejected(status));
                }
                Err(e) => {
                    warn!("Failed to connect to relay: {}", e);
                    Closure::Abnormal(None)
                }
            };

            let code = match closure {
                Closure::Normal => {
                    info!("Connection to room {} closed", self.conversation_id);
                    self.set_status(ClientStatus::Closed);
                    return Ok(());
                }
                Closure::Abnormal(code) => code,
            };

            match backoff.on_abnormal_close() {
                ReconnectDecision::Retry { attempt, delay } => {
                    info!(
                        "Connection lost (code {:?}), reconnect attempt {} of {} in {:?}",
                        code, attempt, self.policy.max_attempts, delay
                    );
                    self.set_status(ClientStatus::Reconnecting { attempt, delay });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = closed(&mut closing) => {
                            self.set_status(ClientStatus::Closed);
                            return Ok(());
                        }
                    }
                }
                ReconnectDecision::GiveUp { attempts } => {
                    error!("Max reconnection attempts reached for room {}", self.conversation_id);
                    self.set_status(ClientStatus::Failed);
                    return Err(ClientError::AttemptsExhausted(attempts));
                }
            }
        }
    }

    /// Send a message to the other members of the room
    pub async fn send(
        &self,
        content: impl Into<String>,
        sender_id: impl Into<String>,
    ) -> Result<(), ClientError> {
        let json = InboundFrame::new(content, sender_id)
            .with_conversation(self.conversation_id.clone())
            .to_json()?;

        let outbound = self.outbound.read().await;
        let tx = outbound.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Message::Text(json))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Close the connection with the normal close code; no reconnect follows
    ///
    /// A close requested before `run` starts stops that run before it connects.
    pub fn close(&self) {
        let _ = self.closing_tx.send_replace(true);
    }

    fn set_status(&self, status: ClientStatus) {
        let _ = self.status_tx.send_replace(status);
    }

    /// Pump one open connection until it ends
    async fn drive(
        &self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        events: &mpsc::Sender<RelayedMessage>,
        closing: &mut watch::Receiver<bool>,
    ) -> Closure {
        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.outbound.write().await = Some(tx);

        let closure = loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match RelayedMessage::from_json(&text) {
                            Ok(message) => {
                                if events.send(message).await.is_err() {
                                    debug!("Message receiver dropped, closing");
                                    let _ = sink.send(normal_close("receiver dropped")).await;
                                    break Closure::Normal;
                                }
                            }
                            Err(e) => warn!("Error parsing message: {}", e),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|frame| u16::from(frame.code));
                            break if code == Some(CLOSE_NORMAL) {
                                Closure::Normal
                            } else {
                                Closure::Abnormal(code)
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("WebSocket error: {}", e);
                            break Closure::Abnormal(None);
                        }
                        None => break Closure::Abnormal(None),
                    }
                }
                Some(message) = rx.recv() => {
                    if let Err(e) = sink.send(message).await {
                        warn!("Failed to send message: {}", e);
                        break Closure::Abnormal(None);
                    }
                }
                _ = closed(closing) => {
                    if let Err(e) = sink.send(normal_close("client closing")).await {
                        debug!("Close frame not delivered: {}", e);
                    }
                    break Closure::Normal;
                }
            }
        };

        *self.outbound.write().await = None;
        closure
    }
}

/// Resolve once `close()` has been requested
async fn closed(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closing| *closing).await;
}

fn normal_close(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: reason.into(),
    }))
}
