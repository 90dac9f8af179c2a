//! Per-connection transport handles
//!
//! The registry never touches a socket directly. It holds a [`ConnectionHandle`]
//! per member, which can enqueue payloads, request closure and report state.
//! [`PeerConnection`] is the WebSocket-backed implementation: it feeds a bounded
//! queue drained by the connection's writer task.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Consecutive queue-full drops tolerated before a peer is treated as stalled
pub const MAX_CONSECUTIVE_DROPS: u64 = 100;

/// Unique identifier for an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller-supplied conversation identifier, opaque to the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Errors returned when enqueueing a payload for a peer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue full, frame dropped")]
    Full,

    #[error("peer stalled after {0} consecutive drops")]
    Stalled(u64),

    #[error("connection closed")]
    Closed,
}

impl SendError {
    /// Whether the peer should be evicted from its room
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SendError::Full)
    }
}

/// Close code and reason requested for a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

/// Capability set the registry needs from a member connection
pub trait ConnectionHandle: Send + Sync {
    /// Identifier assigned at accept time
    fn id(&self) -> ConnectionId;

    /// Enqueue a serialized payload without blocking
    fn send(&self, payload: Arc<str>) -> Result<(), SendError>;

    /// Ask the owning relay loop to close the connection
    fn close(&self, code: u16, reason: &str);

    /// Current lifecycle state
    fn ready_state(&self) -> ReadyState;
}

/// Item drained by a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialized relayed message
    Payload(Arc<str>),
    /// Reply to a client ping
    Pong(Vec<u8>),
}

/// WebSocket-backed connection handle
pub struct PeerConnection {
    id: ConnectionId,
    room: RoomId,
    tx: mpsc::Sender<Outbound>,
    state: AtomicU8,
    consecutive_drops: AtomicU64,
    close_request: Mutex<Option<CloseRequest>>,
    close_notify: Notify,
}

impl PeerConnection {
    /// Create a handle in the `Connecting` state
    pub fn new(room: RoomId, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: ConnectionId::new(),
            room,
            tx,
            state: AtomicU8::new(ReadyState::Connecting as u8),
            consecutive_drops: AtomicU64::new(0),
            close_request: Mutex::new(None),
            close_notify: Notify::new(),
        }
    }

    /// Room bound at handshake time
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Transition `Connecting -> Open`
    pub fn mark_open(&self) -> bool {
        self.transition(ReadyState::Connecting, ReadyState::Open)
    }

    /// Enqueue a pong reply, dropping it if the queue is full
    pub fn pong(&self, data: Vec<u8>) {
        let _ = self.tx.try_send(Outbound::Pong(data));
    }

    /// Wait until [`ConnectionHandle::close`] has been called
    pub async fn close_requested(&self) {
        self.close_notify.notified().await;
    }

    /// Take the close code requested through [`ConnectionHandle::close`], if any
    pub fn take_close_request(&self) -> Option<CloseRequest> {
        self.close_request
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
    }

    /// Move to `Closed`, returning `true` only for the first caller
    pub fn finish(&self) -> bool {
        let previous = self.state.swap(ReadyState::Closed as u8, Ordering::AcqRel);
        ReadyState::from_u8(previous) != ReadyState::Closed
    }

    fn transition(&self, from: ReadyState, to: ReadyState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl ConnectionHandle for PeerConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, payload: Arc<str>) -> Result<(), SendError> {
        if self.ready_state() != ReadyState::Open {
            return Err(SendError::Closed);
        }

        match self.tx.try_send(Outbound::Payload(payload)) {
            Ok(()) => {
                self.consecutive_drops.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let drops = self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                if drops >= MAX_CONSECUTIVE_DROPS {
                    Err(SendError::Stalled(drops))
                } else {
                    Err(SendError::Full)
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    fn close(&self, code: u16, reason: &str) {
        let won = self.transition(ReadyState::Open, ReadyState::Closing)
            || self.transition(ReadyState::Connecting, ReadyState::Closing);
        if !won {
            return;
        }

        if let Ok(mut guard) = self.close_request.lock() {
            *guard = Some(CloseRequest {
                code,
                reason: reason.to_string(),
            });
        }
        self.close_notify.notify_one();
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }
}
