//! Connection registry for room fan-out
//!
//! Maintains which connections are subscribed to which rooms and delivers
//! relayed payloads to room members. Rooms exist only while they have members:
//! the last unregister for a room removes its entry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::connection::{ConnectionHandle, ConnectionId, RoomId};
use super::protocol::{CLOSE_GOING_AWAY, CLOSE_SEND_FAILURE};

/// The live members of one room
#[derive(Default)]
pub struct Room {
    members: HashMap<ConnectionId, Arc<dyn ConnectionHandle>>,
}

impl Room {
    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the room has no members
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn insert(&mut self, connection_id: ConnectionId, handle: Arc<dyn ConnectionHandle>) {
        let _ = self.members.insert(connection_id, handle);
    }

    fn remove(&mut self, connection_id: ConnectionId) -> bool {
        self.members.remove(&connection_id).is_some()
    }

    /// Point-in-time copy of the member handles
    fn snapshot(&self) -> Vec<Arc<dyn ConnectionHandle>> {
        self.members.values().cloned().collect()
    }
}

/// Per-broadcast delivery counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Targets the payload was enqueued for
    pub delivered: usize,
    /// Targets whose queue was full; the payload was dropped for them
    pub dropped: usize,
    /// Targets closed and unregistered because the send failed
    pub evicted: usize,
}

/// Room-keyed registry of live connections
///
/// Mutations take the write lock; [`ConnectionRegistry::broadcast`] holds the
/// read lock only long enough to snapshot a room's members.
#[derive(Default)]
pub struct ConnectionRegistry {
    rooms: RwLock<HashMap<RoomId, Room>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, creating the room if needed
    pub async fn register(
        &self,
        room_id: &RoomId,
        connection_id: ConnectionId,
        handle: Arc<dyn ConnectionHandle>,
    ) {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.clone()).or_default();
        room.insert(connection_id, handle);

        info!(
            "Connection {} joined room {} ({} active)",
            connection_id,
            room_id,
            room.len()
        );
    }

    /// Remove a connection from a room
    ///
    /// Evicts the room entry once it is empty. Returns `false` when the room or
    /// connection was already gone.
    pub async fn unregister(&self, room_id: &RoomId, connection_id: ConnectionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };

        if !room.remove(connection_id) {
            return false;
        }

        info!(
            "Connection {} left room {} ({} remaining)",
            connection_id,
            room_id,
            room.len()
        );

        if room.is_empty() {
            let _ = rooms.remove(room_id);
            debug!("Removed empty room {}", room_id);
        }
        true
    }

    /// Send a payload to every member of a room except `exclude`
    ///
    /// Failures are isolated per target. Targets whose send fails fatally are
    /// closed and unregistered after delivery to the others completes.
    pub async fn broadcast(
        &self,
        room_id: &RoomId,
        exclude: Option<ConnectionId>,
        payload: Arc<str>,
    ) -> BroadcastOutcome {
        let members = {
            let rooms = self.rooms.read().await;
            match rooms.get(room_id) {
                Some(room) => room.snapshot(),
                None => return BroadcastOutcome::default(),
            }
        };

        let mut outcome = BroadcastOutcome::default();
        let mut failed = Vec::new();

        for member in members {
            let member_id = member.id();
            if Some(member_id) == exclude {
                continue;
            }

            match member.send(Arc::clone(&payload)) {
                Ok(()) => outcome.delivered += 1,
                Err(e) if e.is_fatal() => {
                    warn!("Send to {} in room {} failed: {}", member_id, room_id, e);
                    member.close(CLOSE_SEND_FAILURE, "send failure");
                    failed.push(member_id);
                }
                Err(e) => {
                    warn!("Dropped frame for {} in room {}: {}", member_id, room_id, e);
                    outcome.dropped += 1;
                }
            }
        }

        for member_id in failed {
            if self.unregister(room_id, member_id).await {
                outcome.evicted += 1;
            }
        }

        outcome
    }

    /// Number of members currently in a room
    pub async fn room_size(&self, room_id: &RoomId) -> usize {
        self.rooms.read().await.get(room_id).map_or(0, Room::len)
    }

    /// Number of rooms with at least one member
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Whether a room entry exists
    pub async fn contains_room(&self, room_id: &RoomId) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    /// Close every registered connection and clear all rooms
    pub async fn shutdown_all(&self) {
        let rooms = std::mem::take(&mut *self.rooms.write().await);
        let mut closed = 0usize;

        for room in rooms.into_values() {
            for member in room.snapshot() {
                member.close(CLOSE_GOING_AWAY, "relay shutting down");
                closed += 1;
            }
        }

        if closed > 0 {
            info!("Closed {} connections during shutdown", closed);
        }
    }
}
