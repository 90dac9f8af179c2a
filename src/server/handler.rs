//! Inbound frame handling
//!
//! Turns a text frame received on one connection into a relayed message and
//! fans it out to the rest of the connection's room.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::{ConnectionId, RoomId};
use super::protocol::{InboundFrame, ProtocolError, RelayedMessage};
use super::registry::{BroadcastOutcome, ConnectionRegistry};

/// Result of handling one inbound frame
#[derive(Debug)]
pub enum FrameOutcome {
    /// The frame was enriched and broadcast
    Relayed {
        message_id: Uuid,
        outcome: BroadcastOutcome,
    },
    /// The frame was malformed and dropped; nothing was broadcast
    Discarded(ProtocolError),
}

/// Message pipeline for a single connection
pub struct ConnectionHandler {
    connection_id: ConnectionId,
    room: RoomId,
    registry: Arc<ConnectionRegistry>,
    max_content_length: usize,
}

impl ConnectionHandler {
    /// Create a handler for a connection bound to `room`
    pub fn new(
        connection_id: ConnectionId,
        room: RoomId,
        registry: Arc<ConnectionRegistry>,
        max_content_length: usize,
    ) -> Self {
        Self {
            connection_id,
            room,
            registry,
            max_content_length,
        }
    }

    /// Parse, enrich and broadcast a text frame
    ///
    /// The sender never receives its own message back.
    pub async fn handle_text(&self, text: &str) -> FrameOutcome {
        let frame = match InboundFrame::from_json(text, self.max_content_length) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    "Discarding malformed frame from {}: {}",
                    self.connection_id, e
                );
                return FrameOutcome::Discarded(e);
            }
        };

        if let Some(claimed) = frame.conversation_id.as_deref() {
            if claimed != self.room.as_str() {
                debug!(
                    "Connection {} claimed room {} but is bound to {}, ignoring",
                    self.connection_id, claimed, self.room
                );
            }
        }

        let message = RelayedMessage::from_inbound(frame, &self.room);
        let payload: Arc<str> = match message.to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!("Failed to serialize message {}: {}", message.id, e);
                return FrameOutcome::Discarded(e);
            }
        };

        debug!(
            "Message {} received from {} in room {}",
            message.id, self.connection_id, self.room
        );

        let outcome = self
            .registry
            .broadcast(&self.room, Some(self.connection_id), payload)
            .await;

        FrameOutcome::Relayed {
            message_id: message.id,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::{ConnectionHandle, Outbound, PeerConnection, ReadyState};
    use crate::server::protocol::DEFAULT_MAX_CONTENT_LENGTH;
    use tokio::sync::mpsc;

    async fn join(
        registry: &Arc<ConnectionRegistry>,
        room: &str,
    ) -> (Arc<PeerConnection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        let peer = Arc::new(PeerConnection::new(RoomId::new(room), tx));
        assert!(peer.mark_open());
        registry
            .register(peer.room(), peer.id(), peer.clone())
            .await;
        (peer, rx)
    }

    fn handler_for(peer: &PeerConnection, registry: &Arc<ConnectionRegistry>) -> ConnectionHandler {
        ConnectionHandler::new(
            peer.id(),
            peer.room().clone(),
            Arc::clone(registry),
            DEFAULT_MAX_CONTENT_LENGTH,
        )
    }

    fn relayed(rx: &mut mpsc::Receiver<Outbound>) -> RelayedMessage {
        match rx.try_recv().unwrap() {
            Outbound::Payload(json) => RelayedMessage::from_json(&json).unwrap(),
            other => panic!("Expected payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relays_to_peers_without_echo() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, mut rx_a) = join(&registry, "r1").await;
        let (_b, mut rx_b) = join(&registry, "r1").await;

        let handler = handler_for(&a, &registry);
        let outcome = handler
            .handle_text(r#"{"content": "hi", "conversationId": "r1", "senderId": "u1"}"#)
            .await;

        let message_id = match outcome {
            FrameOutcome::Relayed {
                message_id,
                outcome,
            } => {
                assert_eq!(outcome.delivered, 1);
                message_id
            }
            FrameOutcome::Discarded(e) => panic!("Unexpected discard: {}", e),
        };

        let message = relayed(&mut rx_b);
        assert_eq!(message.id, message_id);
        assert_eq!(message.content, "hi");
        assert_eq!(message.sender_id.as_deref(), Some("u1"));
        assert_eq!(message.conversation_id, "r1");
        assert!(rx_b.try_recv().is_err());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_discarded() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, _rx_a) = join(&registry, "r1").await;
        let (_b, mut rx_b) = join(&registry, "r1").await;

        let handler = handler_for(&a, &registry);
        let outcome = handler.handle_text("{not valid json").await;
        assert!(matches!(outcome, FrameOutcome::Discarded(_)));

        let outcome = handler.handle_text(r#"{"senderId": "u1"}"#).await;
        assert!(matches!(outcome, FrameOutcome::Discarded(_)));

        assert!(rx_b.try_recv().is_err());
        assert_eq!(a.ready_state(), ReadyState::Open);
        assert_eq!(registry.room_size(a.room()).await, 2);
    }

    #[tokio::test]
    async fn test_payload_room_cannot_redirect_delivery() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, _rx_a) = join(&registry, "r1").await;
        let (_b, mut rx_b) = join(&registry, "r1").await;
        let (_other, mut rx_other) = join(&registry, "r2").await;

        let handler = handler_for(&a, &registry);
        let _ = handler
            .handle_text(r#"{"content": "hi", "conversationId": "r2", "senderId": "u1"}"#)
            .await;

        assert_eq!(relayed(&mut rx_b).conversation_id, "r1");
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_content_is_discarded() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, _rx_a) = join(&registry, "r1").await;
        let (_b, mut rx_b) = join(&registry, "r1").await;

        let handler = ConnectionHandler::new(a.id(), a.room().clone(), Arc::clone(&registry), 4);
        let outcome = handler.handle_text(r#"{"content": "too long"}"#).await;
        assert!(matches!(
            outcome,
            FrameOutcome::Discarded(ProtocolError::ValidationError(_))
        ));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sender_order_preserved() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, _rx_a) = join(&registry, "r1").await;
        let (_b, mut rx_b) = join(&registry, "r1").await;

        let handler = handler_for(&a, &registry);
        for i in 0..5 {
            let _ = handler
                .handle_text(&format!(r#"{{"content": "msg-{}"}}"#, i))
                .await;
        }
        for i in 0..5 {
            assert_eq!(relayed(&mut rx_b).content, format!("msg-{}", i));
        }
    }
}
