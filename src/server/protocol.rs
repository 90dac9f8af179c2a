//! Protocol message definitions
//!
//! Defines the frames exchanged between chat clients and the relay.
//! All frames are JSON-encoded text messages using camelCase field names.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use super::connection::RoomId;

/// Handshake query parameter carrying the room identifier
pub const ROOM_QUERY_PARAM: &str = "conversationId";

/// Default maximum content length (1MB)
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 1024 * 1024;

/// Close code for a clean, intentional shutdown
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code sent to clients when the relay is going away
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code for a connection evicted after a send failure
pub const CLOSE_SEND_FAILURE: u16 = 1011;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Inbound Frames
// ============================================================================

/// Frame sent from a client to the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    /// Message text, forwarded verbatim
    pub content: String,
    /// Room the client believes it is talking to (informational only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Caller-supplied sender identity (not authenticated)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

impl InboundFrame {
    /// Create a new inbound frame
    pub fn new(content: impl Into<String>, sender_id: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            conversation_id: None,
            sender_id: Some(sender_id.into()),
        }
    }

    /// Set the informational room identifier
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Parse and validate an inbound frame from JSON
    pub fn from_json(json: &str, max_content_length: usize) -> ProtocolResult<Self> {
        let frame: Self = serde_json::from_str(json)?;
        frame.validate(max_content_length)?;
        Ok(frame)
    }

    /// Validate frame contents
    pub fn validate(&self, max_content_length: usize) -> ProtocolResult<()> {
        if self.content.len() > max_content_length {
            return Err(ProtocolError::ValidationError(format!(
                "content exceeds maximum length of {} bytes",
                max_content_length
            )));
        }
        Ok(())
    }

    /// Serialize the frame to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Outbound Frames
// ============================================================================

/// Message broadcast from the relay to room peers
///
/// `id`, `conversation_id` and `timestamp` are always assigned by the relay;
/// only `content` and `sender_id` come from the publishing client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayedMessage {
    /// Server-generated message identifier
    pub id: Uuid,
    /// Message text
    pub content: String,
    /// Room the message was published to
    pub conversation_id: String,
    /// Sender identity copied from the inbound frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// Relay receipt time
    #[serde(serialize_with = "serialize_millis")]
    pub timestamp: DateTime<Utc>,
}

impl RelayedMessage {
    /// Enrich an inbound frame received on a connection bound to `room`
    pub fn from_inbound(frame: InboundFrame, room: &RoomId) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: frame.content,
            conversation_id: room.as_str().to_string(),
            sender_id: frame.sender_id,
            timestamp: Utc::now(),
        }
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a relayed message from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn serialize_millis<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Inbound Frame Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_full_inbound_frame() {
        let json = r#"{"content": "hi", "conversationId": "r1", "senderId": "u1"}"#;
        let frame = InboundFrame::from_json(json, DEFAULT_MAX_CONTENT_LENGTH).unwrap();
        assert_eq!(frame.content, "hi");
        assert_eq!(frame.conversation_id.as_deref(), Some("r1"));
        assert_eq!(frame.sender_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_parse_minimal_inbound_frame() {
        let frame = InboundFrame::from_json(r#"{"content": "hi"}"#, 16).unwrap();
        assert_eq!(frame.content, "hi");
        assert!(frame.conversation_id.is_none());
        assert!(frame.sender_id.is_none());
    }

    #[test]
    fn test_missing_content_is_rejected() {
        let result = InboundFrame::from_json(r#"{"senderId": "u1"}"#, 16);
        assert!(matches!(result, Err(ProtocolError::SerializationError(_))));
    }

    #[test]
    fn test_non_json_is_rejected() {
        let result = InboundFrame::from_json("not json at all", 16);
        assert!(result.is_err());
    }

    #[test]
    fn test_content_max_length() {
        let json = format!(r#"{{"content": "{}"}}"#, "x".repeat(17));
        let result = InboundFrame::from_json(&json, 16);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("exceeds maximum length"));
    }

    #[test]
    fn test_inbound_builder_serialization() {
        let json = InboundFrame::new("hello", "u1")
            .with_conversation("r1")
            .to_json()
            .unwrap();
        assert!(json.contains("\"content\":\"hello\""));
        assert!(json.contains("\"conversationId\":\"r1\""));
        assert!(json.contains("\"senderId\":\"u1\""));
    }

    // -------------------------------------------------------------------------
    // Relayed Message Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_relayed_message_uses_bound_room() {
        let frame = InboundFrame::new("hi", "u1").with_conversation("spoofed");
        let room = RoomId::new("r1");
        let msg = RelayedMessage::from_inbound(frame, &room);

        assert_eq!(msg.conversation_id, "r1");
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.sender_id.as_deref(), Some("u1"));
        assert!(!msg.id.is_nil());
    }

    #[test]
    fn test_relayed_message_ids_are_unique() {
        let room = RoomId::new("r1");
        let a = RelayedMessage::from_inbound(InboundFrame::new("a", "u1"), &room);
        let b = RelayedMessage::from_inbound(InboundFrame::new("a", "u1"), &room);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_relayed_message_json_shape() {
        let room = RoomId::new("r1");
        let msg = RelayedMessage::from_inbound(InboundFrame::new("hi", "u1"), &room);
        let json = msg.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["content"], "hi");
        assert_eq!(value["conversationId"], "r1");
        assert_eq!(value["senderId"], "u1");
        assert_eq!(value["id"], msg.id.to_string());

        let timestamp = value["timestamp"].as_str().unwrap();
        assert!(timestamp.ends_with('Z'));
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_relayed_message_omits_missing_sender() {
        let frame = InboundFrame {
            content: "anon".to_string(),
            conversation_id: None,
            sender_id: None,
        };
        let msg = RelayedMessage::from_inbound(frame, &RoomId::new("r1"));
        let json = msg.to_json().unwrap();
        assert!(!json.contains("senderId"));

        let parsed = RelayedMessage::from_json(&json).unwrap();
        assert!(parsed.sender_id.is_none());
        assert_eq!(parsed.id, msg.id);
    }
}
