//! Signaling messages.
//!
//! The signaling channel is a topic pub/sub server. Clients subscribe to the
//! room topic and publish small JSON payloads that every other subscriber
//! receives. All messages are WebSocket text frames.

use collab_core::PeerId;
use serde::{Deserialize, Serialize};

/// Messages between a client and the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Publish { topic: String, data: serde_json::Value },
    Ping,
    Pong,
}

impl SignalMessage {
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a signaling frame. Returns None for anything unrecognized.
    pub fn from_text(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Publish `message` to `topic`.
    pub fn publish(topic: &str, message: &RoomMessage) -> Self {
        SignalMessage::Publish {
            topic: topic.to_string(),
            data: serde_json::to_value(message).unwrap_or_default(),
        }
    }
}

/// Payloads published to a room topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RoomMessage {
    /// A participant is present. `address` is where it accepts direct links.
    Announce {
        from: PeerId,
        address: Option<String>,
    },
    /// A peer-link frame carried over signaling when no direct link exists.
    Relay {
        from: PeerId,
        to: PeerId,
        payload: Vec<u8>,
    },
    /// The participant left the room.
    Depart { from: PeerId },
}

impl RoomMessage {
    pub fn from_value(data: serde_json::Value) -> Option<Self> {
        serde_json::from_value(data).ok()
    }

    pub fn sender(&self) -> PeerId {
        match self {
            RoomMessage::Announce { from, .. }
            | RoomMessage::Relay { from, .. }
            | RoomMessage::Depart { from } => *from,
        }
    }
}
