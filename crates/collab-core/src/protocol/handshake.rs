//! Peer link handshake.
//!
//! Sent by both ends immediately after a peer link's WebSocket opens. A
//! link is only used once the remote handshake names the same room.

use crate::PeerId;
use serde::{Deserialize, Serialize};

/// Current link protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size accepted on signaling and peer links (50MB).
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Wire format: `{"type":"handshake","version":1,"peerId":"<hex>","room":"..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    #[serde(rename = "type")]
    msg_type: String,
    pub version: u32,
    pub peer_id: PeerId,
    pub room: String,
}

impl Handshake {
    pub fn new(peer_id: PeerId, room: impl Into<String>) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            version: PROTOCOL_VERSION,
            peer_id,
            room: room.into(),
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        // Only strings and integers: serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse a handshake. `None` for anything else.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        let handshake: Self = serde_json::from_slice(data).ok()?;
        if handshake.msg_type == "handshake" {
            Some(handshake)
        } else {
            None
        }
    }

    /// Newer versions are accepted; the mismatch is only logged.
    pub fn should_warn_version(&self) -> bool {
        self.version != PROTOCOL_VERSION
    }

    pub fn accepts(&self, room: &str) -> bool {
        self.room == room
    }
}
