//! Frames exchanged over a peer link.
//!
//! Sync frames are bincode; presence frames are JSON so they stay readable
//! in traces and match the presence wire message.
//!
//! The catch-up exchange on a new link:
//!
//! 1. Each side sends `SyncStep1` with its encoded version vector
//! 2. The receiver replies `SyncStep2` with the updates the sender lacks
//! 3. From then on, local edits flow as `Delta` frames

use super::encoding::{Encoding, detect_encoding};
use crate::awareness::PresenceMessage;
use crate::peer_id::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid binary frame: {0}")]
    Bincode(#[from] bincode::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncFrame {
    /// Incremental update produced by a local edit.
    Delta(Vec<u8>),
    /// Sender's encoded version vector.
    SyncStep1 { version: Vec<u8> },
    /// Updates the receiver of a `SyncStep1` was missing.
    SyncStep2 { update: Vec<u8> },
}

/// Wire format: `{"type":"presence","peerId":"<hex>","user":{...}}` or
/// `{"type":"leave","peerId":"<hex>"}`. Ids travel as hex strings so JSON
/// readers without 64-bit integers keep them exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PresenceFrame {
    Presence(PresenceMessage),
    Leave {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Sync(SyncFrame),
    Presence(PresenceFrame),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            Frame::Sync(frame) => Ok(bincode::serialize(frame)?),
            Frame::Presence(frame) => Ok(serde_json::to_vec(frame)?),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        match detect_encoding(data) {
            Encoding::Empty => Err(FrameError::Empty),
            Encoding::Json => Ok(Frame::Presence(serde_json::from_slice(data)?)),
            Encoding::Bincode => Ok(Frame::Sync(bincode::deserialize(data)?)),
        }
    }
}

impl From<SyncFrame> for Frame {
    fn from(frame: SyncFrame) -> Self {
        Frame::Sync(frame)
    }
}

impl From<PresenceFrame> for Frame {
    fn from(frame: PresenceFrame) -> Self {
        Frame::Presence(frame)
    }
}
