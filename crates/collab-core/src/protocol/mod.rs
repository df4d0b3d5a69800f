//! Wire protocol for peer links.
//!
//! - Handshake on link open
//! - Encoding detection (JSON vs bincode)
//! - Sync and presence frames

pub mod encoding;
pub mod frame;
pub mod handshake;

pub use encoding::{Encoding, detect_encoding};
pub use frame::{Frame, FrameError, PresenceFrame, SyncFrame};
pub use handshake::{Handshake, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
