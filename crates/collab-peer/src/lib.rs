//! collab-peer library: the native host for collab-core.
//!
//! Exposes the host components so the binary and integration tests share
//! them.

pub mod config;
pub mod console;
pub mod file_store;
pub mod host;
pub mod link;
pub mod message;
pub mod render;
pub mod signaling;
pub mod transport;

pub use config::{ConfigError, PeerConfig};
pub use console::{Command, CommandError};
pub use file_store::FileStore;
pub use host::{PeerHost, PeerSession};
pub use message::{RoomMessage, SignalMessage};
pub use render::HtmlRenderer;
pub use signaling::SignalingServer;
pub use transport::{EventReceiver, EventSender, WsConnector, WsSession};
