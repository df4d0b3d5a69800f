//! collab-core: peer-to-peer collaborative rich-text editing on Loro CRDTs.
//!
//! This crate holds everything that does not touch the network or disk
//! directly:
//! - The replicated document and its deltas
//! - Presence (awareness) of the other participants
//! - The connection lifecycle with retries and timeouts
//! - Debounced persistence behind a key/value trait
//! - The attributed change history
//! - Wire frames for peer links
//!
//! Hosts implement [`TransportConnector`] and [`KeyValueStore`], then drive a
//! [`CollabSession`] with transport events and the current time.

pub mod awareness;
pub mod config;
pub mod connection;
pub mod debounce;
pub mod document;
pub mod events;
pub mod history;
pub mod memory;
pub mod peer_id;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod transport;

pub use awareness::{AwarenessRegistry, PeerState, PresenceMessage, PresenceUser};
pub use config::SessionConfig;
pub use connection::{
    ConnectionAction, ConnectionError, ConnectionManager, ConnectionPolicy, ConnectionState,
    SessionId,
};
pub use document::{DocumentStore, LocalEdit, Mark, MergeError, Origin, TextSpan, UpdateDelta};
pub use events::{EventBus, Subscription, SubscriptionSet};
pub use history::{ChangeHistory, HistoryEntry};
pub use memory::{MemoryConnector, MemoryNetwork, MemoryTransport};
pub use peer_id::{PeerId, PeerIdError};
pub use persistence::{InMemoryStore, KeyValueStore, PersistenceError, PersistenceGateway};
pub use session::{CollabSession, ContentRenderer, EditOrigin, SessionEvent};
pub use transport::{
    IceConfig, IceServer, RendezvousConfig, SyncTransport, TransportConnector, TransportError,
    TransportEvent, TransportHooks,
};

/// Milliseconds since the Unix epoch, the clock every `now_ms` argument
/// expects.
pub fn now_ms() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
