//! SyncTransport: the seam between the engine and the network.
//!
//! A transport session joins a rendezvous room through one or more signaling
//! endpoints, links directly with the peers it discovers there, and carries
//! deltas, sync handshakes and presence over those links. Sessions never
//! block. Frames sent while no link is up have no recipient and are dropped;
//! the engine holds its own unsent changes and pushes them on the next
//! [`TransportEvent::PeerLinked`]. Everything the network produces comes
//! back to the engine as [`TransportEvent`]s tagged with the [`SessionId`]
//! that produced them.
//!
//! Implementations:
//! - `collab-peer`: WebSocket signaling + direct WebSocket peer links
//! - [`crate::memory`]: deterministic in-process network for tests

use crate::awareness::PresenceMessage;
use crate::connection::SessionId;
use crate::document::UpdateDelta;
use crate::events::{EventBus, Subscription};
use crate::peer_id::PeerId;
use crate::protocol::SyncFrame;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("signaling failed: {0}")]
    Signaling(String),

    #[error("peer link traversal failed: {0}")]
    Traversal(String),

    #[error("peer link dropped: {0}")]
    LinkDropped(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("transport session closed")]
    Closed,

    #[error("transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// One STUN/TURN-style helper entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }

    fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(TransportError::Traversal("ICE server without URLs".into()));
        }
        for url in &self.urls {
            let scheme_ok = ["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|scheme| url.starts_with(scheme));
            if !scheme_ok {
                return Err(TransportError::Traversal(format!(
                    "unsupported ICE URL {url:?}"
                )));
            }
        }
        if self.is_relay() && (self.username.is_none() || self.credential.is_none()) {
            return Err(TransportError::Traversal(format!(
                "relay {:?} requires username and credential",
                self.urls
            )));
        }
        Ok(())
    }
}

/// Relay/traversal helpers used for peer links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::stun("stun:stun2.l.google.com:19302"),
                IceServer::stun("stun:stun3.l.google.com:19302"),
                IceServer {
                    urls: vec![
                        "turn:openrelay.metered.ca:80".into(),
                        "turn:openrelay.metered.ca:443".into(),
                    ],
                    username: Some("openrelayproject".into()),
                    credential: Some("openrelayproject".into()),
                },
                IceServer::turn(
                    "turn:turn.anyfirewall.com:443?transport=tcp",
                    "webrtc",
                    "webrtc",
                ),
            ],
        }
    }
}

impl IceConfig {
    pub fn empty() -> Self {
        Self {
            servers: Vec::new(),
        }
    }

    /// Whether a relayed path may be used when a direct link fails.
    pub fn allows_relay(&self) -> bool {
        self.servers.iter().any(IceServer::is_relay)
    }

    pub fn validate(&self) -> Result<()> {
        self.servers.iter().try_for_each(IceServer::validate)
    }
}

/// Where to meet other peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousConfig {
    pub room: String,
    pub signaling: Vec<String>,
    pub ice: IceConfig,
}

impl RendezvousConfig {
    pub fn validate(&self) -> Result<()> {
        if self.room.trim().is_empty() {
            return Err(TransportError::Signaling("rendezvous room is empty".into()));
        }
        if self.signaling.is_empty() {
            return Err(TransportError::Signaling(
                "no signaling endpoints configured".into(),
            ));
        }
        if let Some(bad) = self
            .signaling
            .iter()
            .find(|u| !(u.starts_with("ws://") || u.starts_with("wss://")))
        {
            return Err(TransportError::Signaling(format!(
                "signaling endpoint {bad:?} is not a ws:// or wss:// URL"
            )));
        }
        self.ice.validate()
    }

    /// The endpoint named in user-facing timeout errors.
    pub fn primary_endpoint(&self) -> &str {
        self.signaling.first().map(String::as_str).unwrap_or("")
    }
}

/// Something the network produced for one session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Joined (or lost) the rendezvous room.
    Status { connected: bool },
    /// A direct or relayed link to `peer` is usable.
    PeerLinked(PeerId),
    PeerUnlinked(PeerId),
    Sync { from: PeerId, frame: SyncFrame },
    Presence(PresenceMessage),
    /// The peer announced it is leaving.
    Left(PeerId),
    Error(TransportError),
}

/// An open transport session.
pub trait SyncTransport {
    fn session(&self) -> SessionId;

    /// Send to every linked peer; with no links the delta is dropped. Peers
    /// linked later catch up through the sync exchange instead.
    fn broadcast_delta(&mut self, delta: &UpdateDelta);

    fn broadcast_awareness(&mut self, message: &PresenceMessage);

    /// Tell every linked peer that `peer` is leaving.
    fn broadcast_leave(&mut self, peer: PeerId);

    /// Send a sync frame to one peer. Dropped if the peer is not linked.
    fn send_to(&mut self, peer: PeerId, frame: SyncFrame);

    /// Tear down links and leave the room. Idempotent.
    fn destroy(&mut self);

    fn is_destroyed(&self) -> bool;
}

/// Opens sessions. One fresh session per connection attempt.
pub trait TransportConnector {
    type Session: SyncTransport;

    fn open(
        &mut self,
        session: SessionId,
        local: PeerId,
        rendezvous: &RendezvousConfig,
    ) -> Result<Self::Session>;
}

/// Listener hooks for what the transport delivers, after the engine has
/// applied it.
#[derive(Default)]
pub struct TransportHooks {
    delta: Arc<EventBus<(PeerId, UpdateDelta)>>,
    awareness: Arc<EventBus<PresenceMessage>>,
    status: Arc<EventBus<bool>>,
    error: Arc<EventBus<TransportError>>,
}

impl TransportHooks {
    pub fn on_delta_received(
        &self,
        listener: impl Fn(&(PeerId, UpdateDelta)) + Send + Sync + 'static,
    ) -> Subscription {
        self.delta.subscribe(listener)
    }

    pub fn on_awareness_received(
        &self,
        listener: impl Fn(&PresenceMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.awareness.subscribe(listener)
    }

    pub fn on_status_change(
        &self,
        listener: impl Fn(&bool) + Send + Sync + 'static,
    ) -> Subscription {
        self.status.subscribe(listener)
    }

    pub fn on_error(
        &self,
        listener: impl Fn(&TransportError) + Send + Sync + 'static,
    ) -> Subscription {
        self.error.subscribe(listener)
    }

    pub(crate) fn delta_received(&self, from: PeerId, delta: &UpdateDelta) {
        self.delta.emit(&(from, delta.clone()));
    }

    pub(crate) fn awareness_received(&self, message: &PresenceMessage) {
        self.awareness.emit(message);
    }

    pub(crate) fn status_changed(&self, connected: bool) {
        self.status.emit(&connected);
    }

    pub(crate) fn error(&self, error: &TransportError) {
        self.error.emit(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendezvous() -> RendezvousConfig {
        RendezvousConfig {
            room: "collaborative-editor-room".into(),
            signaling: vec!["wss://signaling.yjs.dev".into()],
            ice: IceConfig::default(),
        }
    }

    #[test]
    fn test_default_ice_config_is_valid_and_relays() {
        let ice = IceConfig::default();
        assert!(ice.validate().is_ok());
        assert!(ice.allows_relay());
        assert_eq!(ice.servers.len(), 6);
    }

    #[test]
    fn test_stun_only_config_does_not_relay() {
        let ice = IceConfig {
            servers: vec![IceServer::stun("stun:stun.example.org:3478")],
        };
        assert!(ice.validate().is_ok());
        assert!(!ice.allows_relay());
    }

    #[test]
    fn test_turn_without_credentials_rejected() {
        let ice = IceConfig {
            servers: vec![IceServer::stun("turn:relay.example.org:3478")],
        };
        assert!(matches!(ice.validate(), Err(TransportError::Traversal(_))));
    }

    #[test]
    fn test_unknown_ice_scheme_rejected() {
        let ice = IceConfig {
            servers: vec![IceServer::stun("http://relay.example.org")],
        };
        assert!(matches!(ice.validate(), Err(TransportError::Traversal(_))));
    }

    #[test]
    fn test_rendezvous_requires_websocket_endpoint() {
        let mut config = rendezvous();
        assert!(config.validate().is_ok());

        config.signaling = vec!["https://signaling.example.org".into()];
        assert!(matches!(
            config.validate(),
            Err(TransportError::Signaling(_))
        ));

        config.signaling.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rendezvous_requires_room() {
        let mut config = rendezvous();
        config.room = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ice_config_json_shape() {
        let json = r#"[{"urls":["turn:r.example.org:443"],"username":"u","credential":"c"}]"#;
        let ice: IceConfig = serde_json::from_str(json).unwrap();
        assert!(ice.allows_relay());
        assert!(ice.validate().is_ok());
    }

    #[test]
    fn test_error_messages_distinguish_causes() {
        let signaling = TransportError::Signaling("refused".into()).to_string();
        let traversal = TransportError::Traversal("no route".into()).to_string();
        assert!(signaling.starts_with("signaling failed"));
        assert!(traversal.starts_with("peer link traversal failed"));
    }
}
