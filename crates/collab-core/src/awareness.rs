//! Awareness: ephemeral presence of every participant.
//!
//! Presence is never persisted and is independent of document content. The
//! registry owns one `PeerState` per known peer, including the local one.
//! Remote entries are refreshed by incoming presence messages and pruned
//! when they go quiet; the local entry is never pruned.

use crate::events::{EventBus, Subscription};
use crate::peer_id::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Name shown for peers that never announced one.
pub const ANONYMOUS_NAME: &str = "Anonymous";
pub const DEFAULT_COLOR: &str = "#000000";

/// The user-visible part of a peer's presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub name: String,
    pub color: String,
}

impl PresenceUser {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }

    /// A throwaway identity: `User-<0..999>` and a random `#rrggbb` color.
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        let number: u32 = rng.random_range(0..1000);
        let color: u32 = rng.random_range(0..0x00ff_ffff);
        Self {
            name: format!("User-{number}"),
            color: format!("#{color:06x}"),
        }
    }
}

/// Presence wire message: `{ "peerId": "<16 hex digits>", "user": { "name", "color" } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub peer_id: PeerId,
    pub user: PresenceUser,
}

impl PresenceMessage {
    pub fn peer(&self) -> PeerId {
        self.peer_id
    }
}

/// One participant as seen by this registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerState {
    pub peer_id: PeerId,
    pub display_name: String,
    pub color: String,
    /// Virtual-time milliseconds of the last message from this peer.
    pub last_seen_at: u64,
}

impl PeerState {
    fn has_default_name(&self) -> bool {
        let name = self.display_name.trim();
        name.is_empty() || name == ANONYMOUS_NAME
    }

    fn same_visible_fields(&self, user: &PresenceUser) -> bool {
        self.display_name == user.name && self.color == user.color
    }
}

/// Owner of the presence map.
pub struct AwarenessRegistry {
    local: PeerId,
    peers: BTreeMap<PeerId, PeerState>,
    broadcast_pending: bool,
    changes: Arc<EventBus<Vec<PeerState>>>,
}

impl AwarenessRegistry {
    /// Create a registry whose local entry starts with `user`.
    pub fn new(local: PeerId, user: PresenceUser, now_ms: u64) -> Self {
        let mut peers = BTreeMap::new();
        peers.insert(
            local,
            PeerState {
                peer_id: local,
                display_name: user.name,
                color: user.color,
                last_seen_at: now_ms,
            },
        );
        Self {
            local,
            peers,
            broadcast_pending: true,
            changes: Arc::new(EventBus::new()),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    /// The local entry. Always present.
    pub fn local_state(&self) -> Option<&PeerState> {
        self.peers.get(&self.local)
    }

    /// Update the local identity and schedule a broadcast.
    pub fn set_local_state(&mut self, user: PresenceUser, now_ms: u64) {
        let changed = self.upsert(self.local, user, now_ms);
        self.broadcast_pending = true;
        if changed {
            self.notify();
        }
    }

    /// Record presence received from a remote peer.
    ///
    /// Echoes of our own peer ID are ignored.
    pub fn observe_remote(&mut self, peer_id: PeerId, user: PresenceUser, now_ms: u64) {
        if peer_id == self.local {
            return;
        }
        if self.upsert(peer_id, user, now_ms) {
            self.notify();
        }
    }

    /// Returns true if a visible field changed or the peer is new.
    fn upsert(&mut self, peer_id: PeerId, user: PresenceUser, now_ms: u64) -> bool {
        match self.peers.get_mut(&peer_id) {
            Some(state) => {
                state.last_seen_at = state.last_seen_at.max(now_ms);
                if state.same_visible_fields(&user) {
                    return false;
                }
                state.display_name = user.name;
                state.color = user.color;
                true
            }
            None => {
                self.peers.insert(
                    peer_id,
                    PeerState {
                        peer_id,
                        display_name: user.name,
                        color: user.color,
                        last_seen_at: now_ms,
                    },
                );
                true
            }
        }
    }

    /// Drop a peer that announced it is leaving.
    pub fn remove(&mut self, peer_id: PeerId) -> bool {
        if peer_id == self.local {
            return false;
        }
        let removed = self.peers.remove(&peer_id).is_some();
        if removed {
            self.notify();
        }
        removed
    }

    /// Remove remote peers not heard from within `stale_after_ms`.
    ///
    /// Returns the pruned peer IDs.
    pub fn prune(&mut self, now_ms: u64, stale_after_ms: u64) -> Vec<PeerId> {
        let local = self.local;
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|s| s.peer_id != local && now_ms.saturating_sub(s.last_seen_at) > stale_after_ms)
            .map(|s| s.peer_id)
            .collect();

        for peer_id in &stale {
            self.peers.remove(peer_id);
            debug!("Pruned stale peer {}", peer_id);
        }
        if !stale.is_empty() {
            self.notify();
        }
        stale
    }

    /// Peers to show: the local peer first, then named remote peers by ID.
    pub fn list_active(&self) -> Vec<PeerState> {
        let mut active = Vec::with_capacity(self.peers.len());
        if let Some(local) = self.peers.get(&self.local) {
            active.push(local.clone());
        }
        active.extend(
            self.peers
                .values()
                .filter(|s| s.peer_id != self.local && !s.has_default_name())
                .cloned(),
        );
        active
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&PeerState> {
        self.peers.get(&peer_id)
    }

    /// Name and color for attributing work to `peer_id`.
    pub fn user_for(&self, peer_id: PeerId) -> PresenceUser {
        match self.peers.get(&peer_id) {
            Some(state) if !state.display_name.is_empty() => {
                PresenceUser::new(state.display_name.clone(), state.color.clone())
            }
            _ => PresenceUser::new(ANONYMOUS_NAME, DEFAULT_COLOR),
        }
    }

    /// The local presence as a wire message.
    pub fn local_message(&self) -> PresenceMessage {
        PresenceMessage {
            peer_id: self.local,
            user: self.user_for(self.local),
        }
    }

    /// Take the scheduled broadcast, if any.
    pub fn take_broadcast(&mut self) -> Option<PresenceMessage> {
        if !self.broadcast_pending {
            return None;
        }
        self.broadcast_pending = false;
        Some(self.local_message())
    }

    /// Force the next `take_broadcast` to yield a message.
    pub fn schedule_broadcast(&mut self) {
        self.broadcast_pending = true;
    }

    /// Listen for changes to the active peer list.
    pub fn on_change(
        &self,
        listener: impl Fn(&Vec<PeerState>) + Send + Sync + 'static,
    ) -> Subscription {
        self.changes.subscribe(listener)
    }

    fn notify(&self) {
        self.changes.emit(&self.list_active());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const LOCAL: u64 = 50;

    fn registry() -> AwarenessRegistry {
        AwarenessRegistry::new(PeerId::from(LOCAL), PresenceUser::new("", ""), 0)
    }

    fn user(name: &str) -> PresenceUser {
        PresenceUser::new(name, "#ff0000")
    }

    #[test]
    fn test_local_peer_listed_even_without_name() {
        let reg = registry();
        let active = reg.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].peer_id, PeerId::from(LOCAL));
    }

    #[test]
    fn test_unnamed_remote_peer_hidden() {
        let mut reg = registry();
        reg.observe_remote(PeerId::from(1), user(""), 10);
        reg.observe_remote(PeerId::from(2), user(ANONYMOUS_NAME), 10);
        reg.observe_remote(PeerId::from(3), user("Ada"), 10);

        let names: Vec<_> = reg
            .list_active()
            .into_iter()
            .map(|s| s.peer_id.as_u64())
            .collect();
        assert_eq!(names, vec![LOCAL, 3]);
    }

    #[test]
    fn test_local_first_then_by_peer_id() {
        let mut reg = registry();
        reg.observe_remote(PeerId::from(90), user("Zed"), 0);
        reg.observe_remote(PeerId::from(7), user("Bo"), 0);

        let ids: Vec<_> = reg
            .list_active()
            .into_iter()
            .map(|s| s.peer_id.as_u64())
            .collect();
        assert_eq!(ids, vec![LOCAL, 7, 90]);
    }

    #[test]
    fn test_prune_removes_stale_keeps_local() {
        let mut reg = registry();
        reg.observe_remote(PeerId::from(1), user("Old"), 1_000);
        reg.observe_remote(PeerId::from(2), user("Fresh"), 25_000);

        let pruned = reg.prune(40_000, 30_000);

        assert_eq!(pruned, vec![PeerId::from(1)]);
        let ids: Vec<_> = reg.list_active().iter().map(|s| s.peer_id.as_u64()).collect();
        assert_eq!(ids, vec![LOCAL, 2]);
    }

    #[test]
    fn test_observe_refreshes_last_seen() {
        let mut reg = registry();
        reg.observe_remote(PeerId::from(1), user("Ada"), 1_000);
        reg.observe_remote(PeerId::from(1), user("Ada"), 35_000);

        assert!(reg.prune(40_000, 30_000).is_empty());
        assert_eq!(reg.get(PeerId::from(1)).unwrap().last_seen_at, 35_000);
    }

    #[test]
    fn test_own_echo_ignored() {
        let mut reg = registry();
        reg.observe_remote(PeerId::from(LOCAL), user("Impostor"), 5);
        assert_eq!(reg.local_state().unwrap().display_name, "");
    }

    #[test]
    fn test_set_local_state_schedules_broadcast() {
        let mut reg = registry();
        assert!(reg.take_broadcast().is_some());
        assert!(reg.take_broadcast().is_none());

        reg.set_local_state(user("Me"), 10);
        let msg = reg.take_broadcast().unwrap();
        assert_eq!(msg.peer_id, PeerId::from(LOCAL));
        assert_eq!(msg.user.name, "Me");
    }

    #[test]
    fn test_on_change_only_for_visible_changes() {
        let mut reg = registry();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let _sub = reg.on_change(move |_| *counter.lock().unwrap() += 1);

        reg.observe_remote(PeerId::from(1), user("Ada"), 0);
        reg.observe_remote(PeerId::from(1), user("Ada"), 5);
        reg.observe_remote(PeerId::from(1), PresenceUser::new("Ada", "#00ff00"), 6);
        reg.remove(PeerId::from(1));

        assert_eq!(*count.lock().unwrap(), 3);
    }

    #[test]
    fn test_user_for_unknown_peer_is_anonymous() {
        let reg = registry();
        let user = reg.user_for(PeerId::from(123));
        assert_eq!(user.name, ANONYMOUS_NAME);
        assert_eq!(user.color, DEFAULT_COLOR);
    }

    #[test]
    fn test_presence_message_wire_shape() {
        let msg = PresenceMessage {
            peer_id: PeerId::from(42),
            user: PresenceUser::new("Ada", "#123456"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"peerId": "000000000000002a", "user": {"name": "Ada", "color": "#123456"}})
        );
    }

    #[test]
    fn test_random_identity_shape() {
        let user = PresenceUser::random();
        assert!(user.name.starts_with("User-"));
        assert_eq!(user.color.len(), 7);
        assert!(user.color.starts_with('#'));
    }
}
