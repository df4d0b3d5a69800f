//! In-process transport for tests and offline use.
//!
//! A `MemoryNetwork` is a shared switchboard. Every session opened through a
//! `MemoryConnector` joins its room and is linked to all other sessions in
//! that room at once. Events are queued per peer and handed out by
//! [`MemoryNetwork::drain`], so tests control exactly when, and in which
//! order, each peer sees them. Faults (partitions, duplicated or reordered
//! deltas) are switched on per network.

use crate::awareness::PresenceMessage;
use crate::connection::SessionId;
use crate::document::UpdateDelta;
use crate::peer_id::PeerId;
use crate::protocol::SyncFrame;
use crate::transport::{
    RendezvousConfig, Result, SyncTransport, TransportConnector, TransportError, TransportEvent,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug)]
struct Endpoint {
    session: SessionId,
    room: String,
}

#[derive(Debug, Default)]
struct Switchboard {
    endpoints: BTreeMap<PeerId, Endpoint>,
    inboxes: HashMap<PeerId, VecDeque<(SessionId, TransportEvent)>>,
    offline: HashSet<PeerId>,
    duplicate_sync: bool,
    reorder_sync: bool,
}

impl Switchboard {
    fn push(&mut self, to: PeerId, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get(&to) {
            let session = endpoint.session;
            self.inboxes
                .entry(to)
                .or_default()
                .push_back((session, event));
        }
    }

    fn room_peers(&self, of: PeerId) -> Vec<PeerId> {
        let Some(room) = self.endpoints.get(&of).map(|e| e.room.clone()) else {
            return Vec::new();
        };
        self.endpoints
            .iter()
            .filter(|(peer, e)| **peer != of && e.room == room)
            .map(|(peer, _)| *peer)
            .collect()
    }

    fn detach(&mut self, peer: PeerId) {
        let others = self.room_peers(peer);
        for other in others {
            self.push(other, TransportEvent::PeerUnlinked(peer));
        }
        self.endpoints.remove(&peer);
    }
}

/// Shared in-process network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Switchboard>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Switchboard> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
        }
    }

    /// Take every event queued for `peer`, oldest first.
    pub fn drain(&self, peer: PeerId) -> Vec<(SessionId, TransportEvent)> {
        let mut board = self.lock();
        let reorder = board.reorder_sync;
        let mut events: Vec<_> = board
            .inboxes
            .get_mut(&peer)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default();
        if reorder {
            reverse_deltas(&mut events);
        }
        events
    }

    pub fn pending(&self, peer: PeerId) -> usize {
        self.lock().inboxes.get(&peer).map_or(0, VecDeque::len)
    }

    /// Cut `peer` off. Its live session sees a dropped link, the other side
    /// sees it unlink, and new sessions for it fail until it comes back.
    pub fn set_offline(&self, peer: PeerId, offline: bool) {
        let mut board = self.lock();
        if !offline {
            board.offline.remove(&peer);
            return;
        }
        board.offline.insert(peer);
        if board.endpoints.contains_key(&peer) {
            board.push(
                peer,
                TransportEvent::Error(TransportError::LinkDropped("network partition".into())),
            );
            board.detach(peer);
        }
    }

    /// Deliver every sync frame twice.
    pub fn set_duplicate_sync(&self, duplicate: bool) {
        self.lock().duplicate_sync = duplicate;
    }

    /// Hand out the deltas of each drain newest first. Other events keep
    /// their positions.
    pub fn set_reorder_sync(&self, reorder: bool) {
        self.lock().reorder_sync = reorder;
    }

    pub fn is_linked(&self, peer: PeerId) -> bool {
        self.lock().endpoints.contains_key(&peer)
    }
}

fn reverse_deltas(events: &mut [(SessionId, TransportEvent)]) {
    let slots: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, (_, event))| {
            matches!(
                event,
                TransportEvent::Sync {
                    frame: SyncFrame::Delta(_),
                    ..
                }
            )
        })
        .map(|(i, _)| i)
        .collect();
    for k in 0..slots.len() / 2 {
        events.swap(slots[k], slots[slots.len() - 1 - k]);
    }
}

pub struct MemoryConnector {
    network: MemoryNetwork,
}

impl TransportConnector for MemoryConnector {
    type Session = MemoryTransport;

    fn open(
        &mut self,
        session: SessionId,
        local: PeerId,
        rendezvous: &RendezvousConfig,
    ) -> Result<MemoryTransport> {
        rendezvous.validate()?;
        let mut board = self.network.lock();
        if board.offline.contains(&local) {
            return Err(TransportError::Signaling(format!(
                "{} unreachable",
                rendezvous.primary_endpoint()
            )));
        }
        if board.endpoints.contains_key(&local) {
            board.detach(local);
        }
        board.endpoints.insert(
            local,
            Endpoint {
                session,
                room: rendezvous.room.clone(),
            },
        );

        board.push(local, TransportEvent::Status { connected: true });
        for other in board.room_peers(local) {
            board.push(local, TransportEvent::PeerLinked(other));
            board.push(other, TransportEvent::PeerLinked(local));
        }
        debug!("{} joined room {} ({})", local, rendezvous.room, session);

        Ok(MemoryTransport {
            network: self.network.clone(),
            local,
            session,
            destroyed: false,
        })
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    local: PeerId,
    session: SessionId,
    destroyed: bool,
}

impl MemoryTransport {
    fn with_board(&self, f: impl FnOnce(&mut Switchboard, Vec<PeerId>)) {
        if self.destroyed {
            return;
        }
        let mut board = self.network.lock();
        let owns_endpoint = board
            .endpoints
            .get(&self.local)
            .is_some_and(|e| e.session == self.session);
        if !owns_endpoint {
            return;
        }
        let peers = board.room_peers(self.local);
        f(&mut *board, peers);
    }

    fn send_sync(&self, frame: SyncFrame, to: Option<PeerId>) {
        let from = self.local;
        self.with_board(|board, peers| {
            let copies = if board.duplicate_sync { 2 } else { 1 };
            for peer in peers.into_iter().filter(|p| to.is_none_or(|t| t == *p)) {
                for _ in 0..copies {
                    board.push(
                        peer,
                        TransportEvent::Sync {
                            from,
                            frame: frame.clone(),
                        },
                    );
                }
            }
        });
    }
}

impl SyncTransport for MemoryTransport {
    fn session(&self) -> SessionId {
        self.session
    }

    fn broadcast_delta(&mut self, delta: &UpdateDelta) {
        self.send_sync(SyncFrame::Delta(delta.bytes().to_vec()), None);
    }

    fn broadcast_awareness(&mut self, message: &PresenceMessage) {
        self.with_board(|board, peers| {
            for peer in peers {
                board.push(peer, TransportEvent::Presence(message.clone()));
            }
        });
    }

    fn broadcast_leave(&mut self, peer: PeerId) {
        self.with_board(|board, peers| {
            for other in peers {
                board.push(other, TransportEvent::Left(peer));
            }
        });
    }

    fn send_to(&mut self, peer: PeerId, frame: SyncFrame) {
        self.send_sync(frame, Some(peer));
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        let mut board = self.network.lock();
        let owns_endpoint = board
            .endpoints
            .get(&self.local)
            .is_some_and(|e| e.session == self.session);
        if owns_endpoint {
            board.detach(self.local);
        }
        drop(board);
        self.destroyed = true;
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}
