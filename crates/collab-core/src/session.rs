//! CollabSession: one participant's engine.
//!
//! Owns the document, presence, connection lifecycle, persistence and
//! history for a single participant and routes between them:
//!
//! - local edit: document → broadcast delta → schedule snapshot → render → history
//! - remote frame: transport event → document/awareness → render → history
//! - timers: `tick(now)` drives retries, debounced writes, heartbeats, pruning
//!
//! Everything runs on the caller's thread. The host feeds transport events
//! and the current time in; nothing here blocks or spawns.

use crate::awareness::{AwarenessRegistry, PeerState, PresenceUser};
use crate::config::SessionConfig;
use crate::connection::{
    ConnectionAction, ConnectionError, ConnectionManager, ConnectionState, SessionId,
};
use crate::debounce::Debouncer;
use crate::document::{DocumentStore, LocalEdit, MergeError, Origin, TextSpan, UpdateDelta};
use crate::events::{EventBus, Subscription, SubscriptionSet};
use crate::history::{ChangeHistory, HistoryEntry};
use crate::peer_id::PeerId;
use crate::persistence::{KeyValueStore, PersistenceGateway};
use crate::protocol::SyncFrame;
use crate::transport::{
    RendezvousConfig, SyncTransport, TransportConnector, TransportError, TransportEvent,
    TransportHooks,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns document content into the rendered form the history compares.
pub trait ContentRenderer {
    fn render(&self, spans: &[TextSpan]) -> String;
}

/// Who caused a rendered change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOrigin {
    Local,
    /// Delivered over the link to this peer.
    Remote(PeerId),
}

/// Notifications for the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DocumentChanged(Origin),
    Connection(ConnectionState),
    /// Connecting gave up. A new `connect` is required.
    ConnectionFailed(ConnectionError),
    PresenceChanged(Vec<PeerState>),
    HistoryRecorded(HistoryEntry),
    /// Debounced rendered content, for the host to save or export.
    ContentSaved(String),
    /// Non-fatal problem (bad delta, failed write).
    Warning(String),
}

pub struct CollabSession<C: TransportConnector, S: KeyValueStore> {
    config: SessionConfig,
    rendezvous: RendezvousConfig,
    local: PeerId,
    document: DocumentStore,
    awareness: AwarenessRegistry,
    connection: ConnectionManager,
    persistence: PersistenceGateway<S>,
    history: ChangeHistory,
    connector: C,
    transport: Option<C::Session>,
    /// Peers the current transport session can reach.
    linked: HashSet<PeerId>,
    /// Version before the first local change made while nobody was linked.
    unsent_since: Option<Vec<u8>>,
    renderer: Box<dyn ContentRenderer>,
    content_save: Debouncer<String>,
    last_rendered: String,
    next_heartbeat_at: Option<u64>,
    hooks: TransportHooks,
    events: Arc<EventBus<SessionEvent>>,
    subscriptions: SubscriptionSet,
    failure_reported: bool,
    torn_down: bool,
}

impl<C: TransportConnector, S: KeyValueStore> CollabSession<C, S> {
    /// Build the engine and restore persisted state.
    ///
    /// A corrupt or unreadable snapshot is discarded and the document
    /// starts empty.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: PeerId,
        user: PresenceUser,
        config: SessionConfig,
        rendezvous: RendezvousConfig,
        connector: C,
        store: S,
        renderer: Box<dyn ContentRenderer>,
        now_ms: u64,
    ) -> Self {
        let persistence = PersistenceGateway::new(store, config.save_debounce);
        let mut document = DocumentStore::new(local);
        if let Some(snapshot) = persistence.load_snapshot() {
            match document.restore(&snapshot) {
                Ok(()) => info!("Restored {} byte snapshot", snapshot.len()),
                Err(e) => warn!("Discarding unusable snapshot: {}", e),
            }
        }
        let history =
            ChangeHistory::from_entries(persistence.load_history(), config.history_capacity);
        let last_rendered = renderer.render(&document.spans());

        let events = Arc::new(EventBus::new());
        let awareness = AwarenessRegistry::new(local, user, now_ms);
        let connection =
            ConnectionManager::new(config.policy.clone(), rendezvous.primary_endpoint());

        let mut subscriptions = SubscriptionSet::new();
        let sink = Arc::clone(&events);
        subscriptions.push(document.on_change(move |delta: &UpdateDelta| {
            sink.emit(&SessionEvent::DocumentChanged(delta.origin()));
        }));
        let sink = Arc::clone(&events);
        subscriptions.push(connection.on_change(move |state| {
            sink.emit(&SessionEvent::Connection(*state));
        }));
        let sink = Arc::clone(&events);
        subscriptions.push(awareness.on_change(move |peers| {
            sink.emit(&SessionEvent::PresenceChanged(peers.clone()));
        }));

        Self {
            content_save: Debouncer::new(config.content_debounce),
            config,
            rendezvous,
            local,
            document,
            awareness,
            connection,
            persistence,
            history,
            connector,
            transport: None,
            linked: HashSet::new(),
            unsent_since: None,
            renderer,
            last_rendered,
            next_heartbeat_at: None,
            hooks: TransportHooks::default(),
            events,
            subscriptions,
            failure_reported: false,
            torn_down: false,
        }
    }

    // ==================== Accessors ====================

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn document(&self) -> &DocumentStore {
        &self.document
    }

    pub fn awareness(&self) -> &AwarenessRegistry {
        &self.awareness
    }

    pub fn history(&self) -> &ChangeHistory {
        &self.history
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_error(&self) -> Option<&ConnectionError> {
        self.connection.last_error()
    }

    pub fn persistence(&self) -> &PersistenceGateway<S> {
        &self.persistence
    }

    pub fn transport(&self) -> Option<&C::Session> {
        self.transport.as_ref()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }

    pub fn rendered(&self) -> &str {
        &self.last_rendered
    }

    pub fn on_event(
        &self,
        listener: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(listener)
    }

    // ==================== Connection ====================

    /// Start (or restart after `Failed`) connecting to the room.
    pub fn connect(&mut self, now_ms: u64) {
        if self.torn_down {
            warn!("connect() after teardown ignored");
            return;
        }
        self.failure_reported = false;
        let actions = self.connection.connect(now_ms);
        self.apply_actions(actions, now_ms);
    }

    fn apply_actions(&mut self, actions: Vec<ConnectionAction>, now_ms: u64) {
        for action in actions {
            match action {
                ConnectionAction::Open(session) => {
                    match self.connector.open(session, self.local, &self.rendezvous) {
                        Ok(transport) => {
                            debug!("Opened transport {}", session);
                            self.transport = Some(transport);
                        }
                        Err(e) => {
                            self.hooks.error(&e);
                            let more = self.connection.on_failure(session, e, now_ms);
                            self.apply_actions(more, now_ms);
                        }
                    }
                }
                ConnectionAction::Close(session) => {
                    if let Some(mut transport) = self.transport.take() {
                        if transport.session() == session {
                            transport.destroy();
                            self.linked.clear();
                            debug!("Closed transport {}", session);
                        } else {
                            self.transport = Some(transport);
                        }
                    }
                }
            }
        }
        self.report_failure();
    }

    fn report_failure(&mut self) {
        if self.connection.state() != ConnectionState::Failed || self.failure_reported {
            return;
        }
        if let Some(error) = self.connection.last_error().cloned() {
            self.failure_reported = true;
            self.next_heartbeat_at = None;
            self.events.emit(&SessionEvent::ConnectionFailed(error));
        }
    }

    // ==================== Local edits ====================

    /// Apply an edit from the editing surface.
    pub fn apply_local_edit(&mut self, edit: LocalEdit, now_ms: u64) -> Result<(), MergeError> {
        self.hold_if_unlinked();
        let delta = self.document.apply_local_change(edit)?;
        if let Some(delta) = delta {
            self.after_local_change(&delta, now_ms);
        }
        Ok(())
    }

    pub fn undo(&mut self, now_ms: u64) -> Result<bool, MergeError> {
        self.hold_if_unlinked();
        let delta = self.document.undo()?;
        let changed = delta.is_some();
        if let Some(delta) = delta {
            self.after_local_change(&delta, now_ms);
        }
        Ok(changed)
    }

    pub fn redo(&mut self, now_ms: u64) -> Result<bool, MergeError> {
        self.hold_if_unlinked();
        let delta = self.document.redo()?;
        let changed = delta.is_some();
        if let Some(delta) = delta {
            self.after_local_change(&delta, now_ms);
        }
        Ok(changed)
    }

    /// Changes made while no peer is linked are held back and pushed to the
    /// first peer that links.
    fn hold_if_unlinked(&mut self) {
        if self.linked.is_empty() && self.unsent_since.is_none() {
            self.unsent_since = Some(self.document.version());
        }
    }

    fn after_local_change(&mut self, delta: &UpdateDelta, now_ms: u64) {
        if !self.linked.is_empty() {
            if let Some(transport) = self.transport.as_mut() {
                transport.broadcast_delta(delta);
            }
        }
        self.document_changed(EditOrigin::Local, now_ms);
    }

    /// Updates held back since nobody was linked, if any.
    fn take_unsent(&mut self) -> Option<Vec<u8>> {
        let since = self.unsent_since.take()?;
        if since == self.document.version() {
            return None;
        }
        match self.document.updates_since(&since) {
            Ok(update) => Some(update),
            Err(e) => {
                self.warn(format!("dropping held local changes: {e}"));
                None
            }
        }
    }

    /// Update the local display name and color.
    pub fn set_local_user(&mut self, user: PresenceUser, now_ms: u64) {
        self.awareness.set_local_state(user, now_ms);
        self.flush_presence();
    }

    // ==================== Transport events ====================

    /// Route one event from the transport session `session`.
    pub fn handle_transport_event(
        &mut self,
        session: SessionId,
        event: TransportEvent,
        now_ms: u64,
    ) {
        let current = self.transport.as_ref().map(|t| t.session());
        if current != Some(session) {
            debug!("Dropping event from stale {}: {:?}", session, event);
            return;
        }

        match event {
            TransportEvent::Status { connected } => {
                self.hooks.status_changed(connected);
                if connected {
                    self.connection.on_connected(session, now_ms);
                    if self.connection.is_connected() {
                        self.next_heartbeat_at = Some(now_ms + self.config.heartbeat_ms());
                        self.awareness.schedule_broadcast();
                        self.flush_presence();
                    }
                } else {
                    let error = TransportError::Signaling("left the rendezvous room".into());
                    let actions = self.connection.on_failure(session, error, now_ms);
                    self.apply_actions(actions, now_ms);
                }
            }
            TransportEvent::PeerLinked(peer) => {
                debug!("Linked with {}", peer);
                self.linked.insert(peer);
                let version = self.document.version();
                let held = self.take_unsent();
                if let Some(transport) = self.transport.as_mut() {
                    transport.send_to(peer, SyncFrame::SyncStep1 { version });
                    if let Some(update) = held {
                        transport.send_to(peer, SyncFrame::Delta(update));
                    }
                }
                self.awareness.schedule_broadcast();
                self.flush_presence();
            }
            TransportEvent::PeerUnlinked(peer) => {
                debug!("Unlinked from {}", peer);
                self.linked.remove(&peer);
            }
            TransportEvent::Sync { from, frame } => self.handle_sync(from, frame, now_ms),
            TransportEvent::Presence(message) => {
                self.awareness
                    .observe_remote(message.peer(), message.user.clone(), now_ms);
                self.hooks.awareness_received(&message);
            }
            TransportEvent::Left(peer) => {
                self.awareness.remove(peer);
            }
            TransportEvent::Error(error) => {
                warn!("Transport error on {}: {}", session, error);
                self.hooks.error(&error);
                let actions = self.connection.on_failure(session, error, now_ms);
                self.apply_actions(actions, now_ms);
            }
        }
    }

    fn handle_sync(&mut self, from: PeerId, frame: SyncFrame, now_ms: u64) {
        match frame {
            SyncFrame::Delta(bytes) | SyncFrame::SyncStep2 { update: bytes } => {
                self.apply_remote(from, UpdateDelta::remote(bytes), now_ms);
            }
            SyncFrame::SyncStep1 { version } => match self.document.updates_since(&version) {
                Ok(update) => {
                    if let Some(transport) = self.transport.as_mut() {
                        transport.send_to(from, SyncFrame::SyncStep2 { update });
                    }
                }
                Err(e) => self.warn(format!("ignoring sync request from {from}: {e}")),
            },
        }
    }

    fn apply_remote(&mut self, from: PeerId, delta: UpdateDelta, now_ms: u64) {
        let before = self.document.version();
        match self.document.apply_remote_delta(&delta) {
            Ok(()) => {
                self.hooks.delta_received(from, &delta);
                if self.document.version() != before {
                    self.document_changed(EditOrigin::Remote(from), now_ms);
                }
            }
            Err(e) => self.warn(format!("rejected delta from {from}: {e}")),
        }
    }

    // ==================== Derived state ====================

    fn document_changed(&mut self, origin: EditOrigin, now_ms: u64) {
        match self.document.snapshot() {
            Ok(bytes) => self.persistence.schedule_snapshot(bytes, now_ms),
            Err(e) => self.warn(format!("snapshot export failed: {e}")),
        }
        let rendered = self.renderer.render(&self.document.spans());
        self.content_rendered(rendered, origin, now_ms);
    }

    /// Accept newly rendered content from the editing surface.
    ///
    /// Records history attributed to `origin` and schedules the content-save
    /// hook. Unchanged content is ignored.
    pub fn content_rendered(&mut self, rendered: String, origin: EditOrigin, now_ms: u64) {
        if rendered == self.last_rendered {
            return;
        }
        let author = match origin {
            EditOrigin::Local => self.awareness.user_for(self.local),
            EditOrigin::Remote(peer) => self.awareness.user_for(peer),
        };
        if let Some(entry) = self.history.record_if_changed(&rendered, &author, now_ms) {
            let entry = entry.clone();
            self.persistence
                .schedule_history_write(self.history.entries(), now_ms);
            self.events.emit(&SessionEvent::HistoryRecorded(entry));
        }
        self.content_save.schedule(rendered.clone(), now_ms);
        self.last_rendered = rendered;
    }

    fn flush_presence(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Some(message) = self.awareness.take_broadcast() {
            transport.broadcast_awareness(&message);
        }
    }

    fn warn(&self, message: String) {
        warn!("{}", message);
        self.events.emit(&SessionEvent::Warning(message));
    }

    // ==================== Timers ====================

    /// Advance every timer to `now_ms`.
    pub fn tick(&mut self, now_ms: u64) {
        let actions = self.connection.tick(now_ms);
        self.apply_actions(actions, now_ms);

        for error in self.persistence.poll(now_ms) {
            self.events.emit(&SessionEvent::Warning(error.to_string()));
        }
        if let Some(content) = self.content_save.poll(now_ms) {
            self.events.emit(&SessionEvent::ContentSaved(content));
        }

        if self.connection.is_connected() {
            if let Some(due) = self.next_heartbeat_at {
                if now_ms >= due {
                    self.awareness.schedule_broadcast();
                    self.next_heartbeat_at = Some(now_ms + self.config.heartbeat_ms());
                }
            }
        }
        self.awareness.prune(now_ms, self.config.stale_after_ms());
        self.flush_presence();
    }

    /// Earliest time at which `tick` has scheduled work.
    pub fn next_deadline(&self) -> Option<u64> {
        let heartbeat = if self.connection.is_connected() {
            self.next_heartbeat_at
        } else {
            None
        };
        [
            self.connection.next_deadline(),
            self.persistence.next_deadline(),
            self.content_save.next_deadline(),
            heartbeat,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Leave the room, cancel all timers, flush pending writes and release
    /// internal subscriptions. Idempotent; the session stays usable for
    /// local reads but will not reconnect.
    pub fn teardown(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.broadcast_leave(self.local);
        }
        let actions = self.connection.teardown();
        self.apply_actions(actions, 0);
        if let Some(mut transport) = self.transport.take() {
            transport.destroy();
        }
        self.linked.clear();

        self.persistence.flush();
        if let Some(content) = self.content_save.flush() {
            self.events.emit(&SessionEvent::ContentSaved(content));
        }
        self.next_heartbeat_at = None;
        self.subscriptions.release();
        self.torn_down = true;
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}
