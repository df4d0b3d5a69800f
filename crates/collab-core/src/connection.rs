//! ConnectionManager: lifecycle of the transport session.
//!
//! ```text
//! Disconnected --connect--> Connecting --connected--> Connected
//! Connecting --failure--> Retrying (retries left) | Failed (exhausted)
//! Retrying --retry timer--> Connecting
//! Connected --link lost--> Retrying
//! any --teardown--> Disconnected
//! ```
//!
//! The manager performs no I/O. Callers feed it transport outcomes and the
//! current time; it answers with [`ConnectionAction`]s telling the host which
//! transport session to open or close. Each attempt gets a fresh
//! [`SessionId`], so outcomes reported for an older session are ignored.

use crate::events::{EventBus, Subscription};
use crate::transport::TransportError;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Retrying,
    Failed,
}

impl ConnectionState {
    /// A session is open or about to be reopened.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Retrying)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Connectivity failures surfaced to the host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connection attempt stalled for {after_ms} ms")]
    Stalled { after_ms: u64 },

    #[error("connection failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ConnectionError>,
    },

    #[error(
        "connection timed out after {after_ms} ms; ensure the signaling server is running at {endpoint}"
    )]
    TimedOut { after_ms: u64, endpoint: String },
}

/// Retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPolicy {
    /// Automatic retries after the initial attempt.
    pub max_retries: u32,
    /// Spacing between attempt starts. An attempt still pending after this
    /// long counts as failed.
    pub retry_interval: Duration,
    /// Absolute budget from `connect()` to `Connected`.
    pub connect_timeout: Duration,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(20),
        }
    }
}

impl ConnectionPolicy {
    fn interval_ms(&self) -> u64 {
        self.retry_interval.as_millis() as u64
    }

    fn timeout_ms(&self) -> u64 {
        self.connect_timeout.as_millis() as u64
    }
}

/// Identifies one transport session (one attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// What the host must do to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open a fresh session with this id.
    Open(SessionId),
    /// Destroy the session, discarding any half-open links.
    Close(SessionId),
}

pub struct ConnectionManager {
    policy: ConnectionPolicy,
    endpoint_hint: String,
    state: ConnectionState,
    session: Option<SessionId>,
    next_session: u64,
    retries_used: u32,
    attempt_started_at: Option<u64>,
    connected_at: Option<u64>,
    next_retry_at: Option<u64>,
    deadline_at: Option<u64>,
    last_error: Option<ConnectionError>,
    changes: Arc<EventBus<ConnectionState>>,
}

impl ConnectionManager {
    /// `endpoint_hint` names the signaling endpoint in timeout errors.
    pub fn new(policy: ConnectionPolicy, endpoint_hint: impl Into<String>) -> Self {
        Self {
            policy,
            endpoint_hint: endpoint_hint.into(),
            state: ConnectionState::Disconnected,
            session: None,
            next_session: 1,
            retries_used: 0,
            attempt_started_at: None,
            connected_at: None,
            next_retry_at: None,
            deadline_at: None,
            last_error: None,
            changes: Arc::new(EventBus::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn retries_used(&self) -> u32 {
        self.retries_used
    }

    /// The most recent failure. Set when `Failed`, cleared by `connect`.
    pub fn last_error(&self) -> Option<&ConnectionError> {
        self.last_error.as_ref()
    }

    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    /// Listen for state transitions, delivered one at a time in order.
    pub fn on_change(
        &self,
        listener: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.changes.subscribe(listener)
    }

    /// Begin connecting. A no-op while a session is already active.
    pub fn connect(&mut self, now_ms: u64) -> Vec<ConnectionAction> {
        if self.state.is_active() {
            debug!("connect() ignored while {}", self.state);
            return Vec::new();
        }
        self.retries_used = 0;
        self.connected_at = None;
        self.last_error = None;
        self.deadline_at = Some(now_ms + self.policy.timeout_ms());

        let mut actions = Vec::new();
        self.start_attempt(now_ms, &mut actions);
        actions
    }

    /// The transport reports that `session` has live links.
    ///
    /// The retry budget is kept until the session has stayed up for a full
    /// `connect_timeout`, so a fault that recurs right after every reconnect
    /// still ends in `Failed`.
    pub fn on_connected(&mut self, session: SessionId, now_ms: u64) {
        if !self.is_current(session) || self.state != ConnectionState::Connecting {
            debug!("Ignoring stale connected event for {}", session);
            return;
        }
        self.connected_at = Some(now_ms);
        self.attempt_started_at = None;
        self.next_retry_at = None;
        self.deadline_at = None;
        self.last_error = None;
        info!("Connected ({})", session);
        self.transition(ConnectionState::Connected);
    }

    /// The transport reports that `session` failed or lost its links.
    pub fn on_failure(
        &mut self,
        session: SessionId,
        error: TransportError,
        now_ms: u64,
    ) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if !self.is_current(session) {
            debug!("Ignoring stale failure for {}: {}", session, error);
            return actions;
        }

        match self.state {
            ConnectionState::Connecting => {
                warn!("Connection attempt failed ({}): {}", session, error);
                self.last_error = Some(error.into());
                self.close_session(&mut actions);
                self.retry_or_fail(now_ms);
            }
            ConnectionState::Connected => {
                warn!("Connection lost ({}): {}", session, error);
                self.last_error = Some(error.into());
                self.close_session(&mut actions);
                let healthy = self
                    .connected_at
                    .take()
                    .is_some_and(|since| now_ms >= since + self.policy.timeout_ms());
                if healthy {
                    self.retries_used = 0;
                }
                self.deadline_at = Some(now_ms + self.policy.timeout_ms());
                self.attempt_started_at = Some(now_ms);
                self.retry_or_fail(now_ms);
            }
            _ => debug!("Failure ignored while {}", self.state),
        }
        actions
    }

    /// Advance timers to `now_ms`.
    pub fn tick(&mut self, now_ms: u64) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        // The absolute timeout wins over any retry due at the same instant.
        let timed_out = self.deadline_at.is_some_and(|deadline| now_ms >= deadline);
        if timed_out
            && matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Retrying
            )
        {
            self.close_session(&mut actions);
            self.fail(ConnectionError::TimedOut {
                after_ms: self.policy.timeout_ms(),
                endpoint: self.endpoint_hint.clone(),
            });
            return actions;
        }

        if self.state == ConnectionState::Connecting {
            if let Some(started) = self.attempt_started_at {
                if now_ms >= started + self.policy.interval_ms() {
                    warn!("Connection attempt stalled ({:?})", self.session);
                    self.last_error = Some(ConnectionError::Stalled {
                        after_ms: now_ms - started,
                    });
                    self.close_session(&mut actions);
                    self.retry_or_fail(now_ms);
                }
            }
        }

        let retry_due = self.next_retry_at.is_some_and(|due| now_ms >= due);
        if self.state == ConnectionState::Retrying && retry_due {
            self.retries_used += 1;
            info!(
                "Retrying connection ({}/{})",
                self.retries_used, self.policy.max_retries
            );
            self.start_attempt(now_ms, &mut actions);
        }

        actions
    }

    /// Earliest time at which `tick` has work to do.
    pub fn next_deadline(&self) -> Option<u64> {
        let stall = match self.state {
            ConnectionState::Connecting => self
                .attempt_started_at
                .map(|s| s + self.policy.interval_ms()),
            _ => None,
        };
        let retry = match self.state {
            ConnectionState::Retrying => self.next_retry_at,
            _ => None,
        };
        let deadline = if self.state.is_active() && !self.is_connected() {
            self.deadline_at
        } else {
            None
        };
        [stall, retry, deadline].into_iter().flatten().min()
    }

    /// Cancel all timers and close the session. Idempotent.
    pub fn teardown(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        self.close_session(&mut actions);
        self.attempt_started_at = None;
        self.connected_at = None;
        self.next_retry_at = None;
        self.deadline_at = None;
        self.transition(ConnectionState::Disconnected);
        actions
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.session == Some(session)
    }

    fn start_attempt(&mut self, now_ms: u64, actions: &mut Vec<ConnectionAction>) {
        self.close_session(actions);
        let session = SessionId(self.next_session);
        self.next_session += 1;
        self.session = Some(session);
        self.attempt_started_at = Some(now_ms);
        self.next_retry_at = None;
        self.transition(ConnectionState::Connecting);
        actions.push(ConnectionAction::Open(session));
    }

    fn close_session(&mut self, actions: &mut Vec<ConnectionAction>) {
        if let Some(session) = self.session.take() {
            actions.push(ConnectionAction::Close(session));
        }
    }

    fn retry_or_fail(&mut self, now_ms: u64) {
        if self.retries_used >= self.policy.max_retries {
            let last = self.last_error.clone().unwrap_or(ConnectionError::Stalled {
                after_ms: self.policy.interval_ms(),
            });
            self.fail(ConnectionError::RetriesExhausted {
                attempts: self.retries_used + 1,
                last: Box::new(last),
            });
            return;
        }
        let due = self
            .attempt_started_at
            .map(|s| s + self.policy.interval_ms())
            .unwrap_or(now_ms)
            .max(now_ms);
        self.next_retry_at = Some(due);
        self.transition(ConnectionState::Retrying);
    }

    fn fail(&mut self, error: ConnectionError) {
        warn!("Connection failed: {}", error);
        self.last_error = Some(error);
        self.attempt_started_at = None;
        self.connected_at = None;
        self.next_retry_at = None;
        self.deadline_at = None;
        self.transition(ConnectionState::Failed);
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!("Connection state {} -> {}", self.state, next);
        self.state = next;
        self.changes.emit(&next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(ConnectionPolicy::default(), "wss://signal.test")
    }

    fn opened(actions: &[ConnectionAction]) -> SessionId {
        actions
            .iter()
            .find_map(|a| match a {
                ConnectionAction::Open(s) => Some(*s),
                _ => None,
            })
            .expect("an Open action")
    }

    fn signaling_down() -> TransportError {
        TransportError::Signaling("refused".into())
    }

    fn record_states(mgr: &ConnectionManager) -> (Arc<Mutex<Vec<ConnectionState>>>, Subscription) {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        let sub = mgr.on_change(move |s| sink.lock().unwrap().push(*s));
        (states, sub)
    }

    // ==================== Happy path ====================

    #[test]
    fn test_connect_then_connected() {
        let mut mgr = manager();
        let (states, _sub) = record_states(&mgr);

        let session = opened(&mgr.connect(0));
        mgr.on_connected(session, 100);

        assert!(mgr.is_connected());
        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(mgr.next_deadline(), None);
    }

    #[test]
    fn test_connect_is_noop_while_active() {
        let mut mgr = manager();
        mgr.connect(0);
        assert!(mgr.connect(10).is_empty());
    }

    #[test]
    fn test_connected_cancels_pending_retry() {
        let mut mgr = manager();
        let first = opened(&mgr.connect(0));
        mgr.on_failure(first, signaling_down(), 100);
        assert_eq!(mgr.state(), ConnectionState::Retrying);

        let second = opened(&mgr.tick(5_000));
        mgr.on_connected(second, 5_100);

        assert!(mgr.tick(10_000).is_empty());
        assert!(mgr.tick(25_000).is_empty());
        assert!(mgr.is_connected());
    }

    // ==================== Retry policy ====================

    #[test]
    fn test_retry_waits_interval_from_attempt_start() {
        let mut mgr = manager();
        let first = opened(&mgr.connect(0));
        mgr.on_failure(first, signaling_down(), 1_000);

        assert!(mgr.tick(4_999).is_empty());
        let actions = mgr.tick(5_000);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ConnectionAction::Open(_)));
        assert_eq!(mgr.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_fails_after_three_retries_never_a_fourth() {
        let mut mgr = manager();
        let mut session = opened(&mgr.connect(0));
        let mut now = 0;

        for retry in 1..=3 {
            mgr.on_failure(session, signaling_down(), now + 10);
            now += 5_000;
            session = opened(&mgr.tick(now));
            assert_eq!(mgr.retries_used(), retry);
        }
        mgr.on_failure(session, signaling_down(), now + 10);

        assert_eq!(mgr.state(), ConnectionState::Failed);
        assert!(matches!(
            mgr.last_error(),
            Some(ConnectionError::RetriesExhausted { attempts: 4, .. })
        ));
        assert!(mgr.tick(now + 60_000).is_empty());
        assert_eq!(mgr.next_deadline(), None);
    }

    #[test]
    fn test_stalled_attempts_hit_absolute_timeout() {
        let mut mgr = manager();
        mgr.connect(0);

        let mut opens = 0;
        for now in (1_000..=20_000).step_by(1_000) {
            opens += mgr
                .tick(now)
                .iter()
                .filter(|a| matches!(a, ConnectionAction::Open(_)))
                .count();
        }

        // Retries at 5s, 10s, 15s; the 20s deadline fires before a 4th.
        assert_eq!(opens, 3);
        assert_eq!(mgr.state(), ConnectionState::Failed);
        let err = mgr.last_error().unwrap().to_string();
        assert!(err.contains("timed out"));
        assert!(err.contains("wss://signal.test"));
    }

    #[test]
    fn test_timeout_closes_open_session() {
        let mut mgr = manager();
        let session = opened(&mgr.connect(0));
        let actions = mgr.tick(20_000);
        assert_eq!(actions, vec![ConnectionAction::Close(session)]);
    }

    #[test]
    fn test_failure_closes_session_before_retry() {
        let mut mgr = manager();
        let first = opened(&mgr.connect(0));
        let actions = mgr.on_failure(first, signaling_down(), 10);
        assert_eq!(actions, vec![ConnectionAction::Close(first)]);

        let actions = mgr.tick(5_000);
        let second = opened(&actions);
        assert_ne!(first, second);
    }

    // ==================== Stale events ====================

    #[test]
    fn test_stale_session_events_ignored() {
        let mut mgr = manager();
        let first = opened(&mgr.connect(0));
        mgr.on_failure(first, signaling_down(), 10);
        let second = opened(&mgr.tick(5_000));

        mgr.on_connected(first, 5_010);
        assert_eq!(mgr.state(), ConnectionState::Connecting);
        assert!(mgr.on_failure(first, signaling_down(), 5_020).is_empty());

        mgr.on_connected(second, 5_030);
        assert!(mgr.is_connected());
    }

    // ==================== Link loss ====================

    #[test]
    fn test_link_drop_retries_with_fresh_budget() {
        let mut mgr = manager();
        let session = opened(&mgr.connect(0));
        mgr.on_connected(session, 50);

        let actions = mgr.on_failure(
            session,
            TransportError::LinkDropped("reset".into()),
            100_000,
        );
        assert_eq!(actions, vec![ConnectionAction::Close(session)]);
        assert_eq!(mgr.state(), ConnectionState::Retrying);
        assert_eq!(mgr.retries_used(), 0);

        assert!(mgr.tick(104_999).is_empty());
        opened(&mgr.tick(105_000));
    }

    #[test]
    fn test_repeated_drops_right_after_reconnect_exhaust_budget() {
        let mut mgr = manager();
        let mut session = opened(&mgr.connect(0));
        mgr.on_connected(session, 10);
        let mut now = 10;

        for retry in 1..=3 {
            mgr.on_failure(session, TransportError::Traversal("no route".into()), now);
            assert_eq!(mgr.state(), ConnectionState::Retrying);
            now += 5_000;
            session = opened(&mgr.tick(now));
            assert_eq!(mgr.retries_used(), retry);
            mgr.on_connected(session, now + 10);
            now += 10;
        }
        mgr.on_failure(session, TransportError::Traversal("no route".into()), now);

        assert_eq!(mgr.state(), ConnectionState::Failed);
        let err = mgr.last_error().unwrap().to_string();
        assert!(err.contains("after 4 attempts"), "{err}");
        assert!(err.contains("no route"), "{err}");
    }

    // ==================== Teardown ====================

    #[test]
    fn test_teardown_cancels_timers_and_is_idempotent() {
        let mut mgr = manager();
        let session = opened(&mgr.connect(0));
        mgr.on_failure(session, signaling_down(), 10);

        assert!(mgr.teardown().is_empty());
        assert!(mgr.teardown().is_empty());
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(mgr.tick(30_000).is_empty());
        assert_eq!(mgr.next_deadline(), None);
    }

    #[test]
    fn test_teardown_closes_live_session() {
        let mut mgr = manager();
        let session = opened(&mgr.connect(0));
        mgr.on_connected(session, 10);
        assert_eq!(mgr.teardown(), vec![ConnectionAction::Close(session)]);
    }

    #[test]
    fn test_reconnect_after_failed_requires_connect() {
        let mut mgr = manager();
        mgr.connect(0);
        mgr.tick(20_000);
        assert_eq!(mgr.state(), ConnectionState::Failed);

        let session = opened(&mgr.connect(30_000));
        assert_eq!(mgr.state(), ConnectionState::Connecting);
        assert!(mgr.last_error().is_none());
        mgr.on_connected(session, 30_100);
        assert!(mgr.is_connected());
    }

    #[test]
    fn test_states_strictly_ordered() {
        let mut mgr = manager();
        let (states, _sub) = record_states(&mgr);
        let first = opened(&mgr.connect(0));
        mgr.on_failure(first, signaling_down(), 10);
        mgr.tick(5_000);
        mgr.teardown();

        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Retrying,
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
            ]
        );
    }
}
