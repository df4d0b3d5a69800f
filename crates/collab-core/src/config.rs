//! Engine timings and limits.

use crate::connection::ConnectionPolicy;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::persistence::DEFAULT_SAVE_DEBOUNCE;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub policy: ConnectionPolicy,
    /// Quiet period before snapshot and history writes.
    pub save_debounce: Duration,
    /// Quiet period before the rendered content is handed to the host.
    pub content_debounce: Duration,
    /// Remote presence older than this is pruned.
    pub stale_after: Duration,
    /// Presence is re-broadcast this often while connected.
    pub awareness_heartbeat: Duration,
    pub history_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: ConnectionPolicy::default(),
            save_debounce: DEFAULT_SAVE_DEBOUNCE,
            content_debounce: Duration::from_millis(500),
            stale_after: Duration::from_secs(30),
            awareness_heartbeat: Duration::from_secs(15),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub(crate) fn stale_after_ms(&self) -> u64 {
        self.stale_after.as_millis() as u64
    }

    pub(crate) fn heartbeat_ms(&self) -> u64 {
        self.awareness_heartbeat.as_millis() as u64
    }
}
