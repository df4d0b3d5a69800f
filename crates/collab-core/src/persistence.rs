//! Durable state: debounced snapshot and history writes.
//!
//! Storage is a string-valued key/value store. Two keys are used:
//! - `editor-state`: the document snapshot as a JSON array of byte values
//! - `editHistory`: the history ring as a JSON array of entries
//!
//! Writes are coalesced per key by a [`Debouncer`]; only the latest payload
//! reaches storage. Storage failures are logged and retried on the next
//! quiet period. They never stop editing.
//!
//! Implementations:
//! - `InMemoryStore` - for testing
//! - `FileStore` (in collab-peer) - one file per key, atomic rename

use crate::debounce::Debouncer;
use crate::history::HistoryEntry;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const SNAPSHOT_KEY: &str = "editor-state";
pub const HISTORY_KEY: &str = "editHistory";
pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_millis(1000);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("write to {key:?} rejected: {reason}")]
    WriteRejected { key: String, reason: String },

    #[error("failed to encode {key:?}: {reason}")]
    Encode { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// String-valued key/value storage.
///
/// `set` must replace the value atomically: a reader sees either the old
/// value or the new one, never a partial write.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store for tests. Counts writes and can be told to reject them.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    values: RwLock<HashMap<String, String>>,
    writes: AtomicUsize,
    reject_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful `set` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .read()
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::WriteRejected {
                key: key.to_string(),
                reason: "quota exceeded".to_string(),
            });
        }
        let mut values = self
            .values
            .write()
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
        values.insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
        values.remove(key);
        Ok(())
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

/// Debounced writer and startup reader for persisted state.
pub struct PersistenceGateway<S> {
    store: S,
    snapshot: Debouncer<Vec<u8>>,
    history: Debouncer<Vec<HistoryEntry>>,
}

impl<S: KeyValueStore> PersistenceGateway<S> {
    pub fn new(store: S, quiet: Duration) -> Self {
        Self {
            store,
            snapshot: Debouncer::new(quiet),
            history: Debouncer::new(quiet),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Queue a snapshot; replaces any snapshot still waiting.
    pub fn schedule_snapshot(&mut self, bytes: Vec<u8>, now_ms: u64) {
        self.snapshot.schedule(bytes, now_ms);
    }

    pub fn schedule_history_write(&mut self, entries: Vec<HistoryEntry>, now_ms: u64) {
        self.history.schedule(entries, now_ms);
    }

    /// The last persisted snapshot. Missing or corrupt data yields `None`.
    pub fn load_snapshot(&self) -> Option<Vec<u8>> {
        let raw = match self.store.get(SNAPSHOT_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Could not read {}: {}", SNAPSHOT_KEY, e);
                return None;
            }
        };
        match serde_json::from_str::<Vec<u8>>(&raw) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Discarding corrupt {}: {}", SNAPSHOT_KEY, e);
                None
            }
        }
    }

    /// The last persisted history, oldest first. Empty if absent or corrupt.
    pub fn load_history(&self) -> Vec<HistoryEntry> {
        let raw = match self.store.get(HISTORY_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("Could not read {}: {}", HISTORY_KEY, e);
                return Vec::new();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Discarding corrupt {}: {}", HISTORY_KEY, e);
            Vec::new()
        })
    }

    /// Write whatever is due. Failed writes are re-armed for another quiet
    /// period and returned for reporting.
    pub fn poll(&mut self, now_ms: u64) -> Vec<PersistenceError> {
        let mut errors = Vec::new();

        if let Some(bytes) = self.snapshot.poll(now_ms) {
            if let Err(e) = self.write_snapshot(&bytes) {
                warn!("Snapshot write failed, will retry: {}", e);
                self.snapshot.schedule(bytes, now_ms);
                errors.push(e);
            }
        }
        if let Some(entries) = self.history.poll(now_ms) {
            if let Err(e) = self.write_history(&entries) {
                warn!("History write failed, will retry: {}", e);
                self.history.schedule(entries, now_ms);
                errors.push(e);
            }
        }
        errors
    }

    /// Write everything pending now. Errors are logged, never raised.
    pub fn flush(&mut self) {
        if let Some(bytes) = self.snapshot.flush() {
            if let Err(e) = self.write_snapshot(&bytes) {
                warn!("Final snapshot write failed: {}", e);
            }
        }
        if let Some(entries) = self.history.flush() {
            if let Err(e) = self.write_history(&entries) {
                warn!("Final history write failed: {}", e);
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.snapshot.is_pending() || self.history.is_pending()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        [self.snapshot.next_deadline(), self.history.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    fn write_snapshot(&self, bytes: &[u8]) -> Result<()> {
        let json = serde_json::to_string(bytes).map_err(|e| PersistenceError::Encode {
            key: SNAPSHOT_KEY.to_string(),
            reason: e.to_string(),
        })?;
        self.store.set(SNAPSHOT_KEY, &json)?;
        debug!("Persisted {} byte snapshot", bytes.len());
        Ok(())
    }

    fn write_history(&self, entries: &[HistoryEntry]) -> Result<()> {
        let json = serde_json::to_string(entries).map_err(|e| PersistenceError::Encode {
            key: HISTORY_KEY.to_string(),
            reason: e.to_string(),
        })?;
        self.store.set(HISTORY_KEY, &json)?;
        debug!("Persisted {} history entries", entries.len());
        Ok(())
    }
}
