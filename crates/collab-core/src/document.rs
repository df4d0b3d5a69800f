//! DocumentStore: the replicated rich-text document.
//!
//! The document is a single Loro doc holding one `LoroText` named `content`.
//! Paragraphs are separated by `\n`; inline formatting is stored as Loro
//! marks. Every mutation, local or remote, goes through this type.
//!
//! Local edits are exported as incremental updates relative to the version
//! vector captured right before the edit, so the returned delta carries exactly
//! that change. Remote deltas are imported; Loro merges are idempotent and
//! commutative, and updates whose causal predecessors are missing are held as
//! pending until those arrive.

use crate::events::{EventBus, Subscription};
use crate::peer_id::PeerId;
use loro::{
    ExpandType, ExportMode, LoroDoc, LoroText, StyleConfig, StyleConfigMap, UndoManager,
    UpdateOptions, VersionVector,
};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const CONTENT_KEY: &str = "content";
const MAX_UNDO_STEPS: usize = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// The payload could not be decoded. State is unchanged.
    #[error("malformed delta: {0}")]
    Malformed(String),

    #[error("invalid edit: {0}")]
    InvalidEdit(String),

    #[error("failed to export document state: {0}")]
    Export(String),
}

pub type Result<T> = std::result::Result<T, MergeError>;

/// Where a delta came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Immutable binary change payload.
#[derive(Clone, PartialEq, Eq)]
pub struct UpdateDelta {
    bytes: Arc<[u8]>,
    origin: Origin,
}

impl UpdateDelta {
    pub fn local(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
            origin: Origin::Local,
        }
    }

    pub fn remote(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
            origin: Origin::Remote,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for UpdateDelta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateDelta")
            .field("origin", &self.origin)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Inline formatting mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mark {
    Bold,
    Italic,
    Underline,
    Strike,
    Code,
    Link(String),
    Highlight(String),
    Color(String),
    FontSize(String),
}

impl Mark {
    /// The Loro style key this mark is stored under.
    pub fn key(&self) -> &'static str {
        match self {
            Mark::Bold => "bold",
            Mark::Italic => "italic",
            Mark::Underline => "underline",
            Mark::Strike => "strike",
            Mark::Code => "code",
            Mark::Link(_) => "link",
            Mark::Highlight(_) => "highlight",
            Mark::Color(_) => "color",
            Mark::FontSize(_) => "fontSize",
        }
    }

    fn value(&self) -> loro::LoroValue {
        match self {
            Mark::Bold | Mark::Italic | Mark::Underline | Mark::Strike | Mark::Code => true.into(),
            Mark::Link(v) | Mark::Highlight(v) | Mark::Color(v) | Mark::FontSize(v) => {
                v.as_str().into()
            }
        }
    }

    fn expand(&self) -> ExpandType {
        match self {
            // Typing right after a link or inline code should not extend it.
            Mark::Link(_) | Mark::Code => ExpandType::None,
            _ => ExpandType::After,
        }
    }

    fn style_config() -> StyleConfigMap {
        let mut styles = StyleConfigMap::new();
        let all = [
            Mark::Bold,
            Mark::Italic,
            Mark::Underline,
            Mark::Strike,
            Mark::Code,
            Mark::Link(String::new()),
            Mark::Highlight(String::new()),
            Mark::Color(String::new()),
            Mark::FontSize(String::new()),
        ];
        for mark in all {
            styles.insert(
                mark.key().into(),
                StyleConfig {
                    expand: mark.expand(),
                },
            );
        }
        styles
    }
}

/// An edit issued by the editing surface. Positions count Unicode scalars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEdit {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
    /// Replace the whole text, diffed line by line.
    Replace { text: String },
    Format { range: Range<usize>, mark: Mark },
    Unformat { range: Range<usize>, mark: Mark },
}

/// A run of text sharing the same marks.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub text: String,
    pub marks: BTreeMap<String, serde_json::Value>,
}

/// Owner of the replicated document.
pub struct DocumentStore {
    doc: LoroDoc,
    undo: UndoManager,
    peer_id: PeerId,
    changes: Arc<EventBus<UpdateDelta>>,
}

impl DocumentStore {
    /// Create an empty document whose local edits are authored by `peer_id`.
    pub fn new(peer_id: PeerId) -> Self {
        let doc = Self::fresh_doc(peer_id);
        let undo = Self::undo_manager(&doc);
        Self {
            doc,
            undo,
            peer_id,
            changes: Arc::new(EventBus::new()),
        }
    }

    fn fresh_doc(peer_id: PeerId) -> LoroDoc {
        let doc = LoroDoc::new();
        if let Err(e) = doc.set_peer_id(peer_id.as_u64()) {
            warn!("Failed to set document peer ID {}: {}", peer_id, e);
        }
        doc.config_text_style(Mark::style_config());
        doc
    }

    fn undo_manager(doc: &LoroDoc) -> UndoManager {
        let mut undo = UndoManager::new(doc);
        undo.set_max_undo_steps(MAX_UNDO_STEPS);
        undo
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn text(&self) -> LoroText {
        self.doc.get_text(CONTENT_KEY)
    }

    /// Apply a local edit and return the delta for exactly that change.
    ///
    /// Returns `Ok(None)` when the edit did not change the document
    /// (e.g. replacing text with itself). Invalid positions fail without
    /// mutating anything.
    pub fn apply_local_change(&mut self, edit: LocalEdit) -> Result<Option<UpdateDelta>> {
        let before = self.doc.oplog_vv();
        self.perform(&edit)?;
        self.doc.commit();
        self.capture_local(&before)
    }

    fn perform(&self, edit: &LocalEdit) -> Result<()> {
        let text = self.text();
        let len = text.len_unicode();
        let invalid = |e: loro::LoroError| MergeError::InvalidEdit(e.to_string());

        match edit {
            LocalEdit::Insert { index, text: s } => {
                if *index > len {
                    return Err(MergeError::InvalidEdit(format!(
                        "insert at {index} beyond length {len}"
                    )));
                }
                text.insert(*index, s).map_err(invalid)
            }
            LocalEdit::Delete { index, len: count } => {
                if index.saturating_add(*count) > len {
                    return Err(MergeError::InvalidEdit(format!(
                        "delete {index}..{} beyond length {len}",
                        index.saturating_add(*count)
                    )));
                }
                text.delete(*index, *count).map_err(invalid)
            }
            LocalEdit::Replace { text: s } => {
                if text.to_string() == *s {
                    return Ok(());
                }
                text.update_by_line(s, UpdateOptions::default())
                    .map_err(|e| MergeError::InvalidEdit(format!("{:?}", e)))
            }
            LocalEdit::Format { range, mark } => {
                check_range(range, len)?;
                text.mark(range.clone(), mark.key(), mark.value())
                    .map_err(invalid)
            }
            LocalEdit::Unformat { range, mark } => {
                check_range(range, len)?;
                text.unmark(range.clone(), mark.key()).map_err(invalid)
            }
        }
    }

    /// Export whatever this peer committed since `before` and notify listeners.
    fn capture_local(&self, before: &VersionVector) -> Result<Option<UpdateDelta>> {
        if self.doc.oplog_vv() == *before {
            return Ok(None);
        }
        let bytes = self
            .doc
            .export(ExportMode::updates(before))
            .map_err(|e| MergeError::Export(e.to_string()))?;
        let delta = UpdateDelta::local(bytes);
        debug!("Local change produced {} byte delta", delta.len());
        self.changes.emit(&delta);
        Ok(Some(delta))
    }

    /// Merge a delta from any peer.
    ///
    /// Duplicate and out-of-order deliveries are accepted. Listeners fire only
    /// when the document actually changed.
    pub fn apply_remote_delta(&mut self, delta: &UpdateDelta) -> Result<()> {
        let before = self.doc.oplog_vv();
        self.doc
            .import(delta.bytes())
            .map_err(|e| MergeError::Malformed(e.to_string()))?;

        if self.doc.oplog_vv() != before {
            let incoming = UpdateDelta::remote(delta.bytes().to_vec());
            self.changes.emit(&incoming);
        } else {
            debug!("Remote delta already known or still pending");
        }
        Ok(())
    }

    /// Full serialization of the current state.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| MergeError::Export(e.to_string()))
    }

    /// Replace state from a snapshot. On failure the current state is kept.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        let doc = Self::fresh_doc(self.peer_id);
        doc.import(bytes)
            .map_err(|e| MergeError::Malformed(e.to_string()))?;
        self.undo = Self::undo_manager(&doc);
        self.doc = doc;
        Ok(())
    }

    /// Encoded version vector, sent to a newly linked peer so it can reply
    /// with the updates we lack.
    pub fn version(&self) -> Vec<u8> {
        self.doc.oplog_vv().encode()
    }

    /// Updates a peer at `encoded_version` is missing.
    pub fn updates_since(&self, encoded_version: &[u8]) -> Result<Vec<u8>> {
        let version = VersionVector::decode(encoded_version)
            .map_err(|e| MergeError::Malformed(e.to_string()))?;
        self.doc
            .export(ExportMode::updates(&version))
            .map_err(|e| MergeError::Export(e.to_string()))
    }

    /// Undo the most recent local edit. Remote edits are never undone.
    pub fn undo(&mut self) -> Result<Option<UpdateDelta>> {
        let before = self.doc.oplog_vv();
        self.undo
            .undo()
            .map_err(|e| MergeError::InvalidEdit(e.to_string()))?;
        self.doc.commit();
        self.capture_local(&before)
    }

    pub fn redo(&mut self) -> Result<Option<UpdateDelta>> {
        let before = self.doc.oplog_vv();
        self.undo
            .redo()
            .map_err(|e| MergeError::InvalidEdit(e.to_string()))?;
        self.doc.commit();
        self.capture_local(&before)
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    /// Register a listener for every successful mutation.
    pub fn on_change(
        &self,
        listener: impl Fn(&UpdateDelta) + Send + Sync + 'static,
    ) -> Subscription {
        self.changes.subscribe(listener)
    }

    /// Plain text with paragraphs separated by `\n`.
    pub fn plain_text(&self) -> String {
        self.text().to_string()
    }

    pub fn len(&self) -> usize {
        self.text().len_unicode()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The text as runs of identically formatted characters.
    pub fn spans(&self) -> Vec<TextSpan> {
        let mut spans = Vec::new();
        let loro::LoroValue::List(items) = self.text().get_richtext_value() else {
            return spans;
        };
        for item in items.iter() {
            let loro::LoroValue::Map(map) = item else {
                continue;
            };
            let text = match map.get("insert") {
                Some(loro::LoroValue::String(s)) => s.to_string(),
                _ => continue,
            };
            let mut marks = BTreeMap::new();
            if let Some(loro::LoroValue::Map(attributes)) = map.get("attributes") {
                for (key, value) in attributes.iter() {
                    if let Ok(json) = loro_value_to_json(value) {
                        // A null attribute is an unmark tombstone.
                        if !json.is_null() {
                            marks.insert(key.to_string(), json);
                        }
                    }
                }
            }
            spans.push(TextSpan { text, marks });
        }
        spans
    }
}

fn check_range(range: &Range<usize>, len: usize) -> Result<()> {
    if range.start >= range.end || range.end > len {
        return Err(MergeError::InvalidEdit(format!(
            "range {}..{} invalid for length {len}",
            range.start, range.end
        )));
    }
    Ok(())
}

fn loro_value_to_json(value: &loro::LoroValue) -> std::result::Result<serde_json::Value, ()> {
    match value {
        loro::LoroValue::Null => Ok(serde_json::Value::Null),
        loro::LoroValue::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        loro::LoroValue::I64(n) => Ok(serde_json::json!(*n)),
        loro::LoroValue::Double(n) => Ok(serde_json::json!(*n)),
        loro::LoroValue::String(s) => Ok(serde_json::Value::String(s.to_string())),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn store(id: u64) -> DocumentStore {
        DocumentStore::new(PeerId::from(id))
    }

    fn insert(store: &mut DocumentStore, index: usize, text: &str) -> UpdateDelta {
        store
            .apply_local_change(LocalEdit::Insert {
                index,
                text: text.to_string(),
            })
            .unwrap()
            .expect("insert changes the document")
    }

    // ==================== Local edits ====================

    #[test]
    fn test_local_insert_returns_local_delta() {
        let mut doc = store(1);
        let delta = insert(&mut doc, 0, "Hello");

        assert!(delta.is_local());
        assert!(!delta.is_empty());
        assert_eq!(doc.plain_text(), "Hello");
    }

    #[test]
    fn test_delta_carries_only_that_change() {
        let mut a = store(1);
        let first = insert(&mut a, 0, "Hello");
        let second = insert(&mut a, 5, " world");

        let mut b = store(2);
        b.apply_remote_delta(&UpdateDelta::remote(first.bytes().to_vec()))
            .unwrap();
        assert_eq!(b.plain_text(), "Hello");

        b.apply_remote_delta(&UpdateDelta::remote(second.bytes().to_vec()))
            .unwrap();
        assert_eq!(b.plain_text(), "Hello world");
    }

    #[test]
    fn test_out_of_range_edit_rejected_without_mutation() {
        let mut doc = store(1);
        insert(&mut doc, 0, "abc");

        let err = doc
            .apply_local_change(LocalEdit::Delete { index: 2, len: 5 })
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidEdit(_)));

        let err = doc
            .apply_local_change(LocalEdit::Insert {
                index: 9,
                text: "x".into(),
            })
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidEdit(_)));
        assert_eq!(doc.plain_text(), "abc");
    }

    #[test]
    fn test_replace_with_same_text_is_noop() {
        let mut doc = store(1);
        insert(&mut doc, 0, "same");

        let delta = doc
            .apply_local_change(LocalEdit::Replace {
                text: "same".into(),
            })
            .unwrap();
        assert!(delta.is_none());
    }

    #[test]
    fn test_format_produces_marked_span() {
        let mut doc = store(1);
        insert(&mut doc, 0, "Hello world");
        doc.apply_local_change(LocalEdit::Format {
            range: 0..5,
            mark: Mark::Bold,
        })
        .unwrap();

        let spans = doc.spans();
        assert_eq!(spans[0].text, "Hello");
        assert_eq!(spans[0].marks.get("bold"), Some(&serde_json::json!(true)));
        assert_eq!(spans[1].text, " world");
        assert!(spans[1].marks.is_empty());
    }

    #[test]
    fn test_unformat_removes_mark() {
        let mut doc = store(1);
        insert(&mut doc, 0, "Hello");
        doc.apply_local_change(LocalEdit::Format {
            range: 0..5,
            mark: Mark::Italic,
        })
        .unwrap();
        doc.apply_local_change(LocalEdit::Unformat {
            range: 0..5,
            mark: Mark::Italic,
        })
        .unwrap();

        assert!(doc.spans().iter().all(|s| !s.marks.contains_key("italic")));
    }

    #[test]
    fn test_empty_format_range_rejected() {
        let mut doc = store(1);
        insert(&mut doc, 0, "Hello");
        let err = doc
            .apply_local_change(LocalEdit::Format {
                range: 3..3,
                mark: Mark::Bold,
            })
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidEdit(_)));
    }

    // ==================== Remote merge ====================

    #[test]
    fn test_merge_is_commutative() {
        let mut a = store(1);
        let mut b = store(2);
        let da = insert(&mut a, 0, "left");
        let db = insert(&mut b, 0, "right");

        let mut x = store(3);
        x.apply_remote_delta(&da).unwrap();
        x.apply_remote_delta(&db).unwrap();

        let mut y = store(4);
        y.apply_remote_delta(&db).unwrap();
        y.apply_remote_delta(&da).unwrap();

        assert_eq!(x.plain_text(), y.plain_text());
        assert_eq!(x.spans(), y.spans());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = store(1);
        let delta = insert(&mut a, 0, "once");

        let mut b = store(2);
        b.apply_remote_delta(&delta).unwrap();
        let first = b.plain_text();
        b.apply_remote_delta(&delta).unwrap();

        assert_eq!(b.plain_text(), first);
        assert_eq!(b.plain_text(), "once");
    }

    #[test]
    fn test_out_of_causal_order_delivery_converges() {
        let mut a = store(1);
        let first = insert(&mut a, 0, "Hello");
        let second = insert(&mut a, 5, "!");

        let mut b = store(2);
        b.apply_remote_delta(&second).unwrap();
        assert_eq!(b.plain_text(), "");
        b.apply_remote_delta(&first).unwrap();

        assert_eq!(b.plain_text(), "Hello!");
    }

    #[test]
    fn test_malformed_delta_rejected() {
        let mut doc = store(1);
        insert(&mut doc, 0, "keep");

        let garbage = UpdateDelta::remote(vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        let err = doc.apply_remote_delta(&garbage).unwrap_err();

        assert!(matches!(err, MergeError::Malformed(_)));
        assert_eq!(doc.plain_text(), "keep");
    }

    #[test]
    fn test_offline_edits_converge_after_exchange() {
        let mut a = store(1);
        let base = insert(&mut a, 0, "Hello");
        let mut b = store(2);
        b.apply_remote_delta(&base).unwrap();

        // Both edit while disconnected.
        let from_a = a
            .apply_local_change(LocalEdit::Replace {
                text: "Hello world".into(),
            })
            .unwrap()
            .unwrap();
        let from_b = insert(&mut b, 5, "!");

        a.apply_remote_delta(&from_b).unwrap();
        b.apply_remote_delta(&from_a).unwrap();

        assert_eq!(a.plain_text(), b.plain_text());
        assert!(a.plain_text().contains("world"));
        assert!(a.plain_text().contains('!'));
    }

    // ==================== Listeners ====================

    #[test]
    fn test_on_change_sees_local_and_remote_in_order() {
        let mut a = store(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = a.on_change(move |d| sink.lock().unwrap().push(d.origin()));

        insert(&mut a, 0, "x");
        let mut b = store(2);
        let remote = insert(&mut b, 0, "y");
        a.apply_remote_delta(&remote).unwrap();
        // Duplicate: no notification.
        a.apply_remote_delta(&remote).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![Origin::Local, Origin::Remote]);
    }

    // ==================== Snapshot & sync ====================

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut a = store(1);
        insert(&mut a, 0, "Hello\nSecond paragraph");
        a.apply_local_change(LocalEdit::Format {
            range: 0..5,
            mark: Mark::Link("https://example.com".into()),
        })
        .unwrap();

        let mut b = store(1);
        b.restore(&a.snapshot().unwrap()).unwrap();

        assert_eq!(b.plain_text(), a.plain_text());
        assert_eq!(b.spans(), a.spans());
    }

    #[test]
    fn test_restore_failure_keeps_state() {
        let mut doc = store(1);
        insert(&mut doc, 0, "intact");
        assert!(doc.restore(b"not a snapshot").is_err());
        assert_eq!(doc.plain_text(), "intact");
    }

    #[test]
    fn test_updates_since_version_catches_peer_up() {
        let mut a = store(1);
        insert(&mut a, 0, "abc");
        let mut b = store(2);

        let missing = a.updates_since(&b.version()).unwrap();
        b.apply_remote_delta(&UpdateDelta::remote(missing)).unwrap();

        assert_eq!(b.plain_text(), "abc");
    }

    #[test]
    fn test_updates_since_rejects_bad_version() {
        let a = store(1);
        assert!(matches!(
            a.updates_since(&[0xff, 0xff, 0xff]),
            Err(MergeError::Malformed(_))
        ));
    }

    // ==================== Undo ====================

    #[test]
    fn test_undo_redo_local_edit() {
        let mut doc = store(1);
        insert(&mut doc, 0, "Hello");
        assert!(doc.can_undo());

        let undone = doc.undo().unwrap().expect("undo changes the document");
        assert!(undone.is_local());
        assert_eq!(doc.plain_text(), "");

        doc.redo().unwrap();
        assert_eq!(doc.plain_text(), "Hello");
    }

    #[test]
    fn test_undo_leaves_remote_edits() {
        let mut a = store(1);
        let mut b = store(2);
        let remote = insert(&mut b, 0, "theirs");
        a.apply_remote_delta(&remote).unwrap();
        insert(&mut a, 6, " mine");

        a.undo().unwrap();

        assert_eq!(a.plain_text(), "theirs");
    }
}
