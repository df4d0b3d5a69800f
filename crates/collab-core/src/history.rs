//! Change history: a bounded, attributed log of edits.
//!
//! The recorder works on the rendered form of the document (`<p>` blocks).
//! Each time the rendered content changes it compares the blocks, index by
//! index, with the content of the newest entry and records the ones that
//! differ as plain text. Blocks removed from the end are not reported; only
//! positions present in the new content are compared.

use crate::awareness::PresenceUser;
use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::LazyLock;

pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Stored in place of a block whose text is empty.
pub const EMPTY_LINE_MARKER: &str = "[Empty Line]";

const BLOCK_END: &str = "</p>";

static MARKUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[^>]+(>|$)").expect("markup pattern is valid"));

/// One recorded edit. Field names follow the persisted JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Locale-formatted wall clock time.
    pub timestamp: String,
    #[serde(rename = "userName")]
    pub author_name: String,
    #[serde(rename = "userColor")]
    pub author_color: String,
    #[serde(rename = "changedLines")]
    pub changed_lines: Vec<String>,
    /// Verbatim rendered content, used for the next comparison.
    #[serde(rename = "content")]
    pub full_snapshot: String,
}

/// FIFO ring of the most recent entries, oldest first.
#[derive(Debug, Clone)]
pub struct ChangeHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl Default for ChangeHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ChangeHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Resume from persisted entries, keeping the newest `capacity`.
    pub fn from_entries(entries: Vec<HistoryEntry>, capacity: usize) -> Self {
        let mut history = Self::new(capacity);
        let skip = entries.len().saturating_sub(history.capacity);
        history.entries.extend(entries.into_iter().skip(skip));
        history
    }

    /// Record `rendered` if any of its blocks differ from the last entry.
    ///
    /// Returns the appended entry.
    pub fn record_if_changed(
        &mut self,
        rendered: &str,
        author: &PresenceUser,
        now_ms: u64,
    ) -> Option<&HistoryEntry> {
        let previous: Vec<&str> = self
            .entries
            .back()
            .map(|e| split_blocks(&e.full_snapshot))
            .unwrap_or_default();

        let changed: Vec<String> = split_blocks(rendered)
            .iter()
            .enumerate()
            .filter(|(i, block)| previous.get(*i) != Some(*block))
            .map(|(_, block)| readable(block))
            .collect();

        if changed.is_empty() {
            return None;
        }

        let entry = HistoryEntry {
            timestamp: locale_time(now_ms),
            author_name: author.name.clone(),
            author_color: author.color.clone(),
            changed_lines: changed,
            full_snapshot: rendered.to_string(),
        };
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.entries.back()
    }

    /// Entries, most recent last.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn split_blocks(content: &str) -> Vec<&str> {
    content.split(BLOCK_END).filter(|b| !b.is_empty()).collect()
}

/// Block markup stripped down to its text.
fn readable(block: &str) -> String {
    let text = MARKUP.replace_all(block, "");
    let text = decode_entities(&text);
    if text.is_empty() {
        EMPTY_LINE_MARKER.to_string()
    } else {
        text
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn locale_time(now_ms: u64) -> String {
    let utc = DateTime::<Utc>::from_timestamp_millis(now_ms as i64).unwrap_or_default();
    utc.with_timezone(&Local).format("%-I:%M:%S %p").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ada() -> PresenceUser {
        PresenceUser::new("Ada", "#ff0000")
    }

    fn record(history: &mut ChangeHistory, rendered: &str) -> Option<HistoryEntry> {
        history.record_if_changed(rendered, &ada(), 0).cloned()
    }

    #[test]
    fn test_first_record_lists_every_block() {
        let mut history = ChangeHistory::default();
        let entry = record(&mut history, "<p>Hello</p><p><strong>World</strong></p>").unwrap();

        assert_eq!(entry.changed_lines, vec!["Hello", "World"]);
        assert_eq!(entry.author_name, "Ada");
        assert_eq!(entry.author_color, "#ff0000");
        assert!(!entry.timestamp.is_empty());
    }

    #[test]
    fn test_identical_content_records_nothing() {
        let mut history = ChangeHistory::default();
        record(&mut history, "<p>Same</p>");
        assert!(record(&mut history, "<p>Same</p>").is_none());
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_only_changed_positions_reported() {
        let mut history = ChangeHistory::default();
        record(&mut history, "<p>one</p><p>two</p><p>three</p>");
        let entry = record(&mut history, "<p>one</p><p>2</p><p>three</p><p>four</p>").unwrap();

        assert_eq!(entry.changed_lines, vec!["2", "four"]);
    }

    #[test]
    fn test_removed_trailing_block_not_reported() {
        let mut history = ChangeHistory::default();
        record(&mut history, "<p>one</p><p>two</p>");
        assert!(record(&mut history, "<p>one</p>").is_none());
    }

    #[test]
    fn test_cleared_block_recorded_as_placeholder() {
        let mut history = ChangeHistory::default();
        record(&mut history, "<p>text</p>");
        let entry = record(&mut history, "<p></p>").unwrap();
        assert_eq!(entry.changed_lines, vec![EMPTY_LINE_MARKER]);
    }

    #[test]
    fn test_entities_decoded() {
        let mut history = ChangeHistory::default();
        let entry = record(&mut history, "<p>a &lt;b&gt; &amp; c</p>").unwrap();
        assert_eq!(entry.changed_lines, vec!["a <b> & c"]);
    }

    #[test]
    fn test_surrounding_spaces_kept() {
        let mut history = ChangeHistory::default();
        record(&mut history, "<p>indent</p>");
        let entry = record(&mut history, "<p>  indent </p>").unwrap();
        assert_eq!(entry.changed_lines, vec!["  indent "]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut history = ChangeHistory::default();
        for i in 0..11 {
            record(&mut history, &format!("<p>rev {i}</p>"));
        }

        assert_eq!(history.len(), 10);
        let entries = history.entries();
        assert_eq!(entries[0].full_snapshot, "<p>rev 1</p>");
        assert_eq!(entries[9].full_snapshot, "<p>rev 10</p>");
    }

    #[test]
    fn test_from_entries_keeps_newest() {
        let mut source = ChangeHistory::new(20);
        for i in 0..15 {
            record(&mut source, &format!("<p>{i}</p>"));
        }
        let history = ChangeHistory::from_entries(source.entries(), 10);

        assert_eq!(history.len(), 10);
        assert_eq!(history.entries()[0].full_snapshot, "<p>5</p>");
    }

    #[test]
    fn test_diff_continues_from_restored_history() {
        let mut first = ChangeHistory::default();
        record(&mut first, "<p>kept</p>");
        let mut resumed = ChangeHistory::from_entries(first.entries(), 10);

        assert!(record(&mut resumed, "<p>kept</p>").is_none());
    }

    #[test]
    fn test_persisted_field_names() {
        let entry = HistoryEntry {
            timestamp: "3:04:05 PM".into(),
            author_name: "Ada".into(),
            author_color: "#ff0000".into(),
            changed_lines: vec!["Hi".into()],
            full_snapshot: "<p>Hi</p>".into(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "timestamp": "3:04:05 PM",
                "userName": "Ada",
                "userColor": "#ff0000",
                "changedLines": ["Hi"],
                "content": "<p>Hi</p>"
            })
        );
    }
}
