//! Debouncer: coalesce bursts of calls into one trailing action.
//!
//! Each debounced operation owns one of these instead of a timer closure.
//! `schedule` replaces the pending payload and pushes the due time out by
//! the quiet period; `poll` hands the payload back once that time passes.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Debouncer<T> {
    quiet_ms: u64,
    pending: Option<T>,
    due_at: Option<u64>,
}

impl<T> Debouncer<T> {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet_ms: quiet.as_millis() as u64,
            pending: None,
            due_at: None,
        }
    }

    /// Replace the pending payload and restart the quiet period.
    pub fn schedule(&mut self, payload: T, now_ms: u64) {
        self.pending = Some(payload);
        self.due_at = Some(now_ms + self.quiet_ms);
    }

    /// Take the payload if the quiet period has elapsed.
    pub fn poll(&mut self, now_ms: u64) -> Option<T> {
        match self.due_at {
            Some(due) if now_ms >= due => {
                self.due_at = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    /// Take the payload regardless of time.
    pub fn flush(&mut self) -> Option<T> {
        self.due_at = None;
        self.pending.take()
    }

    pub fn cancel(&mut self) {
        self.due_at = None;
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.due_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debouncer() -> Debouncer<&'static str> {
        Debouncer::new(Duration::from_millis(1000))
    }

    #[test]
    fn test_fires_after_quiet_period() {
        let mut d = debouncer();
        d.schedule("a", 0);
        assert_eq!(d.poll(999), None);
        assert_eq!(d.poll(1000), Some("a"));
        assert_eq!(d.poll(2000), None);
    }

    #[test]
    fn test_burst_coalesces_to_latest() {
        let mut d = debouncer();
        d.schedule("a", 0);
        d.schedule("b", 400);
        d.schedule("c", 800);

        assert_eq!(d.poll(1000), None);
        assert_eq!(d.next_deadline(), Some(1800));
        assert_eq!(d.poll(1800), Some("c"));
    }

    #[test]
    fn test_flush_and_cancel() {
        let mut d = debouncer();
        d.schedule("a", 0);
        assert_eq!(d.flush(), Some("a"));
        assert!(!d.is_pending());

        d.schedule("b", 0);
        d.cancel();
        assert_eq!(d.poll(5000), None);
        assert_eq!(d.next_deadline(), None);
    }
}
