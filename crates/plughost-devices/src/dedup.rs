//! Collapses duplicate detections of one physical change.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::event::EventKind;

/// Default window inside which a repeated `(subject, kind)` is suppressed.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(2);

/// Suppresses a repeat of the same kind for the same subject inside a window.
///
/// The callback and poll paths can both observe one attach. The first
/// observation is admitted and the second is dropped. A different kind for
/// the same subject (attach followed by detach) always passes.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    last: HashMap<(String, EventKind), Instant>,
}

impl Deduplicator {
    /// Create a deduplicator with the given window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    /// Whether an observation of `kind` for `subject` at `now` is new.
    pub fn admit(&mut self, subject: &str, kind: EventKind, now: Instant) -> bool {
        let window = self.window;
        self.last
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);

        let key = (subject.to_string(), kind);
        if self.last.contains_key(&key) {
            return false;
        }
        // A new kind for this subject supersedes the opposite one.
        self.last.retain(|(s, _), _| s != subject);
        self.last.insert(key, now);
        true
    }

    /// Number of subjects currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.last.len()
    }

    /// Whether nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_inside_window_is_dropped() {
        let mut dedup = Deduplicator::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(dedup.admit("usb:1", EventKind::Attach, t0));
        assert!(!dedup.admit("usb:1", EventKind::Attach, t0 + Duration::from_millis(500)));
        assert!(dedup.admit("usb:2", EventKind::Attach, t0));
    }

    #[test]
    fn repeat_after_window_passes() {
        let mut dedup = Deduplicator::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(dedup.admit("usb:1", EventKind::Attach, t0));
        assert!(dedup.admit("usb:1", EventKind::Attach, t0 + Duration::from_secs(3)));
    }

    #[test]
    fn different_kind_always_passes() {
        let mut dedup = Deduplicator::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(dedup.admit("usb:1", EventKind::Attach, t0));
        assert!(dedup.admit("usb:1", EventKind::Detach, t0));
        // Re-attach right after the detach is a real change.
        assert!(dedup.admit("usb:1", EventKind::Attach, t0));
    }

    #[test]
    fn stale_entries_are_pruned() {
        let mut dedup = Deduplicator::new(Duration::from_millis(10));
        let t0 = Instant::now();
        dedup.admit("a", EventKind::Attach, t0);
        dedup.admit("b", EventKind::Attach, t0);
        assert_eq!(dedup.len(), 2);
        dedup.admit("c", EventKind::Attach, t0 + Duration::from_secs(1));
        assert_eq!(dedup.len(), 1);
    }
}
