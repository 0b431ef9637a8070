//! Violation threshold policy.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How many denials an instance may accumulate inside a sliding window
/// before it is flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationPolicy {
    /// Denials in the window that flag the instance; `0` disables flagging.
    pub threshold: u32,
    /// Window length.
    pub window: Duration,
}

impl ViolationPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(threshold: u32, window: Duration) -> Self {
        Self { threshold, window }
    }

    /// Never flag.
    #[must_use]
    pub const fn disabled() -> Self {
        Self::new(0, Duration::from_secs(60))
    }

    /// Whether `count` denials in the window reach the threshold.
    #[must_use]
    pub fn exceeded(&self, count: u32) -> bool {
        self.threshold > 0 && count >= self.threshold
    }
}

impl Default for ViolationPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

/// Denial timestamps of one instance.
#[derive(Debug, Default)]
pub(crate) struct ViolationWindow {
    hits: VecDeque<Instant>,
}

impl ViolationWindow {
    /// Record a denial at `now` and return the count inside `window`.
    pub(crate) fn record(&mut self, now: Instant, window: Duration) -> u32 {
        while let Some(oldest) = self.hits.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        self.hits.push_back(now);
        u32::try_from(self.hits.len()).unwrap_or(u32::MAX)
    }
}
