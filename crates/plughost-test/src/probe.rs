//! Side-effect recording shared between guests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// One completed handler run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeEntry {
    /// Label of the guest that ran it, e.g. the instance version.
    pub label: String,
    /// Handler name.
    pub handler: String,
    /// Payload the handler saw.
    pub payload: Value,
}

/// Records what guests did and how many ran at once.
///
/// Cloning shares the same record.
#[derive(Debug, Clone, Default)]
pub struct SideEffectProbe {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<Vec<ProbeEntry>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl SideEffectProbe {
    /// Create an empty probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a handler as running until the guard drops.
    #[must_use]
    pub fn enter(&self) -> ActiveGuard {
        let now = self
            .inner
            .active
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        self.inner.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard {
            probe: self.clone(),
        }
    }

    /// Record a completed run.
    pub fn record(&self, label: &str, handler: &str, payload: Value) {
        self.lock().push(ProbeEntry {
            label: label.to_string(),
            handler: handler.to_string(),
            payload,
        });
    }

    /// Everything recorded, in completion order.
    #[must_use]
    pub fn entries(&self) -> Vec<ProbeEntry> {
        self.lock().clone()
    }

    /// Runs recorded for `handler`.
    #[must_use]
    pub fn count(&self, handler: &str) -> usize {
        self.lock().iter().filter(|e| e.handler == handler).count()
    }

    /// Most handlers ever running at the same time.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    /// Handlers running right now.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ProbeEntry>> {
        self.inner.entries.lock().unwrap_or_else(|e| {
            tracing::warn!("probe lock poisoned, recovering");
            e.into_inner()
        })
    }
}

/// Returned by [`SideEffectProbe::enter`].
#[derive(Debug)]
pub struct ActiveGuard {
    probe: SideEffectProbe,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.probe.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}
