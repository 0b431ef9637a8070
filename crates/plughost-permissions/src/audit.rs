//! Bounded in-memory record of denied checks.

use std::collections::VecDeque;
use std::sync::Mutex;

use plughost_core::{Capability, InstanceId, Timestamp};
use serde::Serialize;

/// One denied capability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialRecord {
    /// Offending instance.
    pub instance: InstanceId,
    /// Requested capability.
    pub capability: Capability,
    /// Requested target.
    pub target: String,
    /// When the check ran.
    pub timestamp: Timestamp,
}

/// Ring buffer keeping the most recent denials; the oldest entry is dropped
/// once `capacity` is reached.
#[derive(Debug)]
pub struct AuditRing {
    capacity: usize,
    entries: Mutex<VecDeque<DenialRecord>>,
}

impl AuditRing {
    /// Create a ring holding at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.clamp(1, 4096))),
        }
    }

    /// Append a record.
    pub fn push(&self, record: DenialRecord) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| {
            tracing::warn!("AuditRing lock poisoned, recovering");
            e.into_inner()
        });
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// Snapshot of the records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DenialRecord> {
        let entries = self.entries.lock().unwrap_or_else(|e| {
            tracing::warn!("AuditRing lock poisoned, recovering");
            e.into_inner()
        });
        entries.iter().cloned().collect()
    }

    /// Records for one instance.
    #[must_use]
    pub fn for_instance(&self, instance: &InstanceId) -> Vec<DenialRecord> {
        self.snapshot()
            .into_iter()
            .filter(|r| &r.instance == instance)
            .collect()
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map_or_else(|e| e.into_inner().len(), |e| e.len())
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
