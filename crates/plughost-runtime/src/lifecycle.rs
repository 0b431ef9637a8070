//! Lifecycle bookkeeping for one instance.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use plughost_core::{InstanceId, InstanceStatus, Timestamp};
use plughost_events::{LifecycleEvent, RuntimeBus};
use tracing::{debug, info};

use crate::error::{RuntimeError, RuntimeResult};

/// Current status of one instance plus the channel its transitions are
/// published on.
///
/// Created when validation starts, before the instance itself exists, and
/// handed to the [`PluginInstance`](crate::PluginInstance) once the context
/// is up.
#[derive(Debug)]
pub struct Lifecycle {
    instance: InstanceId,
    generation: u64,
    status: Mutex<InstanceStatus>,
    bus: RuntimeBus,
    book: StatusBook,
}

impl Lifecycle {
    /// Start tracking `instance` in `Validating`. Every transition is also
    /// written to `book`.
    #[must_use]
    pub fn begin(
        instance: InstanceId,
        generation: u64,
        bus: RuntimeBus,
        book: StatusBook,
    ) -> Self {
        let lifecycle = Self {
            instance,
            generation,
            status: Mutex::new(InstanceStatus::Validating),
            bus,
            book,
        };
        lifecycle.publish(None, InstanceStatus::Validating);
        lifecycle
    }

    /// Tracked instance.
    #[must_use]
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Load generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> InstanceStatus {
        *self.lock()
    }

    /// Move to `to`, publishing the transition.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidTransition`] if the lifecycle does not
    /// allow it; the status is left unchanged.
    pub fn transition(&self, to: InstanceStatus) -> RuntimeResult<InstanceStatus> {
        let from = {
            let mut status = self.lock();
            let from = *status;
            if !from.can_transition_to(to) {
                return Err(RuntimeError::InvalidTransition {
                    instance: self.instance.clone(),
                    from,
                    to,
                });
            }
            *status = to;
            from
        };
        self.publish(Some(from), to);
        Ok(from)
    }

    /// Move to `Failed` if the current status allows it.
    pub fn fail(&self) {
        if let Err(e) = self.transition(InstanceStatus::Failed) {
            debug!(error = %e, "not marking instance failed");
        }
    }

    fn publish(&self, from: Option<InstanceStatus>, to: InstanceStatus) {
        info!(
            instance = %self.instance,
            generation = self.generation,
            from = from.map(InstanceStatus::as_str),
            to = to.as_str(),
            "lifecycle transition"
        );
        self.book.record(&self.instance, self.generation, to);
        self.bus.lifecycle.publish(LifecycleEvent {
            instance: self.instance.clone(),
            generation: self.generation,
            from,
            to,
            timestamp: Timestamp::now(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InstanceStatus> {
        self.status.lock().unwrap_or_else(|e| {
            tracing::warn!("lifecycle lock poisoned, recovering");
            e.into_inner()
        })
    }
}

/// Last status seen per instance id, kept after the context is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    /// Generation the status belongs to.
    pub generation: u64,
    /// Last status reached.
    pub status: InstanceStatus,
    /// When it was reached.
    pub changed_at: Timestamp,
}

/// Last known status of every instance id the loader has tracked,
/// including ones that failed, were unloaded or never got a context.
///
/// One record per id: a newer generation replaces an older one and a late
/// transition of an older generation is ignored.
#[derive(Debug, Clone, Default)]
pub struct StatusBook {
    records: Arc<DashMap<InstanceId, StatusRecord>>,
}

impl StatusBook {
    /// Empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that generation `generation` of `instance` reached `status`.
    pub fn record(&self, instance: &InstanceId, generation: u64, status: InstanceStatus) {
        let record = StatusRecord {
            generation,
            status,
            changed_at: Timestamp::now(),
        };
        self.records
            .entry(instance.clone())
            .and_modify(|current| {
                if generation >= current.generation {
                    *current = record;
                }
            })
            .or_insert(record);
    }

    /// Last record for `instance`.
    #[must_use]
    pub fn get(&self, instance: &InstanceId) -> Option<StatusRecord> {
        self.records.get(instance).map(|r| *r.value())
    }

    /// Every record.
    #[must_use]
    pub fn all(&self) -> Vec<(InstanceId, StatusRecord)> {
        self.records
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Number of ids tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was tracked yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_published_in_order() {
        let bus = RuntimeBus::new();
        let mut events = bus.subscribe_lifecycle();
        let id: InstanceId = "demo@1.0.0".parse().unwrap();
        let lifecycle = Lifecycle::begin(id, 7, bus, StatusBook::new());

        lifecycle.transition(InstanceStatus::Loading).unwrap();
        lifecycle.transition(InstanceStatus::Loaded).unwrap();
        let err = lifecycle.transition(InstanceStatus::Unloaded).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidTransition { .. }));
        assert_eq!(lifecycle.status(), InstanceStatus::Loaded);

        let seen: Vec<_> = events.drain().iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(
            seen,
            vec![
                (None, InstanceStatus::Validating),
                (Some(InstanceStatus::Validating), InstanceStatus::Loading),
                (Some(InstanceStatus::Loading), InstanceStatus::Loaded),
            ]
        );
    }

    #[test]
    fn fail_is_a_no_op_once_terminal() {
        let id: InstanceId = "demo@1.0.0".parse().unwrap();
        let lifecycle = Lifecycle::begin(id, 1, RuntimeBus::new(), StatusBook::new());
        lifecycle.fail();
        lifecycle.fail();
        assert_eq!(lifecycle.status(), InstanceStatus::Failed);
    }

    #[test]
    fn book_outlives_the_lifecycle() {
        let id: InstanceId = "demo@1.0.0".parse().unwrap();
        let book = StatusBook::new();
        {
            let lifecycle = Lifecycle::begin(id.clone(), 3, RuntimeBus::new(), book.clone());
            lifecycle.transition(InstanceStatus::Loading).unwrap();
            lifecycle.fail();
        }
        let record = book.get(&id).unwrap();
        assert_eq!(record.generation, 3);
        assert_eq!(record.status, InstanceStatus::Failed);
    }

    #[test]
    fn older_generations_do_not_overwrite_newer_ones() {
        let id: InstanceId = "demo@1.0.0".parse().unwrap();
        let book = StatusBook::new();
        book.record(&id, 1, InstanceStatus::Active);
        book.record(&id, 2, InstanceStatus::Loaded);
        book.record(&id, 1, InstanceStatus::Unloaded);
        assert_eq!(book.get(&id).unwrap().status, InstanceStatus::Loaded);
        book.record(&id, 2, InstanceStatus::Active);
        assert_eq!(book.get(&id).unwrap().status, InstanceStatus::Active);
        assert_eq!(book.len(), 1);
    }
}
