//! A loaded plugin instance.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use plughost_core::{HookKind, InstanceId, InstanceStatus, Timestamp};
use plughost_core::HandlerOutcome;
use plughost_crypto::ContentHash;
use plughost_manifest::Manifest;
use plughost_permissions::GrantSet;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::sync::Notify;

use crate::error::{RuntimeError, RuntimeResult};
use crate::lifecycle::{Lifecycle, StatusRecord};
use crate::sandbox::{ContextExit, Session};
use crate::staging::StagedPayload;

/// One running version of a plugin.
///
/// Owned by the loader; the dispatch table and in-flight jobs hold shared
/// references. Admission is bounded by a semaphore sized to the manifest's
/// handler concurrency and can be paused, after which no new job is
/// admitted while already admitted jobs run to completion.
#[derive(Debug)]
pub struct PluginInstance {
    lifecycle: Lifecycle,
    manifest: Arc<Manifest>,
    dir: PathBuf,
    payload_digest: ContentHash,
    grants: Arc<GrantSet>,
    session: Session,
    staged: Mutex<Option<StagedPayload>>,
    admission: Arc<Semaphore>,
    admitting: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    loaded_at: Timestamp,
    last_activity: Mutex<Timestamp>,
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    /// `name@version`.
    pub id: InstanceId,
    /// Load generation.
    pub generation: u64,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// When the context was started.
    pub loaded_at: Timestamp,
    /// Last admission or completion.
    pub last_activity_at: Timestamp,
    /// Jobs currently admitted.
    pub in_flight: usize,
    /// Whether new jobs are admitted.
    pub admitting: bool,
    /// Plugin directory.
    pub dir: PathBuf,
    /// Sealed copy the context runs from, until teardown.
    pub staged_dir: Option<PathBuf>,
    /// Digest of the verified code payload.
    pub payload_digest: String,
}

/// What the runtime reports for one instance id, live or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginStatus {
    /// `name@version`.
    pub id: InstanceId,
    /// Generation the status belongs to.
    pub generation: u64,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// When the status was reached.
    pub changed_at: Timestamp,
    /// Why the plugin is disabled, if it is.
    pub disabled_reason: Option<String>,
    /// The running instance, while its context exists.
    pub instance: Option<InstanceSnapshot>,
}

impl PluginStatus {
    /// Status of a running instance.
    #[must_use]
    pub fn live(
        snapshot: InstanceSnapshot,
        record: Option<StatusRecord>,
        disabled_reason: Option<String>,
    ) -> Self {
        let changed_at = record
            .filter(|r| r.generation == snapshot.generation && r.status == snapshot.status)
            .map_or(snapshot.loaded_at, |r| r.changed_at);
        Self {
            id: snapshot.id.clone(),
            generation: snapshot.generation,
            status: snapshot.status,
            changed_at,
            disabled_reason,
            instance: Some(snapshot),
        }
    }

    /// Status of an id with no running instance.
    #[must_use]
    pub fn recorded(id: InstanceId, record: StatusRecord, disabled_reason: Option<String>) -> Self {
        Self {
            id,
            generation: record.generation,
            status: record.status,
            changed_at: record.changed_at,
            disabled_reason,
            instance: None,
        }
    }
}

impl PluginInstance {
    /// Assemble an instance around a started session.
    #[must_use]
    pub fn new(
        lifecycle: Lifecycle,
        manifest: Arc<Manifest>,
        dir: PathBuf,
        payload_digest: ContentHash,
        grants: Arc<GrantSet>,
        session: Session,
        staged: StagedPayload,
    ) -> Self {
        let concurrency = manifest.handler_concurrency();
        let now = Timestamp::now();
        Self {
            lifecycle,
            manifest,
            dir,
            payload_digest,
            grants,
            session,
            staged: Mutex::new(Some(staged)),
            admission: Arc::new(Semaphore::new(concurrency)),
            admitting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            loaded_at: now,
            last_activity: Mutex::new(now),
        }
    }

    /// `name@version`.
    #[must_use]
    pub fn id(&self) -> &InstanceId {
        self.lifecycle.instance()
    }

    /// Load generation; distinguishes reloads of the same version.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.lifecycle.generation()
    }

    /// The validated manifest.
    #[must_use]
    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// Plugin directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory the context runs from, until teardown.
    #[must_use]
    pub fn staged_dir(&self) -> Option<PathBuf> {
        self.staged_slot().as_ref().map(|s| s.dir().to_path_buf())
    }

    /// Remove the staged payload copy.
    pub(crate) fn discard_staged(&self) {
        let staged = self.staged_slot().take();
        drop(staged);
    }

    /// This instance's grants.
    #[must_use]
    pub fn grants(&self) -> &Arc<GrantSet> {
        &self.grants
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> InstanceStatus {
        self.lifecycle.status()
    }

    /// Move to `to`, publishing the transition.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidTransition`] if not allowed.
    pub fn transition(&self, to: InstanceStatus) -> RuntimeResult<InstanceStatus> {
        self.lifecycle.transition(to)
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    /// Becomes `Some` once the execution context has exited.
    #[must_use]
    pub fn exit_signal(&self) -> watch::Receiver<Option<ContextExit>> {
        self.session.exit_signal()
    }

    /// Whether new jobs are admitted.
    #[must_use]
    pub fn is_admitting(&self) -> bool {
        self.admitting.load(Ordering::Acquire)
    }

    /// Jobs currently admitted.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Admit one job, waiting for a free handler slot.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotAdmitting`] once admission is paused,
    /// including while waiting for a slot.
    pub async fn acquire(self: &Arc<Self>) -> RuntimeResult<JobPermit> {
        if !self.is_admitting() {
            return Err(RuntimeError::NotAdmitting);
        }
        let permit = Arc::clone(&self.admission)
            .acquire_owned()
            .await
            .map_err(|_| RuntimeError::NotAdmitting)?;
        // Count the job before the final admission check so a concurrent
        // drain either sees it in flight or this call backs out.
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let permit = JobPermit {
            instance: Arc::clone(self),
            _slot: permit,
        };
        if !self.is_admitting() {
            drop(permit);
            return Err(RuntimeError::NotAdmitting);
        }
        self.touch();
        Ok(permit)
    }

    /// Stop admitting jobs. Waiters in [`Self::acquire`] fail immediately.
    pub fn pause_admission(&self) {
        self.admitting.store(false, Ordering::Release);
        self.admission.close();
    }

    /// Wait until no admitted job remains, up to `timeout`. Returns whether
    /// the instance drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let idle = self.idle.notified();
                tokio::pin!(idle);
                idle.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    /// Invoke the handler bound to `hook`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::HandlerError`] if the hook is not declared or
    /// the handler failed or was cancelled, and the session's timeout and
    /// closed-context errors otherwise.
    pub async fn invoke(
        &self,
        hook: HookKind,
        payload: Value,
        timeout: Duration,
    ) -> RuntimeResult<Value> {
        let handler = self.manifest.hooks.handler(hook).ok_or_else(|| {
            RuntimeError::HandlerError(format!("{} does not declare {hook}", self.id()))
        })?;
        self.touch();
        let outcome = self.session.invoke(hook, handler, payload, timeout).await;
        self.touch();
        match outcome? {
            HandlerOutcome::Ok { value } => Ok(value),
            HandlerOutcome::Error { message } => Err(RuntimeError::HandlerError(message)),
            HandlerOutcome::Cancelled => Err(RuntimeError::HandlerError("cancelled".to_string())),
        }
    }

    /// Point-in-time view.
    #[must_use]
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id().clone(),
            generation: self.generation(),
            status: self.status(),
            loaded_at: self.loaded_at,
            last_activity_at: *self.activity(),
            in_flight: self.in_flight(),
            admitting: self.is_admitting(),
            dir: self.dir.clone(),
            staged_dir: self.staged_dir(),
            payload_digest: self.payload_digest.to_hex(),
        }
    }

    fn touch(&self) {
        *self.activity() = Timestamp::now();
    }

    fn activity(&self) -> std::sync::MutexGuard<'_, Timestamp> {
        self.last_activity.lock().unwrap_or_else(|e| {
            tracing::warn!("activity lock poisoned, recovering");
            e.into_inner()
        })
    }

    fn staged_slot(&self) -> std::sync::MutexGuard<'_, Option<StagedPayload>> {
        self.staged.lock().unwrap_or_else(|e| {
            tracing::warn!("staging lock poisoned, recovering");
            e.into_inner()
        })
    }

    fn release(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        self.touch();
        if previous <= 1 {
            self.idle.notify_waiters();
        }
    }
}

/// An admitted job's hold on an instance handler slot. Dropping it frees
/// the slot.
#[derive(Debug)]
pub struct JobPermit {
    instance: Arc<PluginInstance>,
    _slot: OwnedSemaphorePermit,
}

impl JobPermit {
    /// The instance the job was admitted to.
    #[must_use]
    pub fn instance(&self) -> &Arc<PluginInstance> {
        &self.instance
    }
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.instance.release();
    }
}
