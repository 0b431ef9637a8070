//! Turning events, submissions and queue messages into plugin jobs.
//!
//! ```text
//! EventPump ─► route_event ─┐
//! submit ───────────────────┼─► JobStore.insert (idempotent) ─► per-plugin FIFO
//! publish ──────────────────┘                                        │
//!                                                                    ▼
//!                    admit against DispatchTable.current(name) ─► invoke
//!                                                                    │
//!                       Succeeded ◄── ok ──┴── err ──► retry with backoff
//!                                                          └─► DeadLettered
//! ```

mod job;
mod pump;
mod store;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use plughost_core::{Capability, HookKind, InstanceId, JobId, PluginName, RetryConfig, Timestamp};
use plughost_devices::{DeviceEvent, EventKind};
use plughost_events::{DeadLetterNotice, Diagnostic, DiagnosticKind, JobFinished, RuntimeBus};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::JobPermit;
use crate::table::DispatchTable;

pub use job::{EventRef, Job, JobRequest, JobState};
pub use pump::EventPump;
pub use store::{DEFAULT_ARCHIVE_LIMIT, FileJobStore, JobStore, MemoryJobStore};

/// How often a worker re-reads the table while the routed instance is
/// refusing admission.
const ADMISSION_POLL: Duration = Duration::from_millis(100);

/// Retry and timeout policy for jobs.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Attempts and backoff.
    pub retry: RetryConfig,
    /// Handler timeout per attempt.
    pub job_timeout: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            job_timeout: Duration::from_secs(30),
        }
    }
}

/// Job type label for an event kind.
#[must_use]
pub fn event_job_type(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Attach => "device.attach",
        EventKind::Detach => "device.detach",
        EventKind::FileChanged => "file.changed",
    }
}

struct Shared {
    table: Arc<DispatchTable>,
    store: Arc<dyn JobStore>,
    bus: RuntimeBus,
    settings: DispatcherSettings,
    queues: DashMap<PluginName, mpsc::UnboundedSender<JobId>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Routes work to plugins and runs it with retries.
///
/// Each plugin has one FIFO queue and one worker. The worker admits jobs in
/// order against whichever instance is routed at that moment, so a job
/// queued during a hot reload runs on the new version. Admission is bounded
/// by the instance's handler concurrency.
#[derive(Clone)]
pub struct JobDispatcher {
    shared: Arc<Shared>,
}

impl JobDispatcher {
    /// Create a dispatcher over `table`, persisting to `store`.
    #[must_use]
    pub fn new(
        table: Arc<DispatchTable>,
        store: Arc<dyn JobStore>,
        bus: RuntimeBus,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                table,
                store,
                bus,
                settings,
                queues: DashMap::new(),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// The job store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.shared.store
    }

    /// Create jobs for every routed plugin that handles `event`.
    ///
    /// Attach and detach go to plugins declaring the matching hook whose
    /// device grant covers the event's vendor and product. File changes go
    /// to plugins declaring `onFileChanged` that may read the path. Job ids
    /// are derived from `(stream, event id, plugin)`, so routing the same
    /// event twice creates nothing new. Returns the ids created.
    ///
    /// # Errors
    ///
    /// Returns a store error; jobs created before it are kept.
    pub async fn route_event(&self, stream: &str, event: &DeviceEvent) -> RuntimeResult<Vec<JobId>> {
        let hook = event.kind.hook();
        let payload = serde_json::to_value(event)
            .map_err(|e| RuntimeError::Store(format!("failed to encode event {}: {e}", event.id)))?;
        let mut created = Vec::new();
        for instance in self.shared.table.routed() {
            let manifest = instance.manifest();
            if !manifest.hooks.declares(hook) {
                continue;
            }
            let grants = instance.grants();
            let wanted = match event.kind {
                EventKind::Attach | EventKind::Detach => grants.covers_device(
                    event.attributes.vendor_id,
                    event.attributes.product_id,
                ),
                EventKind::FileChanged => event
                    .attributes
                    .path
                    .as_deref()
                    .is_some_and(|p| grants.allows(Capability::FsRead, p)),
            };
            if !wanted {
                continue;
            }
            let job = Job::new(
                JobId::for_event(stream, event.id, &manifest.name),
                event_job_type(event.kind),
                manifest.name.clone(),
                hook,
                payload.clone(),
            )
            .with_source(stream, event.id);
            if self.enqueue_new(job).await? {
                debug!(
                    plugin = %manifest.name,
                    event_id = event.id,
                    subject_id = %event.subject_id,
                    "event routed"
                );
                created.push(JobId::for_event(stream, event.id, &manifest.name));
            }
        }
        Ok(created)
    }

    /// Queue an external job for `request.target`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotFound`] if the target is not routed or
    /// does not declare `onJobReceived`, and store errors otherwise.
    pub async fn submit(&self, request: JobRequest) -> RuntimeResult<JobId> {
        let instance = self
            .shared
            .table
            .current(&request.target)
            .ok_or_else(|| RuntimeError::NotFound(format!("{} is not loaded", request.target)))?;
        if !instance.manifest().hooks.declares(HookKind::OnJobReceived) {
            return Err(RuntimeError::NotFound(format!(
                "{} has no onJobReceived handler",
                request.target
            )));
        }
        let job = Job::new(
            JobId::new(),
            request.job_type,
            request.target,
            HookKind::OnJobReceived,
            request.payload,
        );
        let id = job.id;
        self.enqueue_new(job).await?;
        Ok(id)
    }

    /// Deliver a queue message as jobs to every routed plugin that may
    /// subscribe to `topic` and declares `onJobReceived`. The publishing
    /// plugin never receives its own message.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn publish(
        &self,
        topic: &str,
        message: Value,
        from: Option<&InstanceId>,
    ) -> RuntimeResult<Vec<JobId>> {
        let payload = json!({
            "topic": topic,
            "message": message,
            "from": from.map(ToString::to_string),
        });
        let mut created = Vec::new();
        for instance in self.shared.table.routed() {
            let manifest = instance.manifest();
            if from.is_some_and(|f| f.name() == &manifest.name)
                || !manifest.hooks.declares(HookKind::OnJobReceived)
                || !instance.grants().allows(Capability::QueueSubscribe, topic)
            {
                continue;
            }
            let job = Job::new(
                JobId::new(),
                format!("queue.{topic}"),
                manifest.name.clone(),
                HookKind::OnJobReceived,
                payload.clone(),
            );
            let id = job.id;
            self.enqueue_new(job).await?;
            created.push(id);
        }
        debug!(topic, subscribers = created.len(), "queue message published");
        Ok(created)
    }

    /// Re-queue every job the store still holds as active, oldest first.
    /// Returns how many were queued.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn recover(&self) -> RuntimeResult<usize> {
        let jobs = self.shared.store.active().await?;
        for job in &jobs {
            enqueue(&self.shared, &job.target_plugin_id, job.id);
        }
        if !jobs.is_empty() {
            info!(count = jobs.len(), "recovered unfinished jobs");
        }
        Ok(jobs.len())
    }

    /// Give a dead-lettered job a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotFound`] if `id` is not dead-lettered.
    pub async fn requeue_dead_letter(&self, id: JobId) -> RuntimeResult<()> {
        let mut job = self
            .shared
            .store
            .get(id)
            .await?
            .filter(|j| j.state == JobState::DeadLettered)
            .ok_or_else(|| RuntimeError::NotFound(format!("dead-lettered job {id}")))?;
        job.attempts = 0;
        job.next_retry_at = None;
        job.set_state(JobState::Pending);
        self.shared.store.restore(&job).await?;
        info!(job_id = %id, plugin = %job.target_plugin_id, "dead letter requeued");
        enqueue(&self.shared, &job.target_plugin_id, id);
        Ok(())
    }

    /// Look a job up.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn job(&self, id: JobId) -> RuntimeResult<Option<Job>> {
        self.shared.store.get(id).await
    }

    /// Dead-lettered jobs, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn dead_letters(&self) -> RuntimeResult<Vec<Job>> {
        self.shared.store.dead_letters().await
    }

    /// Stop the workers and wait for running attempts to finish. Queued jobs
    /// stay in the store for [`Self::recover`].
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.queues.clear();
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
    }

    async fn enqueue_new(&self, job: Job) -> RuntimeResult<bool> {
        if !self.shared.store.insert(&job).await? {
            debug!(job_id = %job.id, "job already exists, skipping");
            return Ok(false);
        }
        enqueue(&self.shared, &job.target_plugin_id, job.id);
        Ok(true)
    }
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("queues", &self.shared.queues.len())
            .field("settings", &self.shared.settings)
            .finish_non_exhaustive()
    }
}

fn enqueue(shared: &Arc<Shared>, target: &PluginName, id: JobId) {
    if shared.shutdown.is_cancelled() {
        return;
    }
    let sender = shared
        .queues
        .entry(target.clone())
        .or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            shared
                .tasks
                .spawn(worker(Arc::clone(shared), target.clone(), rx));
            tx
        })
        .clone();
    if sender.send(id).is_err() {
        debug!(job_id = %id, plugin = %target, "worker gone, job left in store");
    }
}

/// Re-queue `id` after `delay`.
fn schedule(shared: &Arc<Shared>, target: PluginName, id: JobId, delay: Duration) {
    let inner = Arc::clone(shared);
    shared.tasks.spawn(async move {
        tokio::select! {
            () = inner.shutdown.cancelled() => {},
            () = tokio::time::sleep(delay) => enqueue(&inner, &target, id),
        }
    });
}

async fn worker(shared: Arc<Shared>, target: PluginName, mut rx: mpsc::UnboundedReceiver<JobId>) {
    debug!(plugin = %target, "job worker started");
    loop {
        let id = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            id = rx.recv() => match id {
                Some(id) => id,
                None => break,
            },
        };
        let job = match shared.store.get(id).await {
            Ok(Some(job)) if !job.state.is_terminal() => job,
            Ok(_) => continue,
            Err(e) => {
                warn!(job_id = %id, error = %e, "failed to load job");
                continue;
            },
        };
        if let Some(wait) = remaining(job.next_retry_at) {
            schedule(&shared, target.clone(), id, wait);
            continue;
        }

        match admit(&shared, &target).await {
            Ok(permit) => {
                let inner = Arc::clone(&shared);
                shared.tasks.spawn(execute(inner, job, permit));
            },
            Err(_) if shared.shutdown.is_cancelled() => break,
            Err(e) => {
                let mut job = job;
                job.attempts = job.attempts.saturating_add(1);
                fail(&shared, job, e.to_string()).await;
            },
        }
    }
    debug!(plugin = %target, "job worker stopped");
}

fn remaining(at: Option<Timestamp>) -> Option<Duration> {
    let at = at?;
    at.0.signed_duration_since(Timestamp::now().0)
        .to_std()
        .ok()
        .filter(|d| !d.is_zero())
}

/// Admit one job to the instance routed for `target`, following the table
/// through swaps.
async fn admit(shared: &Shared, target: &PluginName) -> RuntimeResult<JobPermit> {
    let mut changed = shared.table.changed();
    loop {
        let instance = shared
            .table
            .current(target)
            .ok_or_else(|| RuntimeError::NotFound(format!("{target} is not loaded")))?;
        match instance.acquire().await {
            Ok(permit) => return Ok(permit),
            Err(RuntimeError::NotAdmitting) => {
                // Being replaced or retired; wait for the table to move on.
                tokio::select! {
                    () = shared.shutdown.cancelled() => return Err(RuntimeError::NotAdmitting),
                    _ = changed.changed() => {},
                    () = tokio::time::sleep(ADMISSION_POLL) => {},
                }
            },
            Err(e) => return Err(e),
        }
    }
}

async fn execute(shared: Arc<Shared>, mut job: Job, permit: JobPermit) {
    let instance = Arc::clone(permit.instance());
    job.attempts = job.attempts.saturating_add(1);
    job.instance = Some(instance.id().clone());
    job.next_retry_at = None;
    job.set_state(JobState::Running);
    if let Err(e) = shared.store.update(&job).await {
        warn!(job_id = %job.id, error = %e, "failed to persist running job");
    }
    debug!(job_id = %job.id, instance = %instance.id(), attempt = job.attempts, "job admitted");

    let outcome = instance
        .invoke(job.hook, job.envelope(), shared.settings.job_timeout)
        .await;
    drop(permit);

    match outcome {
        Ok(value) => succeed(&shared, job, value, instance.id().clone()).await,
        Err(e) => fail(&shared, job, e.to_string()).await,
    }
}

async fn succeed(shared: &Shared, mut job: Job, value: Value, instance: InstanceId) {
    job.result = Some(value.clone());
    job.last_error = None;
    job.set_state(JobState::Succeeded);
    if let Err(e) = shared.store.archive(&job).await {
        warn!(job_id = %job.id, error = %e, "failed to archive finished job");
    }
    info!(job_id = %job.id, instance = %instance, attempts = job.attempts, "job succeeded");
    shared.bus.jobs.publish(JobFinished {
        job_id: job.id,
        job_type: job.job_type,
        instance,
        result: value,
        attempts: job.attempts,
        timestamp: Timestamp::now(),
    });
}

async fn fail(shared: &Arc<Shared>, mut job: Job, error: String) {
    let retry = &shared.settings.retry;
    job.last_error = Some(error.clone());
    if retry.should_retry(job.attempts) {
        let delay = retry.delay_with_jitter(job.attempts, rand::random::<f64>());
        job.next_retry_at = Some(Timestamp::now().after(delay));
        job.set_state(JobState::Failed);
        warn!(
            job_id = %job.id,
            plugin = %job.target_plugin_id,
            attempt = job.attempts,
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            %error,
            "job attempt failed"
        );
        if let Err(e) = shared.store.update(&job).await {
            warn!(job_id = %job.id, error = %e, "failed to persist failed job");
        }
        schedule(shared, job.target_plugin_id.clone(), job.id, delay);
        return;
    }

    job.next_retry_at = None;
    job.set_state(JobState::DeadLettered);
    if let Err(e) = shared.store.archive(&job).await {
        warn!(job_id = %job.id, error = %e, "failed to archive dead letter");
    }
    shared.bus.diagnose(Diagnostic::new(
        DiagnosticKind::DeadLettered,
        job.target_plugin_id.as_str(),
        job.instance.clone(),
        format!(
            "job {} ({}) dead-lettered after {} attempts: {error}",
            job.id, job.job_type, job.attempts
        ),
    ));
    shared.bus.dead_letters.publish(DeadLetterNotice {
        job_id: job.id,
        job_type: job.job_type,
        target_plugin_id: job.target_plugin_id,
        attempts: job.attempts,
        last_error: error,
        timestamp: Timestamp::now(),
    });
}
