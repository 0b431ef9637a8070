//! The runtime facade.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use plughost_config::{Config, JobStoreKind};
use plughost_core::{InstanceId, JobId, PluginName, RetryConfig};
use plughost_crypto::SignerRegistry;
use plughost_devices::{
    DevfsWatcher, DeviceDirectory, DeviceEnumerator, DeviceMonitor, EventLog, FileChangeSource,
    FileEventLog, SysfsEnumerator,
};
use plughost_events::{
    DeadLetterNotice, Diagnostic, DiagnosticKind, JobFinished, LifecycleEvent,
    PermissionViolation, ReloadRecord, RuntimeBus, Subscription,
};
use plughost_manifest::{ManifestValidator, SchemaLimits};
use plughost_permissions::{PermissionEnforcer, ViolationPolicy};
use plughost_sdk::Guest;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bridge::{DefaultHostServices, HostServices, QueueMessage};
use crate::discovery::discover_plugin_dirs;
use crate::dispatcher::{
    DispatcherSettings, EventPump, FileJobStore, Job, JobDispatcher, JobRequest, JobStore,
    MemoryJobStore,
};
use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::{PluginInstance, PluginStatus};
use crate::loader::{LoaderSettings, PluginLoader};
use crate::reload::HotReloadCoordinator;
use crate::sandbox::{BackendSet, ProcessBackend, ThreadBackend};
use crate::staging::StagingArea;
use crate::supervisor::{RestartPolicy, Supervisor};
use crate::table::DispatchTable;
use crate::watcher::{PluginWatcher, WatchEvent, WatcherConfig};

/// Cursor name the event pump commits under.
const DISPATCH_CONSUMER: &str = "dispatcher";

/// Assembles a [`PluginRuntime`].
pub struct PluginRuntimeBuilder {
    config: Config,
    signers: Option<SignerRegistry>,
    event_log: Option<Arc<dyn EventLog>>,
    job_store: Option<Arc<dyn JobStore>>,
    threads: Arc<ThreadBackend>,
    host_services: Option<Arc<dyn HostServices>>,
    devices: DeviceDirectory,
}

impl Default for PluginRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            signers: None,
            event_log: None,
            job_store: None,
            threads: Arc::new(ThreadBackend::new()),
            host_services: None,
            devices: DeviceDirectory::new(),
        }
    }
}

impl PluginRuntimeBuilder {
    /// Start from the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config`.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Trust these signers instead of reading the trust directory.
    #[must_use]
    pub fn signers(mut self, signers: SignerRegistry) -> Self {
        self.signers = Some(signers);
        self
    }

    /// Use this event log instead of the one under the state directory.
    #[must_use]
    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    /// Use this job store instead of the configured one.
    #[must_use]
    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    /// Serve plugin `name` from `guest` on the thread backend.
    #[must_use]
    pub fn thread_guest(self, name: PluginName, guest: Arc<dyn Guest>) -> Self {
        self.threads.register_guest(name, guest);
        self
    }

    /// Replace the host services guests reach through the bridge.
    #[must_use]
    pub fn host_services(mut self, services: Arc<dyn HostServices>) -> Self {
        self.host_services = Some(services);
        self
    }

    /// Share this device directory with the device monitor.
    #[must_use]
    pub fn devices(mut self, devices: DeviceDirectory) -> Self {
        self.devices = devices;
        self
    }

    /// Build the runtime and start its internal tasks. Must be called
    /// inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the trust directory, event log or job store
    /// cannot be opened.
    pub fn build(self) -> RuntimeResult<Arc<PluginRuntime>> {
        let config = self.config;
        let bus = RuntimeBus::new();

        let signers = match self.signers {
            Some(s) => s,
            None => SignerRegistry::load_dir(&config.runtime.trust_dir)
                .map_err(|e| RuntimeError::Startup(format!("trust directory: {e}")))?,
        };
        let event_log: Arc<dyn EventLog> = match self.event_log {
            Some(log) => log,
            None => Arc::new(FileEventLog::open(config.runtime.state_dir.join("events"))?),
        };
        let store: Arc<dyn JobStore> = match (self.job_store, config.dispatcher.store) {
            (Some(store), _) => store,
            (None, JobStoreKind::File) => {
                Arc::new(FileJobStore::open(config.runtime.state_dir.join("jobs"))?)
            },
            (None, JobStoreKind::Memory) => Arc::new(MemoryJobStore::new()),
        };

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (activations_tx, activations_rx) = mpsc::unbounded_channel();

        let services = self.host_services.unwrap_or_else(|| {
            Arc::new(DefaultHostServices::new(self.devices.clone(), queue_tx.clone()))
        });
        let enforcer = Arc::new(PermissionEnforcer::new(
            ViolationPolicy::new(
                config.permissions.violation_threshold,
                Duration::from_secs(config.permissions.violation_window_secs),
            ),
            bus.violations.clone(),
            config.permissions.audit_capacity,
        ));
        let validator = ManifestValidator::new(
            Arc::new(signers),
            SchemaLimits {
                allowed_extensions: config.sandbox.allowed_extensions.clone(),
                max_heap_mb: config.sandbox.max_heap_mb_ceiling,
                require_signature: true,
            },
        );
        let backends = BackendSet::new().with(self.threads.clone()).with(Arc::new(
            ProcessBackend::new(config.sandbox.interpreters.clone())
                .with_sample_interval(Duration::from_millis(config.sandbox.sample_interval_ms)),
        ));

        let loader = Arc::new(PluginLoader::new(
            validator,
            backends,
            enforcer,
            services,
            kill_tx,
            bus.clone(),
            LoaderSettings {
                load_timeout: config.sandbox.load_timeout(),
                unload_timeout: config.sandbox.unload_timeout(),
                kill_grace: Duration::from_millis(config.sandbox.kill_grace_ms),
            },
        )
        .with_staging(StagingArea::new(config.runtime.state_dir.join("staging"))));
        let table = Arc::new(DispatchTable::new());
        let coordinator = Arc::new(HotReloadCoordinator::new(
            Arc::clone(&loader),
            Arc::clone(&table),
            bus.clone(),
            config.sandbox.drain_timeout(),
            activations_tx,
        ));
        let supervisor = Supervisor::new(
            Arc::clone(&coordinator),
            bus.clone(),
            RestartPolicy {
                max_restarts: config.sandbox.max_restarts,
                backoff: RetryConfig::new(
                    config.sandbox.max_restarts,
                    Duration::from_millis(config.sandbox.restart_backoff_initial_ms),
                    Duration::from_millis(config.sandbox.restart_backoff_max_ms),
                )
                .with_jitter(0.0),
                stable_after: Duration::from_millis(config.sandbox.restart_stable_ms),
            },
        );
        let dispatcher = JobDispatcher::new(
            Arc::clone(&table),
            store,
            bus.clone(),
            DispatcherSettings {
                retry: RetryConfig::new(
                    config.dispatcher.max_attempts,
                    Duration::from_millis(config.dispatcher.backoff_initial_ms),
                    Duration::from_millis(config.dispatcher.backoff_max_ms),
                )
                .with_jitter(config.dispatcher.backoff_jitter),
                job_timeout: Duration::from_millis(config.dispatcher.job_timeout_ms),
            },
        );

        let runtime = Arc::new(PluginRuntime {
            config,
            bus,
            event_log,
            devices: self.devices,
            threads: self.threads,
            loader,
            table,
            coordinator,
            supervisor: Arc::clone(&supervisor),
            dispatcher,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });

        runtime
            .tasks
            .spawn(supervisor.run(activations_rx, runtime.shutdown.clone()));
        runtime
            .tasks
            .spawn(kill_switch(Arc::downgrade(&runtime), kill_rx, runtime.shutdown.clone()));
        runtime.tasks.spawn(forward_queue(
            runtime.dispatcher.clone(),
            queue_rx,
            runtime.shutdown.clone(),
        ));
        info!("plugin runtime ready");
        Ok(runtime)
    }
}

impl std::fmt::Debug for PluginRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntimeBuilder")
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}

/// Loads plugins, routes work to them and keeps them running.
///
/// This is the surface embedders and the CLI use: lifecycle operations,
/// status queries, typed subscriptions, job submission, and the background
/// sources (event pump, device monitor, file source, hot-reload watcher).
pub struct PluginRuntime {
    config: Config,
    bus: RuntimeBus,
    event_log: Arc<dyn EventLog>,
    devices: DeviceDirectory,
    threads: Arc<ThreadBackend>,
    loader: Arc<PluginLoader>,
    table: Arc<DispatchTable>,
    coordinator: Arc<HotReloadCoordinator>,
    supervisor: Arc<Supervisor>,
    dispatcher: JobDispatcher,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl PluginRuntime {
    /// Start building a runtime.
    #[must_use]
    pub fn builder() -> PluginRuntimeBuilder {
        PluginRuntimeBuilder::new()
    }

    // ----- lifecycle -----

    /// Load the plugin in `dir` and route it, replacing any routed version.
    ///
    /// # Errors
    ///
    /// As [`HotReloadCoordinator::install`].
    pub async fn load(&self, dir: &Path) -> RuntimeResult<Arc<PluginInstance>> {
        self.coordinator.install(dir).await
    }

    /// Load every plugin under the configured plugin roots. A plugin that
    /// fails does not stop the others.
    pub async fn load_all(&self) -> Vec<(PathBuf, RuntimeResult<InstanceId>)> {
        let mut results = Vec::new();
        for dir in discover_plugin_dirs(&self.config.runtime.plugin_dirs) {
            let result = self.load(&dir).await.map(|i| i.id().clone());
            if let Err(e) = &result {
                warn!(dir = %dir.display(), error = %e, "plugin failed to load");
            }
            results.push((dir, result));
        }
        results
    }

    /// Drain and unload `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotFound`] if `name` is not routed.
    pub async fn unload(&self, name: &PluginName) -> RuntimeResult<()> {
        self.coordinator.unload(name).await
    }

    /// Reload `name` from its directory.
    ///
    /// # Errors
    ///
    /// As [`HotReloadCoordinator::reload`].
    pub async fn reload(&self, name: &PluginName) -> RuntimeResult<Arc<PluginInstance>> {
        self.coordinator.reload(name).await
    }

    /// Unload `name` without draining.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotFound`] if `name` is not routed.
    pub async fn force_unload(&self, name: &PluginName) -> RuntimeResult<()> {
        self.coordinator.force_unload(name).await
    }

    /// Re-enable `name`, reset its restart count and reload it.
    ///
    /// # Errors
    ///
    /// As [`HotReloadCoordinator::reload`].
    pub async fn force_reload(&self, name: &PluginName) -> RuntimeResult<Arc<PluginInstance>> {
        self.supervisor.reset(name);
        self.coordinator.force_reload(name).await
    }

    // ----- status -----

    /// Status of `id`: the newest live instance, or else the last status
    /// it reached. `None` if the id was never seen.
    #[must_use]
    pub fn status(&self, id: &InstanceId) -> Option<PluginStatus> {
        let record = self.loader.book().get(id);
        let disabled_reason = self.coordinator.disabled_reason(id.name());
        let live = self
            .loader
            .live()
            .into_iter()
            .filter(|i| i.id() == id)
            .max_by_key(|i| i.generation());
        match (live, record) {
            (Some(instance), record) => Some(PluginStatus::live(
                instance.snapshot(),
                record,
                disabled_reason,
            )),
            (None, Some(record)) => Some(PluginStatus::recorded(id.clone(), record, disabled_reason)),
            (None, None) => None,
        }
    }

    /// Every live instance, plus the last status of each id without one,
    /// by name then generation.
    #[must_use]
    pub fn statuses(&self) -> Vec<PluginStatus> {
        let live = self.loader.live();
        let book = self.loader.book();
        let mut all: Vec<PluginStatus> = live
            .iter()
            .map(|i| {
                PluginStatus::live(
                    i.snapshot(),
                    book.get(i.id()),
                    self.coordinator.disabled_reason(i.id().name()),
                )
            })
            .collect();
        all.extend(
            book.all()
                .into_iter()
                .filter(|(id, _)| !live.iter().any(|i| i.id() == id))
                .map(|(id, record)| {
                    let reason = self.coordinator.disabled_reason(id.name());
                    PluginStatus::recorded(id, record, reason)
                }),
        );
        all.sort_by(|a, b| {
            a.id.name()
                .cmp(b.id.name())
                .then(a.id.version().cmp(b.id.version()))
                .then(a.generation.cmp(&b.generation))
        });
        all
    }

    /// Why `name` is disabled, if it is.
    #[must_use]
    pub fn disabled_reason(&self, name: &PluginName) -> Option<String> {
        self.coordinator.disabled_reason(name)
    }

    // ----- subscriptions -----

    /// Lifecycle transitions.
    #[must_use]
    pub fn subscribe_lifecycle(&self) -> Subscription<LifecycleEvent> {
        self.bus.subscribe_lifecycle()
    }

    /// Permission violations.
    #[must_use]
    pub fn subscribe_violations(&self) -> Subscription<PermissionViolation> {
        self.bus.subscribe_violations()
    }

    /// Diagnostics for terminal failures.
    #[must_use]
    pub fn subscribe_diagnostics(&self) -> Subscription<Diagnostic> {
        self.bus.subscribe_diagnostics()
    }

    /// Hot-reload outcomes.
    #[must_use]
    pub fn subscribe_reloads(&self) -> Subscription<ReloadRecord> {
        self.bus.reloads.subscribe()
    }

    /// Dead-lettered jobs.
    #[must_use]
    pub fn subscribe_dead_letters(&self) -> Subscription<DeadLetterNotice> {
        self.bus.dead_letters.subscribe()
    }

    /// Successful jobs.
    #[must_use]
    pub fn subscribe_jobs(&self) -> Subscription<JobFinished> {
        self.bus.jobs.subscribe()
    }

    // ----- jobs -----

    /// Queue an external job.
    ///
    /// # Errors
    ///
    /// As [`JobDispatcher::submit`].
    pub async fn submit(&self, request: JobRequest) -> RuntimeResult<JobId> {
        self.dispatcher.submit(request).await
    }

    /// Publish a host-originated queue message.
    ///
    /// # Errors
    ///
    /// As [`JobDispatcher::publish`].
    pub async fn publish(&self, topic: &str, message: Value) -> RuntimeResult<Vec<JobId>> {
        self.dispatcher.publish(topic, message, None).await
    }

    /// Re-queue unfinished jobs from the store.
    ///
    /// # Errors
    ///
    /// As [`JobDispatcher::recover`].
    pub async fn recover(&self) -> RuntimeResult<usize> {
        self.dispatcher.recover().await
    }

    /// Replay a dead-lettered job.
    ///
    /// # Errors
    ///
    /// As [`JobDispatcher::requeue_dead_letter`].
    pub async fn requeue_dead_letter(&self, id: JobId) -> RuntimeResult<()> {
        self.dispatcher.requeue_dead_letter(id).await
    }

    /// Look a job up.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn job(&self, id: JobId) -> RuntimeResult<Option<Job>> {
        self.dispatcher.job(id).await
    }

    /// Dead-lettered jobs.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn dead_letters(&self) -> RuntimeResult<Vec<Job>> {
        self.dispatcher.dead_letters().await
    }

    // ----- background sources -----

    /// Load all plugins, recover jobs and start every source the
    /// configuration enables.
    ///
    /// # Errors
    ///
    /// Returns an error if recovery or a source fails to start. Plugin load
    /// failures are reported through diagnostics only.
    pub async fn start(self: &Arc<Self>) -> RuntimeResult<()> {
        self.load_all().await;
        self.recover().await?;
        self.start_event_pump();
        if self.config.devices.enabled {
            let enumerator = Arc::new(SysfsEnumerator::new(&self.config.devices.sysfs_root));
            self.start_device_monitor(enumerator, Some(self.config.devices.devfs_root.as_path()));
        }
        if !self.config.devices.watch_paths.is_empty() {
            self.start_file_source(self.config.devices.watch_paths.clone())?;
        }
        if self.config.watcher.enabled {
            self.start_watcher()?;
        }
        Ok(())
    }

    /// Feed the configured event stream into the dispatcher.
    pub fn start_event_pump(&self) {
        let pump = EventPump::new(
            Arc::clone(&self.event_log),
            self.config.runtime.event_stream.clone(),
            DISPATCH_CONSUMER,
            self.dispatcher.clone(),
        );
        self.tasks.spawn(pump.run(self.shutdown.clone()));
    }

    /// Log attach and detach events from `enumerator`, with callback
    /// notices from `devfs_root` when it can be watched. Without notices the
    /// monitor relies on polling alone.
    pub fn start_device_monitor(
        &self,
        enumerator: Arc<dyn DeviceEnumerator>,
        devfs_root: Option<&Path>,
    ) {
        let devices = &self.config.devices;
        let monitor = DeviceMonitor::new(
            Arc::clone(&self.event_log),
            self.config.runtime.event_stream.clone(),
            enumerator,
            self.devices.clone(),
        )
        .with_poll_interval(Duration::from_millis(devices.poll_interval_ms))
        .with_dedup_window(Duration::from_millis(devices.dedup_window_ms));

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = devfs_root.and_then(|root| match DevfsWatcher::spawn(root, tx) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(root = %root.display(), error = %e, "device node watcher unavailable, polling only");
                None
            },
        });
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let _watcher = watcher;
            monitor.run(rx, shutdown).await;
        });
    }

    /// Log `FileChanged` events for `paths`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Device`] if the platform watcher cannot
    /// start.
    pub fn start_file_source(&self, paths: Vec<PathBuf>) -> RuntimeResult<()> {
        let source = FileChangeSource::new(
            Arc::clone(&self.event_log),
            self.config.runtime.event_stream.clone(),
            paths,
        )?
        .with_debounce(Duration::from_millis(self.config.devices.file_debounce_ms));
        self.tasks.spawn(source.run(self.shutdown.clone()));
        Ok(())
    }

    /// Watch the plugin roots and hot-reload on change.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Startup`] if the platform watcher cannot
    /// start.
    pub fn start_watcher(self: &Arc<Self>) -> RuntimeResult<()> {
        let (watcher, mut events) = PluginWatcher::new(WatcherConfig {
            watch_paths: self.config.runtime.plugin_dirs.clone(),
            debounce: Duration::from_millis(self.config.watcher.debounce_ms),
        })?;
        self.tasks.spawn(watcher.run(self.shutdown.clone()));

        let runtime = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(runtime) = runtime.upgrade() else {
                    break;
                };
                runtime.handle_watch_event(event).await;
            }
        });
        Ok(())
    }

    /// Apply one watcher event: a changed directory is installed (a reload
    /// when its plugin is routed, a first load otherwise) and a removed
    /// one is unloaded.
    pub async fn handle_watch_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::PluginChanged { plugin_dir, source_hash } => {
                debug!(plugin_dir = %plugin_dir.display(), %source_hash, "plugin changed");
                if let Err(e) = self.coordinator.install(&plugin_dir).await {
                    warn!(plugin_dir = %plugin_dir.display(), error = %e, "hot reload failed");
                }
            },
            WatchEvent::PluginRemoved { plugin_dir } => {
                let Some(name) = self.coordinator.name_for_dir(&plugin_dir) else {
                    return;
                };
                match self.coordinator.unload(&name).await {
                    Ok(()) | Err(RuntimeError::NotFound(_)) => {},
                    Err(e) => warn!(plugin = %name, error = %e, "unload after removal failed"),
                }
            },
            WatchEvent::Error(message) => warn!(%message, "plugin watcher error"),
        }
    }

    // ----- accessors -----

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Notification channels.
    #[must_use]
    pub fn bus(&self) -> &RuntimeBus {
        &self.bus
    }

    /// The event log.
    #[must_use]
    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.event_log
    }

    /// Attached devices.
    #[must_use]
    pub fn devices(&self) -> &DeviceDirectory {
        &self.devices
    }

    /// The thread backend, for registering guests after build.
    #[must_use]
    pub fn threads(&self) -> &Arc<ThreadBackend> {
        &self.threads
    }

    /// Routing table.
    #[must_use]
    pub fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }

    /// Loader.
    #[must_use]
    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    /// Reload coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<HotReloadCoordinator> {
        &self.coordinator
    }

    /// Crash supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Job dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    /// Stop every source, finish running jobs, unload every plugin and wait
    /// for background tasks.
    pub async fn shutdown(&self) {
        info!("plugin runtime shutting down");
        self.shutdown.cancel();
        self.dispatcher.shutdown().await;
        self.coordinator.shutdown().await;
        self.tasks.close();
        self.tasks.wait().await;
        info!("plugin runtime stopped");
    }
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("routed", &self.table.names())
            .field("loader", &self.loader)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

/// Force-unload and disable instances whose violations crossed the
/// threshold.
async fn kill_switch(
    runtime: std::sync::Weak<PluginRuntime>,
    mut rx: mpsc::UnboundedReceiver<InstanceId>,
    shutdown: CancellationToken,
) {
    loop {
        let id = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            id = rx.recv() => match id {
                Some(id) => id,
                None => break,
            },
        };
        let Some(runtime) = runtime.upgrade() else {
            break;
        };
        if !runtime.config.permissions.disable_on_threshold {
            continue;
        }
        let name = id.name().clone();
        let routed = runtime
            .table
            .current(&name)
            .is_some_and(|i| i.id() == &id);
        if !routed || runtime.coordinator.is_disabled(&name) {
            continue;
        }
        let reason = "permission violation threshold exceeded".to_string();
        runtime.coordinator.disable(&name, reason.clone());
        runtime.bus.diagnose(Diagnostic::new(
            DiagnosticKind::Disabled,
            name.as_str(),
            Some(id.clone()),
            reason,
        ));
        if let Err(e) = runtime.coordinator.force_unload(&name).await {
            warn!(plugin = %name, error = %e, "force unload after violations failed");
        }
    }
}

/// Turn guest queue publishes into jobs.
async fn forward_queue(
    dispatcher: JobDispatcher,
    mut rx: mpsc::UnboundedReceiver<QueueMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(e) = dispatcher
            .publish(&message.topic, message.message, Some(&message.from))
            .await
        {
            warn!(topic = %message.topic, error = %e, "failed to deliver queue message");
        }
    }
}
