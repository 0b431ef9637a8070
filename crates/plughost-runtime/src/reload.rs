//! Zero-downtime replacement of a plugin's routed instance.
//!
//! ```text
//! install(dir)            [per-name lock held throughout]
//!   old stays Active ──────────────────────────────┐
//!   load(new) ─ fail ─► ReloadConflict, old intact │
//!      │                                            │
//!      ▼ Loaded                                     │
//!   pause(old) → swap(table) → new Active ──► retire(old) in background
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use plughost_core::{InstanceStatus, PluginName, Timestamp};
use plughost_events::{Diagnostic, DiagnosticKind, ReloadOutcome, ReloadRecord, RuntimeBus};
use tokio::sync::{Mutex, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::PluginInstance;
use crate::loader::{PluginLoader, peek_instance_id};
use crate::table::DispatchTable;

/// Serializes loads, reloads and unloads per plugin name and keeps the
/// dispatch table consistent with them.
pub struct HotReloadCoordinator {
    loader: Arc<PluginLoader>,
    table: Arc<DispatchTable>,
    bus: RuntimeBus,
    drain_timeout: Duration,
    locks: DashMap<PluginName, Arc<Mutex<()>>>,
    dirs: DashMap<PluginName, PathBuf>,
    disabled: DashMap<PluginName, String>,
    retiring: TaskTracker,
    activations: mpsc::UnboundedSender<Arc<PluginInstance>>,
}

impl HotReloadCoordinator {
    /// Create a coordinator. Every newly routed instance is sent on
    /// `activations` for supervision.
    #[must_use]
    pub fn new(
        loader: Arc<PluginLoader>,
        table: Arc<DispatchTable>,
        bus: RuntimeBus,
        drain_timeout: Duration,
        activations: mpsc::UnboundedSender<Arc<PluginInstance>>,
    ) -> Self {
        Self {
            loader,
            table,
            bus,
            drain_timeout,
            locks: DashMap::new(),
            dirs: DashMap::new(),
            disabled: DashMap::new(),
            retiring: TaskTracker::new(),
            activations,
        }
    }

    /// The routing table.
    #[must_use]
    pub fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }

    /// The loader.
    #[must_use]
    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    /// Directory `name` was last installed from.
    #[must_use]
    pub fn dir_of(&self, name: &PluginName) -> Option<PathBuf> {
        self.dirs.get(name).map(|d| d.value().clone())
    }

    /// Plugin name whose directory is `dir`.
    #[must_use]
    pub fn name_for_dir(&self, dir: &Path) -> Option<PluginName> {
        self.dirs
            .iter()
            .find(|e| e.value() == dir)
            .map(|e| e.key().clone())
    }

    /// Load the plugin in `dir` and route it, replacing whatever version is
    /// routed now.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Disabled`] for a disabled plugin,
    /// [`RuntimeError::ReloadConflict`] when a replacement failed to load
    /// (the routed instance is untouched), and the load error when there
    /// was nothing to replace.
    pub async fn install(&self, dir: &Path) -> RuntimeResult<Arc<PluginInstance>> {
        let Some(peeked) = peek_instance_id(dir) else {
            return self.loader.load(dir).await;
        };
        let name = peeked.name().clone();
        if let Some(reason) = self.disabled.get(&name) {
            return Err(RuntimeError::Disabled {
                plugin: name,
                reason: reason.value().clone(),
            });
        }

        let lock = self.lock_for(&name);
        let _guard = lock.lock().await;
        let previous = self.table.current(&name);

        let instance = match self.loader.load(dir).await {
            Ok(instance) => instance,
            Err(err) => {
                let Some(previous) = previous else {
                    return Err(err);
                };
                let reason = err.to_string();
                warn!(plugin = %name, active = %previous.id(), %reason, "reload rejected");
                self.bus.diagnose(Diagnostic::new(
                    DiagnosticKind::ReloadConflict,
                    name.as_str(),
                    Some(previous.id().clone()),
                    format!("kept {}: {reason}", previous.id()),
                ));
                self.bus.reloads.publish(ReloadRecord {
                    plugin: name.clone(),
                    previous: Some(previous.id().clone()),
                    current: None,
                    outcome: ReloadOutcome::Rejected {
                        reason: reason.clone(),
                    },
                    timestamp: Timestamp::now(),
                });
                return Err(RuntimeError::ReloadConflict {
                    plugin: name,
                    reason,
                });
            },
        };

        if let Err(e) = instance.transition(InstanceStatus::Active) {
            // Died between Loaded and here; the supervisor never saw it.
            self.loader.teardown_failed(&instance).await;
            return Err(e);
        }
        // The old instance stops admitting before the new one is routed, so
        // a job is admitted by exactly one of them.
        if let Some(old) = &previous {
            old.pause_admission();
        }
        let replaced = self.table.swap(Arc::clone(&instance));
        self.dirs.insert(name.clone(), dir.to_path_buf());
        let _ = self.activations.send(Arc::clone(&instance));

        if let Some(old) = replaced {
            info!(plugin = %name, from = %old.id(), to = %instance.id(), "plugin swapped");
            self.bus.reloads.publish(ReloadRecord {
                plugin: name.clone(),
                previous: Some(old.id().clone()),
                current: Some(instance.id().clone()),
                outcome: ReloadOutcome::Swapped,
                timestamp: Timestamp::now(),
            });
            self.retire_in_background(old);
        } else {
            info!(plugin = %name, instance = %instance.id(), "plugin active");
        }
        Ok(instance)
    }

    /// Reload `name` from the directory it was installed from.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotFound`] if `name` was never installed,
    /// otherwise as [`Self::install`].
    pub async fn reload(&self, name: &PluginName) -> RuntimeResult<Arc<PluginInstance>> {
        let dir = self
            .dir_of(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        self.install(&dir).await
    }

    /// Stop routing `name` and retire its instance, draining for the
    /// configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotFound`] if nothing is routed for `name`.
    pub async fn unload(&self, name: &PluginName) -> RuntimeResult<()> {
        self.unload_with(name, self.drain_timeout).await
    }

    /// Stop routing `name` and retire its instance without waiting for
    /// in-flight jobs.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotFound`] if nothing is routed for `name`.
    pub async fn force_unload(&self, name: &PluginName) -> RuntimeResult<()> {
        self.unload_with(name, Duration::ZERO).await
    }

    /// Clear any disabled mark on `name` and install it again from its
    /// directory.
    ///
    /// # Errors
    ///
    /// As [`Self::reload`].
    pub async fn force_reload(&self, name: &PluginName) -> RuntimeResult<Arc<PluginInstance>> {
        self.enable(name);
        self.reload(name).await
    }

    /// Refuse further installs of `name` until [`Self::enable`].
    pub fn disable(&self, name: &PluginName, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(plugin = %name, %reason, "plugin disabled");
        self.disabled.insert(name.clone(), reason);
    }

    /// Allow installs of `name` again.
    pub fn enable(&self, name: &PluginName) {
        if self.disabled.remove(name).is_some() {
            info!(plugin = %name, "plugin re-enabled");
        }
    }

    /// Why `name` is disabled, if it is.
    #[must_use]
    pub fn disabled_reason(&self, name: &PluginName) -> Option<String> {
        self.disabled.get(name).map(|r| r.value().clone())
    }

    /// Whether `name` is disabled.
    #[must_use]
    pub fn is_disabled(&self, name: &PluginName) -> bool {
        self.disabled.contains_key(name)
    }

    /// Retire every routed instance and wait for background retirements.
    pub async fn shutdown(&self) {
        for instance in self.table.routed() {
            let name = instance.manifest().name.clone();
            if let Err(e) = self.unload(&name).await {
                warn!(plugin = %name, error = %e, "unload during shutdown failed");
            }
        }
        self.retiring.close();
        self.retiring.wait().await;
    }

    /// Wait for instances being retired in the background.
    pub async fn settle(&self) {
        self.retiring.close();
        self.retiring.wait().await;
        self.retiring.reopen();
    }

    async fn unload_with(&self, name: &PluginName, drain: Duration) -> RuntimeResult<()> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        let instance = self
            .table
            .remove(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        instance.pause_admission();
        self.loader.retire(&instance, drain).await
    }

    fn retire_in_background(&self, old: Arc<PluginInstance>) {
        let loader = Arc::clone(&self.loader);
        let drain = self.drain_timeout;
        self.retiring.spawn(async move {
            if let Err(e) = loader.retire(&old, drain).await {
                warn!(instance = %old.id(), error = %e, "retiring replaced instance failed");
            }
        });
    }

    fn lock_for(&self, name: &PluginName) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(name.clone()).or_default().value())
    }
}

impl std::fmt::Debug for HotReloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReloadCoordinator")
            .field("routed", &self.table.names())
            .field("disabled", &self.disabled.len())
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}
