//! Loading and retiring plugin instances.
//!
//! ```text
//! load(dir):
//!   Validating  schema + signature (no code runs)
//!   Loading     grants → backend → launch → ready → onLoad   (load timeout)
//!   Loaded
//!
//! retire(instance):
//!   Unloading   pause admission → drain → cancel → onUnload → teardown
//!   Unloaded
//! ```

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use plughost_core::{HookKind, InstanceId, InstanceStatus};
use plughost_events::{Diagnostic, DiagnosticKind, RuntimeBus};
use plughost_manifest::{
    ManifestValidator, ValidatedManifest, ValidationError, read_manifest,
};
use plughost_permissions::{GrantSet, PermissionEnforcer};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::{HostBridge, HostServices};
use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::PluginInstance;
use crate::lifecycle::{Lifecycle, StatusBook};
use crate::sandbox::{BackendSet, LaunchSpec, Session};
use crate::staging::StagingArea;

/// How long cancelled calls get to wind down after a failed drain.
const CANCEL_SETTLE: Duration = Duration::from_millis(250);

/// Timeouts applied by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderSettings {
    /// Launch, readiness and `onLoad` together.
    pub load_timeout: Duration,
    /// Bound on `onUnload`.
    pub unload_timeout: Duration,
    /// Time between the polite stop request and a forced kill.
    pub kill_grace: Duration,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(2),
            unload_timeout: Duration::from_secs(2),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Turns plugin directories into running instances and back.
pub struct PluginLoader {
    validator: ManifestValidator,
    backends: BackendSet,
    enforcer: Arc<PermissionEnforcer>,
    services: Arc<dyn HostServices>,
    kill_switch: mpsc::UnboundedSender<InstanceId>,
    bus: RuntimeBus,
    settings: LoaderSettings,
    staging: StagingArea,
    generation: AtomicU64,
    live: DashMap<(InstanceId, u64), Arc<PluginInstance>>,
    book: StatusBook,
}

impl PluginLoader {
    /// Create a loader. The validator always requires a trusted signature
    /// here, whatever limits it was built with.
    #[must_use]
    pub fn new(
        validator: ManifestValidator,
        backends: BackendSet,
        enforcer: Arc<PermissionEnforcer>,
        services: Arc<dyn HostServices>,
        kill_switch: mpsc::UnboundedSender<InstanceId>,
        bus: RuntimeBus,
        settings: LoaderSettings,
    ) -> Self {
        Self {
            validator: validator.enforcing_signatures(),
            backends,
            enforcer,
            services,
            kill_switch,
            bus,
            settings,
            staging: StagingArea::new(std::env::temp_dir().join("plughost-staging")),
            generation: AtomicU64::new(1),
            live: DashMap::new(),
            book: StatusBook::new(),
        }
    }

    /// Stage verified payloads below `staging` instead of the temp dir.
    #[must_use]
    pub fn with_staging(mut self, staging: StagingArea) -> Self {
        self.staging = staging;
        self
    }

    /// Timeouts in force.
    #[must_use]
    pub fn settings(&self) -> LoaderSettings {
        self.settings
    }

    /// The manifest validator.
    #[must_use]
    pub fn validator(&self) -> &ManifestValidator {
        &self.validator
    }

    /// Shared permission enforcer.
    #[must_use]
    pub fn enforcer(&self) -> &Arc<PermissionEnforcer> {
        &self.enforcer
    }

    /// Instances started and not yet torn down.
    #[must_use]
    pub fn live(&self) -> Vec<Arc<PluginInstance>> {
        self.live.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Last known status of every instance id this loader tracked.
    #[must_use]
    pub fn book(&self) -> &StatusBook {
        &self.book
    }

    /// Number of instances started and not yet torn down.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Validate and start the plugin in `dir`, leaving it `Loaded`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Validation`] without running any plugin
    /// code if the manifest is rejected, [`RuntimeError::LoadTimeout`] if
    /// startup and `onLoad` overran the load timeout, and the backend or
    /// handler error otherwise. Every failure leaves the instance `Failed`,
    /// its context torn down, and a diagnostic published.
    pub async fn load(&self, dir: &Path) -> RuntimeResult<Arc<PluginInstance>> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let Some(peeked) = peek_instance_id(dir) else {
            // Without a name and version there is no instance to track.
            let err = self.validate(dir).await.err().unwrap_or_else(|| {
                RuntimeError::Startup(format!("{} has no readable identity", dir.display()))
            });
            self.bus.diagnose(Diagnostic::new(
                diagnostic_kind(&err),
                dir.display().to_string(),
                None,
                err.to_string(),
            ));
            return Err(err);
        };

        let lifecycle = Lifecycle::begin(peeked, generation, self.bus.clone(), self.book.clone());
        let validated = match self.validate(dir).await {
            Ok(v) => v,
            Err(err) => {
                lifecycle.fail();
                self.bus.diagnose(Diagnostic::new(
                    diagnostic_kind(&err),
                    lifecycle.instance().name().as_str(),
                    Some(lifecycle.instance().clone()),
                    err.to_string(),
                ));
                return Err(err);
            },
        };
        if validated.instance_id() != *lifecycle.instance() {
            // The manifest changed between the peek and the full read.
            lifecycle.fail();
            return Err(RuntimeError::Startup(format!(
                "{} changed while loading",
                dir.display()
            )));
        }

        lifecycle.transition(InstanceStatus::Loading)?;
        let instance_id = lifecycle.instance().clone();
        #[allow(clippy::arithmetic_side_effects)]
        // Instant + Duration cannot overflow in practice
        let deadline = tokio::time::Instant::now() + self.settings.load_timeout;

        let instance = self.start(lifecycle, &validated, deadline).await?;

        self.live.insert(
            (instance.id().clone(), instance.generation()),
            Arc::clone(&instance),
        );

        let ready = tokio::time::timeout_at(deadline, self.initialize(&instance)).await;
        let failure = match ready {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(_) => Some(RuntimeError::LoadTimeout {
                instance: instance_id.clone(),
                timeout_ms: millis(self.settings.load_timeout),
            }),
        };
        if let Some(err) = failure {
            let kind = match err {
                RuntimeError::LoadTimeout { .. } => DiagnosticKind::LoadTimeout,
                _ => DiagnosticKind::StartupError,
            };
            self.bus.diagnose(Diagnostic::new(
                kind,
                instance_id.name().as_str(),
                Some(instance_id.clone()),
                err.to_string(),
            ));
            self.teardown_failed(&instance).await;
            return Err(err);
        }

        instance.transition(InstanceStatus::Loaded)?;
        info!(
            instance = %instance.id(),
            generation = instance.generation(),
            dir = %dir.display(),
            "plugin loaded"
        );
        Ok(instance)
    }

    /// Retire `instance`: stop admission, drain for up to `drain_timeout`,
    /// cancel what is left, run `onUnload` and tear the context down.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidTransition`] if the instance is not
    /// `Loaded` or `Active`.
    pub async fn retire(
        &self,
        instance: &Arc<PluginInstance>,
        drain_timeout: Duration,
    ) -> RuntimeResult<()> {
        instance.transition(InstanceStatus::Unloading)?;
        instance.pause_admission();

        if !instance.drain(drain_timeout).await {
            warn!(
                instance = %instance.id(),
                in_flight = instance.in_flight(),
                "drain timed out, cancelling remaining calls"
            );
            instance.session().cancel_all();
            let _ = instance.drain(CANCEL_SETTLE).await;
        }

        if instance.manifest().hooks.declares(HookKind::OnUnload) {
            let payload = json!({
                "instance": instance.id().to_string(),
                "generation": instance.generation(),
            });
            if let Err(e) = instance
                .invoke(HookKind::OnUnload, payload, self.settings.unload_timeout)
                .await
            {
                // Best effort: teardown goes ahead regardless.
                warn!(instance = %instance.id(), error = %e, "onUnload failed");
            }
        }

        self.release(instance).await;
        instance.transition(InstanceStatus::Unloaded)?;
        info!(instance = %instance.id(), generation = instance.generation(), "plugin unloaded");
        Ok(())
    }

    /// Tear down an instance that failed after it started, leaving it
    /// `Failed`.
    pub async fn teardown_failed(&self, instance: &Arc<PluginInstance>) {
        instance.pause_admission();
        instance.lifecycle().fail();
        instance.session().cancel_all();
        self.release(instance).await;
    }

    async fn validate(&self, dir: &Path) -> RuntimeResult<ValidatedManifest> {
        let validator = self.validator.clone();
        let dir = dir.to_path_buf();
        let validated = tokio::task::spawn_blocking(move || validator.validate_dir(&dir))
            .await
            .map_err(|e| {
                RuntimeError::Validation(ValidationError::Io {
                    path: String::new(),
                    message: e.to_string(),
                })
            })??;
        Ok(validated)
    }

    /// Derive grants, launch a context and wrap it in an instance.
    async fn start(
        &self,
        lifecycle: Lifecycle,
        validated: &ValidatedManifest,
        deadline: tokio::time::Instant,
    ) -> RuntimeResult<Arc<PluginInstance>> {
        let manifest = Arc::clone(validated.manifest());
        let id = lifecycle.instance().clone();
        let fail = |lifecycle: &Lifecycle, err: RuntimeError| {
            lifecycle.fail();
            let kind = match err {
                RuntimeError::LoadTimeout { .. } => DiagnosticKind::LoadTimeout,
                _ => DiagnosticKind::StartupError,
            };
            self.bus.diagnose(Diagnostic::new(
                kind,
                id.name().as_str(),
                Some(id.clone()),
                err.to_string(),
            ));
            err
        };

        let grants = match GrantSet::from_manifest(&manifest) {
            Ok(g) => Arc::new(g),
            Err(e) => return Err(fail(&lifecycle, e.into())),
        };
        let backend = match self.backends.select(&manifest) {
            Ok(b) => b,
            Err(e) => return Err(fail(&lifecycle, e)),
        };
        let Some(dir) = validated.dir().map(Path::to_path_buf) else {
            return Err(fail(
                &lifecycle,
                RuntimeError::Startup("plugin was not validated from a directory".to_string()),
            ));
        };
        // Contexts run from a sealed copy checked against the signed hashes,
        // never from the plugin directory itself.
        let staging = self.staging.clone();
        let to_stage = validated.clone();
        let staged = match tokio::task::spawn_blocking(move || staging.stage(&to_stage)).await {
            Ok(Ok(staged)) => staged,
            Ok(Err(e)) => return Err(fail(&lifecycle, e)),
            Err(e) => return Err(fail(&lifecycle, RuntimeError::Startup(e.to_string()))),
        };
        let spec = LaunchSpec {
            instance: id.clone(),
            generation: lifecycle.generation(),
            manifest: Arc::clone(&manifest),
            grants: Arc::clone(&grants),
            dir: staged.dir().to_path_buf(),
            entry: staged.entry().to_path_buf(),
        };
        debug!(instance = %id, backend = backend.name(), "launching context");
        // A context that comes up after the deadline is dropped with its
        // channels, which stops it.
        let channels = match tokio::time::timeout_at(deadline, backend.launch(spec)).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => return Err(fail(&lifecycle, e)),
            Err(_) => {
                let err = RuntimeError::LoadTimeout {
                    instance: id.clone(),
                    timeout_ms: millis(self.settings.load_timeout),
                };
                return Err(fail(&lifecycle, err));
            },
        };

        let bridge = Arc::new(HostBridge::new(
            id.clone(),
            Arc::clone(&grants),
            Arc::clone(&self.enforcer),
            Arc::clone(&self.services),
            self.kill_switch.clone(),
        ));
        let session = Session::start(id, channels, bridge);
        Ok(Arc::new(PluginInstance::new(
            lifecycle,
            manifest,
            dir,
            validated.payload_digest(),
            grants,
            session,
            staged,
        )))
    }

    /// Wait for readiness and run `onLoad`.
    async fn initialize(&self, instance: &Arc<PluginInstance>) -> RuntimeResult<()> {
        instance.session().wait_ready().await?;
        if instance.manifest().hooks.declares(HookKind::OnLoad) {
            let payload = json!({
                "instance": instance.id().to_string(),
                "generation": instance.generation(),
            });
            instance
                .invoke(HookKind::OnLoad, payload, self.settings.load_timeout)
                .await?;
        }
        Ok(())
    }

    async fn release(&self, instance: &Arc<PluginInstance>) {
        instance.session().shutdown(self.settings.kill_grace).await;
        instance.grants().revoke();
        instance.discard_staged();
        self.enforcer.forget(instance.id());
        self.live
            .remove(&(instance.id().clone(), instance.generation()));
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("backends", &self.backends)
            .field("settings", &self.settings)
            .field("live", &self.live.len())
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct Identity {
    name: String,
    version: String,
}

/// `name@version` from `dir/plugin.toml` without validating anything else.
#[must_use]
pub fn peek_instance_id(dir: &Path) -> Option<InstanceId> {
    let text = read_manifest(dir).ok()?;
    let identity: Identity = toml::from_str(&text).ok()?;
    format!("{}@{}", identity.name, identity.version).parse().ok()
}

fn diagnostic_kind(err: &RuntimeError) -> DiagnosticKind {
    match err {
        RuntimeError::Validation(ValidationError::Signature(_)) => DiagnosticKind::SignatureError,
        RuntimeError::Validation(_) => DiagnosticKind::SchemaError,
        RuntimeError::LoadTimeout { .. } => DiagnosticKind::LoadTimeout,
        _ => DiagnosticKind::StartupError,
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
