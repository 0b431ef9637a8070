//! Crash and limit-breach handling for routed instances.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use plughost_core::{InstanceStatus, PluginName, RetryConfig};
use plughost_events::{Diagnostic, DiagnosticKind, RuntimeBus};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::instance::PluginInstance;
use crate::reload::HotReloadCoordinator;
use crate::sandbox::ContextExit;

/// How many times a plugin is restarted before it is disabled, and how
/// long to wait between attempts.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Restarts allowed before the plugin is disabled.
    pub max_restarts: u32,
    /// Delay schedule between restarts.
    pub backoff: RetryConfig,
    /// A restarted instance that stays up this long clears the count.
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            backoff: RetryConfig::default(),
            stable_after: Duration::from_secs(60),
        }
    }
}

/// Watches every routed instance and replaces it when its context dies.
///
/// An exit while the instance is `Loaded` or `Active` is unexpected: the
/// instance goes `Failed`, leaves the dispatch table and is reloaded from
/// its directory after a backoff. After `max_restarts` the plugin is
/// disabled until someone force-reloads it. The count only covers crashes
/// in quick succession: an instance that stays up for `stable_after`
/// resets it.
pub struct Supervisor {
    coordinator: Arc<HotReloadCoordinator>,
    bus: RuntimeBus,
    policy: RestartPolicy,
    restarts: DashMap<PluginName, u32>,
    tasks: TaskTracker,
}

impl Supervisor {
    /// Create a supervisor.
    #[must_use]
    pub fn new(
        coordinator: Arc<HotReloadCoordinator>,
        bus: RuntimeBus,
        policy: RestartPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            bus,
            policy,
            restarts: DashMap::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Restarts made for `name` since it was last reset.
    #[must_use]
    pub fn restarts(&self, name: &PluginName) -> u32 {
        self.restarts.get(name).map_or(0, |r| *r)
    }

    /// Forget the restart count of `name`.
    pub fn reset(&self, name: &PluginName) {
        self.restarts.remove(name);
    }

    /// Supervise every instance arriving on `activations` until `shutdown`.
    pub async fn run(
        self: Arc<Self>,
        mut activations: mpsc::UnboundedReceiver<Arc<PluginInstance>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let instance = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                next = activations.recv() => match next {
                    Some(instance) => instance,
                    None => break,
                },
            };
            let this = Arc::clone(&self);
            let token = shutdown.clone();
            self.tasks.spawn(async move { this.watch(instance, token).await });
        }
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn watch(&self, instance: Arc<PluginInstance>, shutdown: CancellationToken) {
        let mut exit = instance.exit_signal();
        let name = instance.manifest().name.clone();
        let stable = tokio::time::sleep(self.policy.stable_after);
        tokio::pin!(stable);
        let mut counting = self.restarts(&name) > 0;
        let outcome = loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = &mut stable, if counting => {
                    counting = false;
                    if matches!(instance.status(), InstanceStatus::Active | InstanceStatus::Loaded) {
                        info!(plugin = %name, instance = %instance.id(), "plugin stable, restart count cleared");
                        self.reset(&name);
                    }
                },
                outcome = exit.wait_for(Option::is_some) => {
                    break outcome.ok().and_then(|e| e.clone());
                },
            }
        };
        let Some(outcome) = outcome else {
            return;
        };
        if !matches!(instance.status(), InstanceStatus::Active | InstanceStatus::Loaded) {
            // Retired or already failed: an expected exit.
            return;
        }

        let (kind, message) = match &outcome {
            ContextExit::LimitExceeded(detail) => {
                (DiagnosticKind::ResourceLimitExceeded, detail.clone())
            },
            ContextExit::Crashed(detail) => (DiagnosticKind::Crash, detail.clone()),
            ContextExit::Normal => (
                DiagnosticKind::Crash,
                "context exited without being asked to".to_string(),
            ),
        };
        error!(instance = %instance.id(), %message, "plugin context died");
        let was_routed = self.coordinator.table().remove_instance(&instance);
        self.coordinator.loader().teardown_failed(&instance).await;
        self.bus.diagnose(Diagnostic::new(
            kind,
            name.as_str(),
            Some(instance.id().clone()),
            message,
        ));

        if was_routed {
            self.restart(&name, &shutdown).await;
        }
    }

    async fn restart(&self, name: &PluginName, shutdown: &CancellationToken) {
        let Some(dir) = self.coordinator.dir_of(name) else {
            return;
        };
        loop {
            let attempt = {
                let mut count = self.restarts.entry(name.clone()).or_insert(0);
                *count = count.saturating_add(1);
                *count
            };
            if attempt > self.policy.max_restarts {
                let reason = format!("crashed {} times", self.policy.max_restarts.saturating_add(1));
                self.coordinator.disable(name, reason.clone());
                self.bus.diagnose(Diagnostic::new(
                    DiagnosticKind::Disabled,
                    name.as_str(),
                    None,
                    reason,
                ));
                return;
            }

            let delay = self.policy.backoff.delay_for_attempt(attempt.saturating_sub(1));
            info!(plugin = %name, attempt, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "restarting plugin");
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {},
            }
            if self.coordinator.table().current(name).is_some() {
                // Someone else loaded it in the meantime.
                return;
            }
            match self.coordinator.install(&dir).await {
                Ok(instance) => {
                    info!(plugin = %name, instance = %instance.id(), "plugin restarted");
                    return;
                },
                Err(e) => warn!(plugin = %name, attempt, error = %e, "restart failed"),
            }
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("policy", &self.policy)
            .field("restarting", &self.restarts.len())
            .finish_non_exhaustive()
    }
}
