//! In-process contexts on dedicated threads.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use plughost_core::{HostMessage, PluginName};
use plughost_manifest::Manifest;
use plughost_sdk::Guest;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{ContextChannels, ContextExit, ContextHandle, ExecutionBackend, LaunchSpec};
use crate::error::{RuntimeError, RuntimeResult};

/// Entry point extension served by the thread backend.
pub const NATIVE_EXTENSION: &str = "native";

/// Builds a fresh guest for each launched instance.
pub type GuestFactory = Arc<dyn Fn(&LaunchSpec) -> Arc<dyn Guest> + Send + Sync>;

/// Runs guests compiled into the host on their own OS thread.
///
/// Each context gets a thread with a current-thread tokio runtime that runs
/// [`plughost_sdk::serve`]. The only link to the host is the pair of message
/// channels. Handler panics are contained by the guest loop; a panic in the
/// loop itself ends the context as crashed.
///
/// Threads cannot be killed. Termination asks the guest to shut down and,
/// if it does not within the grace period, detaches the thread; its channels
/// are already closed so it can no longer affect the host. There is no
/// memory ceiling for thread contexts.
#[derive(Default)]
pub struct ThreadBackend {
    guests: DashMap<PluginName, GuestFactory>,
}

impl ThreadBackend {
    /// Create a backend with no registered guests.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for plugin `name`.
    pub fn register(&self, name: PluginName, factory: GuestFactory) {
        self.guests.insert(name, factory);
    }

    /// Register a guest shared by every instance of `name`.
    pub fn register_guest(&self, name: PluginName, guest: Arc<dyn Guest>) {
        self.register(name, Arc::new(move |_spec: &LaunchSpec| Arc::clone(&guest)));
    }

    /// Whether `name` has a registered guest.
    #[must_use]
    pub fn is_registered(&self, name: &PluginName) -> bool {
        self.guests.contains_key(name)
    }
}

impl std::fmt::Debug for ThreadBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.guests.iter().map(|e| e.key().to_string()).collect();
        f.debug_struct("ThreadBackend")
            .field("guests", &names)
            .finish()
    }
}

#[async_trait]
impl ExecutionBackend for ThreadBackend {
    fn name(&self) -> &'static str {
        "thread"
    }

    fn supports(&self, manifest: &Manifest) -> bool {
        manifest.entry_extension() == Some(NATIVE_EXTENSION) && self.is_registered(&manifest.name)
    }

    async fn launch(&self, spec: LaunchSpec) -> RuntimeResult<ContextChannels> {
        let factory = self
            .guests
            .get(&spec.manifest.name)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| RuntimeError::EntryPoint {
                entry: spec.manifest.entry_point.clone(),
                reason: format!("no native guest registered for {}", spec.manifest.name),
            })?;
        let guest = factory(&spec);

        let (to_guest, guest_inbox) = mpsc::unbounded_channel();
        let (guest_outbox, from_guest) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let instance = spec.instance.to_string();

        std::thread::Builder::new()
            .name(format!("plugin-{instance}"))
            .spawn(move || {
                let exit = run_guest(guest, guest_inbox, guest_outbox);
                debug!(instance = %instance, ?exit, "thread context exited");
                let _ = exit_tx.send(Some(exit));
            })
            .map_err(|e| RuntimeError::Startup(format!("failed to spawn context thread: {e}")))?;

        Ok(ContextChannels {
            outbound: to_guest.clone(),
            inbound: from_guest,
            handle: Box::new(ThreadHandle {
                to_guest,
                exit: exit_rx,
            }),
        })
    }
}

fn run_guest(
    guest: Arc<dyn Guest>,
    inbox: mpsc::UnboundedReceiver<plughost_core::HostMessage>,
    outbox: mpsc::UnboundedSender<plughost_core::GuestMessage>,
) -> ContextExit {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => return ContextExit::Crashed(format!("failed to build context runtime: {e}")),
    };
    let served = std::panic::catch_unwind(AssertUnwindSafe(|| {
        rt.block_on(plughost_sdk::serve(guest, inbox, outbox))
    }));
    match served {
        Ok(Ok(())) => ContextExit::Normal,
        Ok(Err(e)) => ContextExit::Crashed(e.to_string()),
        Err(_) => ContextExit::Crashed("guest loop panicked".to_string()),
    }
}

struct ThreadHandle {
    to_guest: mpsc::UnboundedSender<HostMessage>,
    exit: watch::Receiver<Option<ContextExit>>,
}

#[async_trait]
impl ContextHandle for ThreadHandle {
    fn exit_signal(&self) -> watch::Receiver<Option<ContextExit>> {
        self.exit.clone()
    }

    async fn terminate(&self, grace: Duration) {
        let _ = self.to_guest.send(HostMessage::Shutdown);
        let mut exit = self.exit.clone();
        if tokio::time::timeout(grace, exit.wait_for(Option::is_some))
            .await
            .is_err()
        {
            warn!("thread context did not stop within grace period, detaching");
        }
    }
}
