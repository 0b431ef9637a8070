//! Execution backends and the host side of a plugin context.
//!
//! A backend turns a validated plugin into a running context and hands back
//! a pair of message channels plus a [`ContextHandle`]. The host and the
//! context never share memory; everything crosses as protocol messages.
//!
//! - [`ProcessBackend`]: one child process per instance, JSON lines over
//!   stdin/stdout, environment cleared, confined by Landlock rules derived
//!   from its grants, memory and CPU sampled from `/proc`.
//! - [`ThreadBackend`]: a dedicated OS thread with its own single-threaded
//!   async runtime, for guests linked into the host binary.

mod confine;
mod process;
mod session;
mod thread;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plughost_core::{GuestMessage, HostMessage, InstanceId};
use plughost_manifest::Manifest;
use plughost_permissions::GrantSet;
use tokio::sync::{mpsc, watch};

use crate::error::{RuntimeError, RuntimeResult};

pub use confine::{Confinement, PathRule, landlock_available};
pub use process::{ProcessBackend, ProcessLimits, cpu_ticks, resident_kib};
pub use session::Session;
pub use thread::{GuestFactory, NATIVE_EXTENSION, ThreadBackend};

/// Everything a backend needs to start one instance.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// `name@version`.
    pub instance: InstanceId,
    /// Load generation, unique per runtime.
    pub generation: u64,
    /// The validated manifest.
    pub manifest: Arc<Manifest>,
    /// Grants compiled from the manifest.
    pub grants: Arc<GrantSet>,
    /// Directory holding the staged payload.
    pub dir: PathBuf,
    /// Absolute entry point path.
    pub entry: PathBuf,
}

/// How a context ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextExit {
    /// The guest loop returned after a shutdown request or closed channel.
    Normal,
    /// The context died on its own.
    Crashed(String),
    /// The context was killed for breaching an isolation limit.
    LimitExceeded(String),
}

/// Control over a running context, independent of its message channels.
#[async_trait]
pub trait ContextHandle: Send + Sync {
    /// Becomes `Some` once the context has exited.
    fn exit_signal(&self) -> watch::Receiver<Option<ContextExit>>;

    /// Stop the context, forcibly after `grace`.
    async fn terminate(&self, grace: Duration);

    /// OS process id, for process contexts.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// A freshly launched context.
pub struct ContextChannels {
    /// Host → guest.
    pub outbound: mpsc::UnboundedSender<HostMessage>,
    /// Guest → host.
    pub inbound: mpsc::UnboundedReceiver<GuestMessage>,
    /// Lifetime control.
    pub handle: Box<dyn ContextHandle>,
}

impl std::fmt::Debug for ContextChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextChannels")
            .field("pid", &self.handle.pid())
            .finish_non_exhaustive()
    }
}

/// Starts plugin contexts of one kind.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether this backend can run `manifest`'s entry point.
    fn supports(&self, manifest: &Manifest) -> bool;

    /// Start a context. The guest announces readiness on the inbound channel.
    async fn launch(&self, spec: LaunchSpec) -> RuntimeResult<ContextChannels>;
}

/// Backends in priority order.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: Vec<Arc<dyn ExecutionBackend>>,
}

impl BackendSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a backend; earlier backends win.
    #[must_use]
    pub fn with(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Pick the first backend that supports `manifest`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::EntryPoint`] if none does.
    pub fn select(&self, manifest: &Manifest) -> RuntimeResult<Arc<dyn ExecutionBackend>> {
        self.backends
            .iter()
            .find(|b| b.supports(manifest))
            .map(Arc::clone)
            .ok_or_else(|| RuntimeError::EntryPoint {
                entry: manifest.entry_point.clone(),
                reason: "no execution backend accepts this entry point".to_string(),
            })
    }
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.backends.iter().map(|b| b.name()))
            .finish()
    }
}
