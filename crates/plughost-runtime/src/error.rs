//! Runtime errors.

use std::time::Duration;

use plughost_core::{InstanceId, InstanceStatus, PluginName};
use plughost_devices::DeviceError;
use plughost_manifest::ValidationError;
use plughost_permissions::PermissionError;
use thiserror::Error;

/// Errors from loading, running and routing to plugins.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The manifest failed the schema or signature check. No code was
    /// loaded.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// `onLoad` did not complete within the load timeout.
    #[error("{instance} did not finish loading within {timeout_ms}ms")]
    LoadTimeout {
        /// The instance that timed out.
        instance: InstanceId,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// No backend can run the entry point.
    #[error("unsupported entry point '{entry}': {reason}")]
    EntryPoint {
        /// Entry point from the manifest.
        entry: String,
        /// Why it was refused.
        reason: String,
    },

    /// The context could not be started or failed during startup.
    #[error("startup failed: {0}")]
    Startup(String),

    /// The instance breached a declared isolation limit.
    #[error("{instance} exceeded a resource limit: {message}")]
    ResourceLimitExceeded {
        /// Offending instance.
        instance: InstanceId,
        /// Which limit and by how much.
        message: String,
    },

    /// A handler reported failure.
    #[error("handler failed: {0}")]
    HandlerError(String),

    /// A reload was rejected; the previous instance is still active.
    #[error("reload of {plugin} rejected: {reason}")]
    ReloadConflict {
        /// Plugin being reloaded.
        plugin: PluginName,
        /// Why the new version was rejected.
        reason: String,
    },

    /// The lifecycle does not permit this transition.
    #[error("{instance}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// Instance being transitioned.
        instance: InstanceId,
        /// Current status.
        from: InstanceStatus,
        /// Requested status.
        to: InstanceStatus,
    },

    /// No such plugin, instance or job.
    #[error("not found: {0}")]
    NotFound(String),

    /// The plugin was disabled after repeated failures or violations.
    #[error("plugin {plugin} is disabled: {reason}")]
    Disabled {
        /// Disabled plugin.
        plugin: PluginName,
        /// Why it was disabled.
        reason: String,
    },

    /// The instance stopped admitting jobs.
    #[error("instance is not admitting jobs")]
    NotAdmitting,

    /// Grants could not be compiled.
    #[error(transparent)]
    Permission(#[from] PermissionError),

    /// Event log failure.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Job store failure.
    #[error("job store error: {0}")]
    Store(String),

    /// Filesystem or process I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The execution context went away.
    #[error("execution context closed: {0}")]
    ContextClosed(String),

    /// An invocation did not answer in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
