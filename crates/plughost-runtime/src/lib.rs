//! Plughost Runtime - sandboxed plugin instances, hot reload and job
//! dispatch.
//!
//! # Architecture
//!
//! ```text
//! plugin dir ─► PluginLoader ─► ManifestValidator ─► ExecutionBackend
//!                    │                                 (process | thread)
//!                    ▼
//!              PluginInstance ◄── HostBridge ◄── guest host calls
//!                    │               │
//!                    │               └─► PermissionEnforcer ─► violations
//!                    ▼
//!   HotReloadCoordinator ─► DispatchTable (name → ArcSwap<instance>)
//!                                   ▲
//! EventLog ─► EventPump ─► JobDispatcher ─► per-plugin queue ─► invoke
//! ```
//!
//! The [`PluginRuntime`] wires these together and is the surface embedders
//! and the CLI talk to.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod bridge;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod loader;
pub mod reload;
pub mod runtime;
pub mod sandbox;
pub mod staging;
pub mod supervisor;
pub mod table;
pub mod watcher;

pub use bridge::{DefaultHostServices, HostBridge, HostServices, QueueMessage};
pub use discovery::discover_plugin_dirs;
pub use dispatcher::{
    DispatcherSettings, EventPump, FileJobStore, Job, JobDispatcher, JobRequest, JobState, JobStore,
    MemoryJobStore,
};
pub use error::{RuntimeError, RuntimeResult};
pub use instance::{InstanceSnapshot, JobPermit, PluginInstance, PluginStatus};
pub use lifecycle::{Lifecycle, StatusBook, StatusRecord};
pub use loader::{LoaderSettings, PluginLoader};
pub use reload::HotReloadCoordinator;
pub use runtime::{PluginRuntime, PluginRuntimeBuilder};
pub use sandbox::{
    Confinement, ContextExit, ExecutionBackend, LaunchSpec, PathRule, ProcessBackend,
    ThreadBackend, landlock_available,
};
pub use staging::{StagedPayload, StagingArea};
pub use supervisor::{RestartPolicy, Supervisor};
pub use table::DispatchTable;
pub use watcher::{PluginWatcher, WatchEvent, WatcherConfig, compute_source_hash};
