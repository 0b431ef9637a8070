//! Plughost Core - shared vocabulary for the plugin hot-swap runtime.
//!
//! This crate provides:
//! - Identity types for plugins, instances and jobs
//! - The plugin instance lifecycle state machine
//! - Capabilities and hook kinds shared by the manifest and the enforcer
//! - The host/guest wire protocol spoken across the sandbox boundary
//! - Retry configuration with exponential backoff

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

pub mod capability;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod status;
pub mod types;

pub use capability::{Capability, HookKind};
pub use error::{CoreError, CoreResult};
pub use protocol::{
    GuestMessage, HandlerOutcome, HostCall, HostCallResult, HostMessage, LogLevel,
    PROTOCOL_VERSION,
};
pub use retry::RetryConfig;
pub use status::InstanceStatus;
pub use types::{InstanceId, JobId, PluginName, Timestamp};
