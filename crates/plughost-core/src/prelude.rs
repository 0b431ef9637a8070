//! Prelude module - commonly used types for convenient import.
//!
//! Use `use plughost_core::prelude::*;` to import all essential types.

// Errors
pub use crate::{CoreError, CoreResult};

// Identity
pub use crate::{InstanceId, JobId, PluginName, Timestamp};

// Lifecycle
pub use crate::InstanceStatus;

// Capabilities and hooks
pub use crate::{Capability, HookKind};

// Wire protocol
pub use crate::{GuestMessage, HandlerOutcome, HostCall, HostCallResult, HostMessage};

// Retry
pub use crate::RetryConfig;
