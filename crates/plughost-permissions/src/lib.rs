//! Plughost Permissions - capability grants and their enforcement.
//!
//! A plugin's manifest declares what it may touch. [`GrantSet`] compiles
//! those declarations into matchers once per instance, and the
//! [`PermissionEnforcer`] answers every capability check at the sandbox
//! boundary:
//!
//! - Anything not covered by a grant is denied.
//! - Every denial publishes exactly one
//!   [`PermissionViolation`](plughost_events::PermissionViolation) and lands in
//!   a bounded audit ring.
//! - A [`ViolationPolicy`] counts denials per instance in a sliding window and
//!   flags the one that crosses the threshold.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod audit;
pub mod enforcer;
pub mod error;
pub mod grant;
pub mod pattern;
pub mod policy;

pub use audit::{AuditRing, DenialRecord};
pub use enforcer::{Decision, PermissionEnforcer};
pub use error::{PermissionError, PermissionResult};
pub use grant::GrantSet;
pub use pattern::{
    HostPattern, InboundPattern, PathPattern, has_traversal, resolve_physical, topic_matches,
};
pub use policy::ViolationPolicy;
