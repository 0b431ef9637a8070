//! Plughost Events - typed notification channels.
//!
//! Each notification kind the runtime produces has its own broadcast
//! [`Channel`]. There is no global emitter: a consumer subscribes to exactly
//! the kinds it cares about through the [`RuntimeBus`], and a slow consumer
//! only ever lags its own subscription.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod bus;
pub mod channel;
pub mod event;

pub use bus::RuntimeBus;
pub use channel::{Channel, DEFAULT_CHANNEL_CAPACITY, Subscription};
pub use event::{
    DeadLetterNotice, Diagnostic, DiagnosticKind, JobFinished, LifecycleEvent,
    PermissionViolation, ReloadOutcome, ReloadRecord,
};
