//! Plughost Telemetry - logging setup.
//!
//! Wraps `tracing-subscriber` with an [`EnvFilter`](tracing_subscriber::EnvFilter)
//! built from a level plus per-crate directives, one of four output formats,
//! and an optional daily-rotated file target.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, LogTarget, setup_logging};
