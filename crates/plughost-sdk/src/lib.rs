//! Plughost SDK - the guest side of the plugin protocol.
//!
//! A plugin implements [`Guest`] (or builds a [`HandlerRouter`]) and hands it
//! to [`serve`]. Native plugins run `serve` inside the host's thread backend;
//! out-of-process plugins call [`run_stdio`] from `main`, which speaks the
//! same protocol as newline-delimited JSON over stdin/stdout.
//!
//! Everything capability-sensitive goes through [`HostApi`]. The host checks
//! each call against the instance's grants and answers with the result or a
//! denial.
//!
//! ```ignore
//! struct Counter;
//!
//! #[async_trait::async_trait]
//! impl Guest for Counter {
//!     async fn on_invoke(&self, call: Invocation, ctx: HookContext) -> Result<Value, String> {
//!         ctx.host().log(LogLevel::Info, format!("handling {}", call.handler));
//!         Ok(serde_json::json!({"ok": true}))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SdkError> {
//!     run_stdio(Arc::new(Counter)).await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod guest;
mod host;
mod router;
mod serve;
mod stdio;

pub use error::{SdkError, SdkResult};
pub use guest::{Guest, HookContext, Invocation};
pub use host::HostApi;
pub use router::HandlerRouter;
pub use serve::serve;
pub use stdio::run_stdio;

pub use plughost_core::{HookKind, LogLevel};
pub use serde_json::Value;
