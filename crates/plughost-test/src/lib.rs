//! Plughost Test - shared test utilities for the plughost runtime.
//!
//! Helpers for building signed plugin directories, scripted guests that
//! record what they were asked to do, and a probe for asserting on side
//! effects across instances.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! plughost-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! let signer = TestSigner::new("acme");
//! let dir = tempfile::tempdir().unwrap();
//! PluginFixture::native("counter", "1.0.0")
//!     .hook(HookKind::OnJobReceived, "job")
//!     .write_signed(dir.path(), &signer)
//!     .unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod fixtures;
pub mod guests;
pub mod harness;
pub mod probe;
pub mod scripts;

pub use fixtures::{PluginFixture, TestSigner};
pub use guests::{Behavior, RecordingGuest};
pub use harness::{init_test_tracing, wait_until};
pub use probe::{ActiveGuard, ProbeEntry, SideEffectProbe};
pub use scripts::{ScriptGuest, sh_interpreters};
