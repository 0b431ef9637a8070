//! End-to-end scenarios for the plughost runtime.
//!
//! Nothing here is exported. Each file under `tests/` drives a real
//! [`PluginRuntime`](plughost_runtime::PluginRuntime) through the harness in
//! `plughost-test`, on the thread backend or with `sh` child processes.

#![deny(unsafe_code)]
#![deny(clippy::all)]
