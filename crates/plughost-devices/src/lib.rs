//! Plughost Devices - hotplug and file change detection.
//!
//! Change notices reach the runtime through an append-only, per-stream
//! [`EventLog`]. Producers never wait on consumers: the [`DeviceMonitor`] and
//! the [`FileChangeSource`] append and move on, and each consumer reads at its
//! own pace from a durable cursor through [`subscribe`].
//!
//! # Architecture
//!
//! ```text
//! /dev/bus/usb (notify) ──► HotplugNotice ──┐
//!                                          ├─► DeviceMonitor ─► dedup ─► EventLog
//! periodic enumeration (sysfs) ────────────┘                              │
//! watched paths (notify) ─► FileChangeSource ─► BLAKE3 ──────────────────►┤
//!                                                                         ▼
//!                                                subscribe(stream, consumer)
//! ```
//!
//! A notice whose descriptor cannot be read is still emitted, flagged
//! `degraded` with whatever attributes were available.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod dedup;
pub mod devfs;
pub mod directory;
pub mod enumerate;
pub mod error;
pub mod event;
pub mod file_source;
pub mod log;
pub mod monitor;
pub mod subscribe;

pub use dedup::{DEFAULT_DEDUP_WINDOW, Deduplicator};
pub use devfs::{DEVFS_USB_ROOT, DevfsWatcher, HotplugAction, HotplugNotice};
pub use directory::DeviceDirectory;
pub use enumerate::{
    DeviceEnumerator, DeviceInfo, SYSFS_USB_ROOT, StaticEnumerator, SysfsEnumerator, physical_key,
};
pub use error::{DeviceError, DeviceResult};
pub use event::{
    DeviceAttributes, DeviceEvent, EventKind, EventSource, NewEvent, file_subject_id,
    usb_subject_id,
};
pub use file_source::{DEFAULT_FILE_DEBOUNCE, FileChangeSource};
pub use log::{EventLog, FileEventLog, MemoryEventLog};
pub use monitor::{DEFAULT_POLL_INTERVAL, DeviceMonitor};
pub use subscribe::subscribe;
