//! Configuration types for the plughost runtime.
//!
//! Every struct implements [`Default`] with production defaults so that a
//! bare `[section]` header in TOML produces a working configuration. Durations
//! are stored as integer milliseconds (or seconds where the name says so).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration for the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where plugins, state and trusted keys live.
    pub runtime: RuntimeSection,
    /// Execution context budgets and restart policy.
    pub sandbox: SandboxSection,
    /// Job retry, backoff and persistence.
    pub dispatcher: DispatcherSection,
    /// Hotplug detection and file watching.
    pub devices: DevicesSection,
    /// Hot-reload watcher.
    pub watcher: WatcherSection,
    /// Permission violation kill-switch policy.
    pub permissions: PermissionsSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// RuntimeSection
// ---------------------------------------------------------------------------

/// Filesystem layout of an install.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Directories scanned for plugins; each child directory holding a
    /// `plugin.toml` is one plugin.
    pub plugin_dirs: Vec<PathBuf>,
    /// Event log, cursors and job store.
    pub state_dir: PathBuf,
    /// Directory of `<signer>.pub` files.
    pub trust_dir: PathBuf,
    /// Event log stream the device monitor appends to.
    pub event_stream: String,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            plugin_dirs: vec![PathBuf::from("/var/lib/plughost/plugins")],
            state_dir: PathBuf::from("/var/lib/plughost/state"),
            trust_dir: PathBuf::from("/etc/plughost/trusted"),
            event_stream: "devices".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// SandboxSection
// ---------------------------------------------------------------------------

/// Execution context budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Budget for context startup plus `onLoad`.
    pub load_timeout_ms: u64,
    /// Budget for the best-effort `onUnload` hook.
    pub unload_timeout_ms: u64,
    /// How long in-flight jobs may run after an unload starts.
    pub drain_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL for process contexts.
    pub kill_grace_ms: u64,
    /// Entry point extensions the validator accepts.
    pub allowed_extensions: Vec<String>,
    /// Interpreter command per entry point extension. Extensions without an
    /// entry are executed directly.
    pub interpreters: BTreeMap<String, String>,
    /// Upper bound accepted for `isolationLimits.maxHeapMb`.
    pub max_heap_mb_ceiling: u64,
    /// Resource sampling interval for process contexts.
    pub sample_interval_ms: u64,
    /// Automatic restarts before a crashing plugin is disabled.
    pub max_restarts: u32,
    /// First restart delay.
    pub restart_backoff_initial_ms: u64,
    /// Restart delay ceiling.
    pub restart_backoff_max_ms: u64,
    /// Uptime after which a restarted plugin's restart count is cleared.
    pub restart_stable_ms: u64,
}

impl SandboxSection {
    /// Load budget as a [`Duration`].
    #[must_use]
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Unload budget as a [`Duration`].
    #[must_use]
    pub fn unload_timeout(&self) -> Duration {
        Duration::from_millis(self.unload_timeout_ms)
    }

    /// Drain budget as a [`Duration`].
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for SandboxSection {
    fn default() -> Self {
        let interpreters = [("sh", "/bin/sh"), ("py", "python3"), ("js", "node")]
            .into_iter()
            .map(|(ext, cmd)| (ext.to_owned(), cmd.to_owned()))
            .collect();
        Self {
            load_timeout_ms: 5_000,
            unload_timeout_ms: 2_000,
            drain_timeout_ms: 10_000,
            kill_grace_ms: 1_000,
            allowed_extensions: ["native", "sh", "py", "js", "bin"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            interpreters,
            max_heap_mb_ceiling: 4_096,
            sample_interval_ms: 500,
            max_restarts: 3,
            restart_backoff_initial_ms: 500,
            restart_backoff_max_ms: 30_000,
            restart_stable_ms: 60_000,
        }
    }
}

// ---------------------------------------------------------------------------
// DispatcherSection
// ---------------------------------------------------------------------------

/// Where jobs are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStoreKind {
    /// One JSON file per job under `state_dir/jobs`.
    File,
    /// In memory only; lost on restart.
    Memory,
}

/// Job retry and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    /// Attempts per job, including the first, before dead-lettering.
    pub max_attempts: u32,
    /// First retry delay.
    pub backoff_initial_ms: u64,
    /// Retry delay ceiling.
    pub backoff_max_ms: u64,
    /// Jitter factor applied to retry delays, in `[0.0, 1.0]`.
    pub backoff_jitter: f64,
    /// Maximum runtime of one handler invocation.
    pub job_timeout_ms: u64,
    /// Job persistence backend.
    pub store: JobStoreKind,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_initial_ms: 200,
            backoff_max_ms: 30_000,
            backoff_jitter: 0.1,
            job_timeout_ms: 30_000,
            store: JobStoreKind::File,
        }
    }
}

// ---------------------------------------------------------------------------
// DevicesSection
// ---------------------------------------------------------------------------

/// Hotplug detection and file watching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesSection {
    /// Run the device monitor.
    pub enabled: bool,
    /// Full enumeration interval for the reconciling poll.
    pub poll_interval_ms: u64,
    /// Window in which repeated `(subjectId, kind)` detections collapse.
    pub dedup_window_ms: u64,
    /// Sysfs directory enumerated by the poll path.
    pub sysfs_root: PathBuf,
    /// Device node directory watched by the callback path.
    pub devfs_root: PathBuf,
    /// Files and directories whose changes become `FileChanged` events.
    pub watch_paths: Vec<PathBuf>,
    /// Debounce for file change events.
    pub file_debounce_ms: u64,
}

impl Default for DevicesSection {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 5_000,
            dedup_window_ms: 2_000,
            sysfs_root: PathBuf::from("/sys/bus/usb/devices"),
            devfs_root: PathBuf::from("/dev/bus/usb"),
            watch_paths: Vec::new(),
            file_debounce_ms: 250,
        }
    }
}

// ---------------------------------------------------------------------------
// WatcherSection
// ---------------------------------------------------------------------------

/// Hot-reload watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    /// Watch plugin directories and reload on change.
    pub enabled: bool,
    /// Quiet period that coalesces multi-file writes into one reload.
    pub debounce_ms: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// PermissionsSection
// ---------------------------------------------------------------------------

/// Permission violation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsSection {
    /// Violations inside the window that trip the kill switch. 0 disables it.
    pub violation_threshold: u32,
    /// Sliding window length.
    pub violation_window_secs: u64,
    /// Force-unload and disable a plugin once the threshold is reached.
    pub disable_on_threshold: bool,
    /// Violations retained in the in-memory audit ring.
    pub audit_capacity: usize,
}

impl Default for PermissionsSection {
    fn default() -> Self {
        Self {
            violation_threshold: 10,
            violation_window_secs: 60,
            disable_on_threshold: true,
            audit_capacity: 1_024,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"` or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["plughost_runtime=debug"]`).
    pub directives: Vec<String>,
    /// Write logs to this directory (daily rotation) instead of stderr.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
            directory: None,
        }
    }
}
