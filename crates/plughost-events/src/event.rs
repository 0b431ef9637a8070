//! Notification payloads published by the runtime.
//!
//! These are the records handed to observability and orchestration
//! collaborators. All of them serialize to camelCase JSON.

use std::fmt;

use plughost_core::{Capability, InstanceId, InstanceStatus, JobId, PluginName, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A plugin instance changed lifecycle status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    /// Instance that transitioned.
    pub instance: InstanceId,
    /// Distinguishes instances of the same id across same-version reloads.
    pub generation: u64,
    /// Status before the transition; `None` for a freshly created instance.
    pub from: Option<InstanceStatus>,
    /// Status after the transition.
    pub to: InstanceStatus,
    /// When the transition happened.
    pub timestamp: Timestamp,
}

/// A plugin attempted an operation outside its grants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionViolation {
    /// Plugin id (`name@version`).
    pub plugin_id: InstanceId,
    /// Capability the plugin asked for.
    pub capability: Capability,
    /// Target of the denied operation (path, host, topic ...).
    pub target: String,
    /// When the denial happened.
    pub timestamp: Timestamp,
    /// Violations by this plugin inside the policy window, including this one.
    pub violations_in_window: u32,
    /// The kill-switch threshold has been reached.
    pub threshold_exceeded: bool,
}

/// Category of a structured diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Manifest failed schema validation.
    SchemaError,
    /// Manifest failed signature verification.
    SignatureError,
    /// `onLoad` or context startup exceeded the load budget.
    LoadTimeout,
    /// The entry point could not be started or `onLoad` failed.
    StartupError,
    /// The context breached its memory or CPU ceiling.
    ResourceLimitExceeded,
    /// Permission violation threshold reached.
    PermissionViolation,
    /// A handler failed.
    HandlerError,
    /// A job exhausted its retries.
    DeadLettered,
    /// A reload was rejected; the previous version keeps running.
    ReloadConflict,
    /// The execution context exited unexpectedly.
    Crash,
    /// The plugin was permanently disabled.
    Disabled,
}

impl DiagnosticKind {
    /// Snake-case label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SchemaError => "schema_error",
            Self::SignatureError => "signature_error",
            Self::LoadTimeout => "load_timeout",
            Self::StartupError => "startup_error",
            Self::ResourceLimitExceeded => "resource_limit_exceeded",
            Self::PermissionViolation => "permission_violation",
            Self::HandlerError => "handler_error",
            Self::DeadLettered => "dead_lettered",
            Self::ReloadConflict => "reload_conflict",
            Self::Crash => "crash",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured diagnostic accompanying every terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    /// Error kind.
    pub kind: DiagnosticKind,
    /// Plugin name, when known. Schema failures on unreadable names carry
    /// the directory name instead.
    pub plugin: String,
    /// Instance id, when one had been assigned.
    pub instance: Option<InstanceId>,
    /// Human-readable detail.
    pub message: String,
    /// When it happened.
    pub timestamp: Timestamp,
}

impl Diagnostic {
    /// Build a diagnostic stamped with the current time.
    #[must_use]
    pub fn new(
        kind: DiagnosticKind,
        plugin: impl Into<String>,
        instance: Option<InstanceId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            plugin: plugin.into(),
            instance,
            message: message.into(),
            timestamp: Timestamp::now(),
        }
    }
}

/// Outcome of a hot-reload attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReloadOutcome {
    /// The dispatch table now points at the new instance.
    Swapped,
    /// The new version never reached `Loaded`; nothing changed.
    Rejected {
        /// Why the new version was rejected.
        reason: String,
    },
}

/// Record of one hot-reload attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadRecord {
    /// Plugin being reloaded.
    pub plugin: PluginName,
    /// Instance routed before the attempt.
    pub previous: Option<InstanceId>,
    /// Instance that replaced it, on success.
    pub current: Option<InstanceId>,
    /// What happened.
    #[serde(flatten)]
    pub outcome: ReloadOutcome,
    /// When the attempt finished.
    pub timestamp: Timestamp,
}

/// A job exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterNotice {
    /// Job id.
    pub job_id: JobId,
    /// Job type.
    pub job_type: String,
    /// Target plugin.
    pub target_plugin_id: PluginName,
    /// Attempts made.
    pub attempts: u32,
    /// Error from the final attempt.
    pub last_error: String,
    /// When the job was dead-lettered.
    pub timestamp: Timestamp,
}

/// A job reached `Succeeded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFinished {
    /// Job id.
    pub job_id: JobId,
    /// Job type.
    pub job_type: String,
    /// Instance that ran the job.
    pub instance: InstanceId,
    /// Handler return value.
    pub result: Value,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// When the job finished.
    pub timestamp: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_serializes_camel_case() {
        let v = PermissionViolation {
            plugin_id: "fs-reader@1.0.0".parse().unwrap(),
            capability: Capability::FsWrite,
            target: "/etc/hosts".into(),
            timestamp: Timestamp::now(),
            violations_in_window: 1,
            threshold_exceeded: false,
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["pluginId"], "fs-reader@1.0.0");
        assert_eq!(json["capability"], "fs.write");
        assert_eq!(json["target"], "/etc/hosts");
    }

    #[test]
    fn reload_record_flattens_outcome() {
        let record = ReloadRecord {
            plugin: PluginName::new("usb-logger").unwrap(),
            previous: Some("usb-logger@1.0.0".parse().unwrap()),
            current: None,
            outcome: ReloadOutcome::Rejected {
                reason: "signature".into(),
            },
            timestamp: Timestamp::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["reason"], "signature");
    }
}
