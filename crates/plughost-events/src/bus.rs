//! The set of channels a runtime publishes on.

use crate::channel::{Channel, Subscription};
use crate::event::{
    DeadLetterNotice, Diagnostic, JobFinished, LifecycleEvent, PermissionViolation, ReloadRecord,
};

/// One typed channel per notification kind.
///
/// Cloning is cheap and every clone publishes into the same channels.
#[derive(Debug, Clone)]
pub struct RuntimeBus {
    /// Instance lifecycle transitions.
    pub lifecycle: Channel<LifecycleEvent>,
    /// Denied capability checks.
    pub violations: Channel<PermissionViolation>,
    /// Structured diagnostics for terminal failures.
    pub diagnostics: Channel<Diagnostic>,
    /// Hot-reload attempts.
    pub reloads: Channel<ReloadRecord>,
    /// Jobs that exhausted their retries.
    pub dead_letters: Channel<DeadLetterNotice>,
    /// Jobs that succeeded.
    pub jobs: Channel<JobFinished>,
}

impl RuntimeBus {
    /// Create a bus with default channel capacities.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lifecycle: Channel::new("lifecycle"),
            violations: Channel::new("violations"),
            diagnostics: Channel::new("diagnostics"),
            reloads: Channel::new("reloads"),
            dead_letters: Channel::new("dead_letters"),
            jobs: Channel::new("jobs"),
        }
    }

    /// Publish a diagnostic and mirror it into the log.
    pub fn diagnose(&self, diagnostic: Diagnostic) {
        tracing::warn!(
            kind = %diagnostic.kind,
            plugin = %diagnostic.plugin,
            instance = ?diagnostic.instance.as_ref().map(ToString::to_string),
            "{}",
            diagnostic.message
        );
        self.diagnostics.publish(diagnostic);
    }

    /// Subscribe to lifecycle transitions.
    #[must_use]
    pub fn subscribe_lifecycle(&self) -> Subscription<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Subscribe to permission violations.
    #[must_use]
    pub fn subscribe_violations(&self) -> Subscription<PermissionViolation> {
        self.violations.subscribe()
    }

    /// Subscribe to diagnostics.
    #[must_use]
    pub fn subscribe_diagnostics(&self) -> Subscription<Diagnostic> {
        self.diagnostics.subscribe()
    }
}

impl Default for RuntimeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DiagnosticKind;

    #[tokio::test]
    async fn clones_share_channels() {
        let bus = RuntimeBus::new();
        let mut diagnostics = bus.subscribe_diagnostics();
        let clone = bus.clone();
        clone.diagnose(Diagnostic::new(
            DiagnosticKind::Crash,
            "usb-logger",
            None,
            "context exited",
        ));
        let got = diagnostics.recv().await.unwrap();
        assert_eq!(got.kind, DiagnosticKind::Crash);
        assert_eq!(got.plugin, "usb-logger");
    }
}
