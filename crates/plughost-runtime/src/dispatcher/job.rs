//! Job records.

use plughost_core::{HookKind, InstanceId, JobId, PluginName, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a job is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting for admission or a retry.
    Pending,
    /// Admitted to an instance.
    Running,
    /// The last attempt failed; a retry is scheduled.
    Failed,
    /// Done.
    Succeeded,
    /// Out of attempts.
    DeadLettered,
}

impl JobState {
    /// Whether the job will not run again without an explicit requeue.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered)
    }
}

/// The event a job was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRef {
    /// Event log stream.
    pub stream: String,
    /// Event id within the stream.
    pub event_id: u64,
}

/// A unit of work for one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique id; deterministic for event-derived jobs.
    pub id: JobId,
    /// Job type, e.g. `device.attach` or `queue.alerts`.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Plugin the job is for.
    pub target_plugin_id: PluginName,
    /// Hook invoked.
    pub hook: HookKind,
    /// Handler input.
    pub payload: Value,
    /// Attempts started so far.
    pub attempts: u32,
    /// Current state.
    pub state: JobState,
    /// When the next attempt may start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<Timestamp>,
    /// Error from the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Handler return value on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Instance that ran the most recent attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceId>,
    /// Originating event, for event-derived jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EventRef>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last state change.
    pub updated_at: Timestamp,
}

impl Job {
    /// A fresh pending job.
    #[must_use]
    pub fn new(
        id: JobId,
        job_type: impl Into<String>,
        target: PluginName,
        hook: HookKind,
        payload: Value,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            job_type: job_type.into(),
            target_plugin_id: target,
            hook,
            payload,
            attempts: 0,
            state: JobState::Pending,
            next_retry_at: None,
            last_error: None,
            result: None,
            instance: None,
            source: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach the originating event.
    #[must_use]
    pub fn with_source(mut self, stream: impl Into<String>, event_id: u64) -> Self {
        self.source = Some(EventRef {
            stream: stream.into(),
            event_id,
        });
        self
    }

    /// What the handler receives: the payload wrapped with job metadata.
    #[must_use]
    pub fn envelope(&self) -> Value {
        serde_json::json!({
            "jobId": self.id,
            "type": self.job_type,
            "attempt": self.attempts,
            "payload": self.payload,
        })
    }

    pub(crate) fn set_state(&mut self, state: JobState) {
        self.state = state;
        self.updated_at = Timestamp::now();
    }
}

/// An externally submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    /// Job type label.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Target plugin; must declare `onJobReceived`.
    pub target: PluginName,
    /// Handler input.
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_wire_shape() {
        let job = Job::new(
            JobId::new(),
            "device.attach",
            PluginName::new("usb-logger").unwrap(),
            HookKind::OnDeviceAttached,
            serde_json::json!({"subjectId": "usb:1234:5678:001:004"}),
        )
        .with_source("devices", 3);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "device.attach");
        assert_eq!(value["targetPluginId"], "usb-logger");
        assert_eq!(value["state"], "pending");
        assert_eq!(value["attempts"], 0);
        assert_eq!(value["source"]["eventId"], 3);
        assert!(value.get("lastError").is_none());

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn envelope_carries_attempt() {
        let mut job = Job::new(
            JobId::new(),
            "custom",
            PluginName::new("worker").unwrap(),
            HookKind::OnJobReceived,
            serde_json::json!(42),
        );
        job.attempts = 2;
        let envelope = job.envelope();
        assert_eq!(envelope["attempt"], 2);
        assert_eq!(envelope["payload"], 42);
        assert_eq!(envelope["type"], "custom");
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::DeadLettered.is_terminal());
        assert!(!JobState::Failed.is_terminal());
    }
}
