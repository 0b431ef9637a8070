//! Scripted guests for the thread backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use plughost_sdk::{Guest, HookContext, Invocation};
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::probe::SideEffectProbe;

/// What a handler does when invoked.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Return the payload.
    Echo,
    /// Return this value.
    Reply(Value),
    /// Fail with this message.
    Fail(String),
    /// Fail the first `n` calls, then echo.
    FailFirst(u32),
    /// Sleep, then echo. Stops early if cancelled.
    Delay(Duration),
    /// Run until cancelled.
    Hang,
    /// Panic inside the handler.
    Panic,
    /// Read a file through the host and return its contents.
    ReadFile(String),
    /// Write a file through the host.
    WriteFile {
        /// Target path.
        path: String,
        /// Contents to write.
        contents: String,
    },
    /// Publish a message through the host.
    Publish {
        /// Topic.
        topic: String,
        /// Message body.
        message: Value,
    },
}

/// A guest that records every invocation and acts per handler.
///
/// Handlers without a registered [`Behavior`] echo their payload. Cloning
/// shares the recorded calls.
#[derive(Debug, Clone)]
pub struct RecordingGuest {
    label: String,
    behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
    calls: Arc<Mutex<Vec<Invocation>>>,
    failures: Arc<Mutex<HashMap<String, u32>>>,
    probe: Option<SideEffectProbe>,
    changed: Arc<Notify>,
}

impl Default for RecordingGuest {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingGuest {
    /// Create a guest that echoes everything.
    #[must_use]
    pub fn new() -> Self {
        Self::labelled("guest")
    }

    /// Create a guest whose probe records carry `label`.
    #[must_use]
    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            behaviors: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            probe: None,
            changed: Arc::new(Notify::new()),
        }
    }

    /// Report running and completed handlers to `probe`.
    #[must_use]
    pub fn with_probe(mut self, probe: SideEffectProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Set the behavior of `handler`.
    #[must_use]
    pub fn on(self, handler: &str, behavior: Behavior) -> Self {
        self.set(handler, behavior);
        self
    }

    /// Change the behavior of `handler` on a live guest.
    pub fn set(&self, handler: &str, behavior: Behavior) {
        lock(&self.behaviors).insert(handler.to_string(), behavior);
    }

    /// The label given at construction.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Every invocation so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<Invocation> {
        lock(&self.calls).clone()
    }

    /// Invocations of `handler`.
    #[must_use]
    pub fn calls_for(&self, handler: &str) -> Vec<Invocation> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.handler == handler)
            .cloned()
            .collect()
    }

    /// Number of invocations of `handler`.
    #[must_use]
    pub fn call_count(&self, handler: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.handler == handler)
            .count()
    }

    /// Wait until `handler` has been invoked at least `n` times.
    pub async fn wait_for_calls(&self, handler: &str, n: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                if self.call_count(handler) >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn behavior(&self, handler: &str) -> Behavior {
        lock(&self.behaviors)
            .get(handler)
            .cloned()
            .unwrap_or(Behavior::Echo)
    }

    async fn act(&self, call: &Invocation, ctx: &HookContext) -> Result<Value, String> {
        match self.behavior(&call.handler) {
            Behavior::Echo => Ok(call.payload.clone()),
            Behavior::Reply(value) => Ok(value),
            Behavior::Fail(message) => Err(message),
            Behavior::FailFirst(n) => {
                let mut failures = lock(&self.failures);
                let seen = failures.entry(call.handler.clone()).or_insert(0);
                if *seen < n {
                    *seen = seen.saturating_add(1);
                    Err(format!("scripted failure {seen} of {n}"))
                } else {
                    Ok(call.payload.clone())
                }
            },
            Behavior::Delay(delay) => {
                tokio::select! {
                    () = ctx.cancelled() => Err("cancelled".to_string()),
                    () = tokio::time::sleep(delay) => Ok(call.payload.clone()),
                }
            },
            Behavior::Hang => {
                ctx.cancelled().await;
                Err("cancelled".to_string())
            },
            Behavior::Panic => panic!("scripted panic in {}", call.handler),
            Behavior::ReadFile(path) => ctx
                .host()
                .read_file(path)
                .await
                .map(|contents| json!({ "contents": contents }))
                .map_err(|e| e.to_string()),
            Behavior::WriteFile { path, contents } => ctx
                .host()
                .write_file(path, contents)
                .await
                .map(|()| json!({ "written": true }))
                .map_err(|e| e.to_string()),
            Behavior::Publish { topic, message } => ctx
                .host()
                .publish(topic, message)
                .await
                .map(|()| json!({ "published": true }))
                .map_err(|e| e.to_string()),
        }
    }
}

#[async_trait]
impl Guest for RecordingGuest {
    async fn on_invoke(&self, call: Invocation, ctx: HookContext) -> Result<Value, String> {
        lock(&self.calls).push(call.clone());
        self.changed.notify_waiters();

        let _active = self.probe.as_ref().map(SideEffectProbe::enter);
        let result = self.act(&call, &ctx).await;
        if result.is_ok()
            && let Some(probe) = &self.probe
        {
            probe.record(&self.label, &call.handler, call.payload.clone());
        }
        result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| {
        tracing::warn!("recording guest lock poisoned, recovering");
        e.into_inner()
    })
}
