//! Host side of one context's message channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use plughost_core::{
    GuestMessage, HandlerOutcome, HookKind, HostMessage, InstanceId, LogLevel, PROTOCOL_VERSION,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ContextChannels, ContextExit, ContextHandle};
use crate::bridge::HostBridge;
use crate::error::{RuntimeError, RuntimeResult};

/// How long a timed-out call may take to acknowledge its cancellation.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// How long to wait for the exit status of a context that just went away.
const EXIT_SETTLE: Duration = Duration::from_millis(250);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<HandlerOutcome>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Waiting,
    Ready,
    Mismatch(u32),
}

/// Correlates invocations with results and serves guest host calls.
pub struct Session {
    instance: InstanceId,
    outbound: mpsc::UnboundedSender<HostMessage>,
    pending: Pending,
    next_call: AtomicU64,
    ready: watch::Receiver<Readiness>,
    closed: CancellationToken,
    handle: Box<dyn ContextHandle>,
}

impl Session {
    /// Take over a launched context and start reading its messages.
    #[must_use]
    pub fn start(instance: InstanceId, channels: ContextChannels, bridge: Arc<HostBridge>) -> Self {
        let ContextChannels {
            outbound,
            inbound,
            handle,
        } = channels;
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (ready_tx, ready) = watch::channel(Readiness::Waiting);
        let closed = CancellationToken::new();

        tokio::spawn(read_loop(
            instance.clone(),
            inbound,
            outbound.clone(),
            Arc::clone(&pending),
            ready_tx,
            bridge,
            closed.clone(),
        ));

        Self {
            instance,
            outbound,
            pending,
            next_call: AtomicU64::new(1),
            ready,
            closed,
            handle,
        }
    }

    /// Wait for the guest's ready announcement.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Startup`] on a protocol version mismatch and
    /// [`RuntimeError::ContextClosed`] if the context exits first.
    pub async fn wait_ready(&self) -> RuntimeResult<()> {
        let mut ready = self.ready.clone();
        let state = tokio::select! {
            () = self.closed.cancelled() => {
                return Err(RuntimeError::ContextClosed(
                    "context exited before announcing readiness".to_string(),
                ));
            },
            state = ready.wait_for(|s| *s != Readiness::Waiting) => {
                state.map(|s| *s).map_err(|_| RuntimeError::ContextClosed("session dropped".to_string()))?
            },
        };
        match state {
            Readiness::Mismatch(version) => Err(RuntimeError::Startup(format!(
                "guest speaks protocol {version}, host speaks {PROTOCOL_VERSION}"
            ))),
            _ => Ok(()),
        }
    }

    /// Invoke `handler` for `hook` and wait up to `timeout` for its outcome.
    ///
    /// On timeout the guest is asked to cancel the call and given a short
    /// grace period to acknowledge.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Timeout`] if no outcome arrived in time,
    /// [`RuntimeError::ResourceLimitExceeded`] if the context was killed for
    /// a limit breach, and [`RuntimeError::ContextClosed`] if it went away
    /// otherwise.
    pub async fn invoke(
        &self,
        hook: HookKind,
        handler: &str,
        payload: Value,
        timeout: Duration,
    ) -> RuntimeResult<HandlerOutcome> {
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        lock(&self.pending).insert(call_id, tx);

        let sent = self.outbound.send(HostMessage::Invoke {
            call_id,
            hook,
            handler: handler.to_string(),
            payload,
        });
        if sent.is_err() || self.closed.is_cancelled() {
            lock(&self.pending).remove(&call_id);
            return Err(self.closed_error());
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(self.exit_error().await),
            Err(_) => {
                debug!(instance = %self.instance, call_id, "call timed out, cancelling");
                let _ = self.outbound.send(HostMessage::Cancel { call_id });
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut rx).await;
                lock(&self.pending).remove(&call_id);
                Err(RuntimeError::Timeout(timeout))
            },
        }
    }

    /// Ask the guest to cancel every outstanding call.
    pub fn cancel_all(&self) {
        let ids: Vec<u64> = lock(&self.pending).keys().copied().collect();
        for call_id in ids {
            let _ = self.outbound.send(HostMessage::Cancel { call_id });
        }
    }

    /// Number of calls awaiting an outcome.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Becomes `Some` once the context has exited.
    #[must_use]
    pub fn exit_signal(&self) -> watch::Receiver<Option<ContextExit>> {
        self.handle.exit_signal()
    }

    /// Whether the guest side has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// OS process id of the context, if any.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    /// Stop the context, forcibly after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.handle.terminate(grace).await;
        self.closed.cancel();
        lock(&self.pending).clear();
    }

    fn closed_error(&self) -> RuntimeError {
        RuntimeError::ContextClosed(format!("{} is no longer running", self.instance))
    }

    /// Why an in-flight call lost its context. The exit status can trail the
    /// closed channel slightly, so it gets a moment to arrive.
    async fn exit_error(&self) -> RuntimeError {
        let mut exit = self.handle.exit_signal();
        let _ = tokio::time::timeout(EXIT_SETTLE, exit.wait_for(Option::is_some)).await;
        let limit = match &*exit.borrow() {
            Some(ContextExit::LimitExceeded(message)) => Some(message.clone()),
            _ => None,
        };
        match limit {
            Some(message) => RuntimeError::ResourceLimitExceeded {
                instance: self.instance.clone(),
                message,
            },
            None => self.closed_error(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("instance", &self.instance)
            .field("outstanding", &self.outstanding())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn read_loop(
    instance: InstanceId,
    mut inbound: mpsc::UnboundedReceiver<GuestMessage>,
    outbound: mpsc::UnboundedSender<HostMessage>,
    pending: Pending,
    ready: watch::Sender<Readiness>,
    bridge: Arc<HostBridge>,
    closed: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = closed.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match message {
            GuestMessage::Ready { protocol } => {
                let state = if protocol == PROTOCOL_VERSION {
                    Readiness::Ready
                } else {
                    Readiness::Mismatch(protocol)
                };
                let _ = ready.send(state);
            },
            GuestMessage::Result { call_id, outcome } => match lock(&pending).remove(&call_id) {
                Some(tx) => {
                    let _ = tx.send(outcome);
                },
                None => debug!(instance = %instance, call_id, "late result for abandoned call"),
            },
            GuestMessage::HostCall { request_id, call } => {
                let bridge = Arc::clone(&bridge);
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let result = bridge.handle(call).await;
                    let _ = outbound.send(HostMessage::HostReply { request_id, result });
                });
            },
            GuestMessage::Log { level, message } => emit_guest_log(&instance, level, &message),
        }
    }
    closed.cancel();
    // Dropping the senders wakes every waiting invocation.
    lock(&pending).clear();
    debug!(instance = %instance, "session reader stopped");
}

fn emit_guest_log(instance: &InstanceId, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!(target: "plughost::plugin", instance = %instance, "{message}"),
        LogLevel::Info => info!(target: "plughost::plugin", instance = %instance, "{message}"),
        LogLevel::Warn => warn!(target: "plughost::plugin", instance = %instance, "{message}"),
        LogLevel::Error => error!(target: "plughost::plugin", instance = %instance, "{message}"),
    }
}

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<HandlerOutcome>>> {
    pending.lock().unwrap_or_else(|e| {
        tracing::warn!("session call table lock poisoned, recovering");
        e.into_inner()
    })
}
