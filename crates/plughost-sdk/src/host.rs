//! Host operations available to a running handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use plughost_core::{GuestMessage, HostCall, HostCallResult, LogLevel};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{SdkError, SdkResult};

type Pending = HashMap<u64, oneshot::Sender<HostCallResult>>;

/// Sends [`HostCall`]s to the host and awaits the replies.
///
/// Cloning shares the connection.
#[derive(Debug, Clone)]
pub struct HostApi {
    outbox: mpsc::UnboundedSender<GuestMessage>,
    pending: Arc<Mutex<Pending>>,
    next_request: Arc<AtomicU64>,
}

impl HostApi {
    pub(crate) fn new(outbox: mpsc::UnboundedSender<GuestMessage>) -> Self {
        Self {
            outbox,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Issue a raw host call.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Denied`] when the instance lacks the grant,
    /// [`SdkError::Failed`] when the operation failed on the host, and
    /// [`SdkError::Disconnected`] when the host went away.
    pub async fn call(&self, call: HostCall) -> SdkResult<Value> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(request_id, tx);

        if self
            .outbox
            .send(GuestMessage::HostCall { request_id, call })
            .is_err()
        {
            self.lock().remove(&request_id);
            return Err(SdkError::Disconnected);
        }

        match rx.await.map_err(|_| SdkError::Disconnected)? {
            HostCallResult::Ok { value } => Ok(value),
            HostCallResult::Denied { capability, target } => {
                Err(SdkError::Denied { capability, target })
            },
            HostCallResult::Failed { message } => Err(SdkError::Failed(message)),
        }
    }

    /// Read a UTF-8 file.
    ///
    /// # Errors
    ///
    /// See [`HostApi::call`].
    pub async fn read_file(&self, path: impl Into<String>) -> SdkResult<String> {
        let value = self.call(HostCall::FsRead { path: path.into() }).await?;
        string_field(&value, "contents")
    }

    /// Create or overwrite a file.
    ///
    /// # Errors
    ///
    /// See [`HostApi::call`].
    pub async fn write_file(
        &self,
        path: impl Into<String>,
        contents: impl Into<String>,
    ) -> SdkResult<()> {
        self.call(HostCall::FsWrite {
            path: path.into(),
            contents: contents.into(),
        })
        .await
        .map(|_| ())
    }

    /// Connect to `host:port`, optionally send `request`, and return the
    /// response text.
    ///
    /// # Errors
    ///
    /// See [`HostApi::call`].
    pub async fn connect(
        &self,
        host: impl Into<String>,
        port: u16,
        request: Option<String>,
    ) -> SdkResult<String> {
        let value = self
            .call(HostCall::NetConnect {
                host: host.into(),
                port,
                send: request,
            })
            .await?;
        string_field(&value, "response")
    }

    /// Accept one inbound connection on `interface:port`.
    ///
    /// # Errors
    ///
    /// See [`HostApi::call`].
    pub async fn accept(&self, interface: impl Into<String>, port: u16) -> SdkResult<Value> {
        self.call(HostCall::NetAccept {
            interface: interface.into(),
            port,
        })
        .await
    }

    /// Look up an attached device.
    ///
    /// # Errors
    ///
    /// See [`HostApi::call`].
    pub async fn open_device(&self, subject_id: impl Into<String>) -> SdkResult<Value> {
        self.call(HostCall::DeviceOpen {
            subject_id: subject_id.into(),
        })
        .await
    }

    /// Publish `message` on `topic`.
    ///
    /// # Errors
    ///
    /// See [`HostApi::call`].
    pub async fn publish(&self, topic: impl Into<String>, message: Value) -> SdkResult<()> {
        self.call(HostCall::QueuePublish {
            topic: topic.into(),
            message,
        })
        .await
        .map(|_| ())
    }

    /// Send a log line to the host. Dropped if the host is gone.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.outbox.send(GuestMessage::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn resolve(&self, request_id: u64, result: HostCallResult) {
        match self.lock().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(result);
            },
            None => tracing::debug!(request_id, "reply for unknown host call"),
        }
    }

    /// Fail every outstanding call with [`SdkError::Disconnected`].
    pub(crate) fn disconnect(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| {
            tracing::warn!("host call table lock poisoned, recovering");
            e.into_inner()
        })
    }
}

fn string_field(value: &Value, field: &str) -> SdkResult<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SdkError::UnexpectedReply(format!("missing `{field}`")))
}

#[cfg(test)]
mod tests {
    use plughost_core::Capability;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn replies_resolve_calls() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = HostApi::new(tx);

        let caller = host.clone();
        let read = tokio::spawn(async move { caller.read_file("/tmp/a").await });

        let Some(GuestMessage::HostCall { request_id, call }) = rx.recv().await else {
            panic!("expected a host call");
        };
        assert_eq!(call, HostCall::FsRead { path: "/tmp/a".into() });
        host.resolve(
            request_id,
            HostCallResult::Ok {
                value: json!({"contents": "hi"}),
            },
        );
        assert_eq!(read.await.unwrap().unwrap(), "hi");
    }

    #[tokio::test]
    async fn denial_maps_to_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = HostApi::new(tx);

        let caller = host.clone();
        let write = tokio::spawn(async move { caller.write_file("/etc/passwd", "x").await });
        let Some(GuestMessage::HostCall { request_id, .. }) = rx.recv().await else {
            panic!("expected a host call");
        };
        host.resolve(
            request_id,
            HostCallResult::Denied {
                capability: Capability::FsWrite,
                target: "/etc/passwd".into(),
            },
        );
        let err = write.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SdkError::Denied {
                capability: Capability::FsWrite,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn disconnect_fails_outstanding_calls() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = HostApi::new(tx);
        let caller = host.clone();
        let open = tokio::spawn(async move { caller.open_device("usb:1:2:001:001").await });
        rx.recv().await.unwrap();
        host.disconnect();
        assert!(matches!(
            open.await.unwrap().unwrap_err(),
            SdkError::Disconnected
        ));
    }

    #[tokio::test]
    async fn closed_outbox_is_disconnected() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let host = HostApi::new(tx);
        assert!(matches!(
            host.publish("t", json!(1)).await.unwrap_err(),
            SdkError::Disconnected
        ));
    }
}
