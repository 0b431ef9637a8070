//! The sandbox boundary for guest host calls.
//!
//! Every [`HostCall`] a guest issues passes through [`HostBridge::handle`].
//! The enforcer decides first; only an allowed call reaches the
//! [`HostServices`] that actually touch files, sockets, devices or queues.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plughost_core::{HostCall, HostCallResult, InstanceId};
use plughost_devices::DeviceDirectory;
use plughost_permissions::{Decision, GrantSet, PermissionEnforcer, resolve_physical};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Largest file a guest may read or write through the host (4 MiB).
const MAX_FILE_BYTES: u64 = 4 * 1024 * 1024;

/// Largest network response returned to a guest (64 KiB).
const MAX_RESPONSE_BYTES: u64 = 64 * 1024;

/// Default timeout for host network operations.
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Performs host calls that the enforcer already allowed.
#[async_trait]
pub trait HostServices: Send + Sync {
    /// Run `call` on behalf of `instance`.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure, reported to the guest as
    /// [`HostCallResult::Failed`].
    async fn perform(&self, instance: &InstanceId, call: HostCall) -> Result<Value, String>;
}

/// A queue message published by a guest.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    /// Topic.
    pub topic: String,
    /// Body.
    pub message: Value,
    /// Publishing instance.
    pub from: InstanceId,
}

/// Host services backed by the local filesystem, TCP, the device directory
/// and the job dispatcher's queue.
#[derive(Debug, Clone)]
pub struct DefaultHostServices {
    devices: DeviceDirectory,
    queue: mpsc::UnboundedSender<QueueMessage>,
    io_timeout: Duration,
}

impl DefaultHostServices {
    /// Create services that look devices up in `devices` and forward queue
    /// publishes to `queue`.
    #[must_use]
    pub fn new(devices: DeviceDirectory, queue: mpsc::UnboundedSender<QueueMessage>) -> Self {
        Self {
            devices,
            queue,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Bound network operations by `timeout`.
    #[must_use]
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    async fn fs_read(path: &str) -> Result<Value, String> {
        let file = no_follow()
            .read(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;
        let meta = file.metadata().await.map_err(|e| e.to_string())?;
        if meta.len() > MAX_FILE_BYTES {
            return Err(format!("file is larger than {MAX_FILE_BYTES} bytes"));
        }
        let mut contents = String::new();
        file.take(MAX_FILE_BYTES)
            .read_to_string(&mut contents)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "contents": contents }))
    }

    async fn fs_write(path: &str, contents: &str) -> Result<Value, String> {
        let len = contents.len();
        if u64::try_from(len).map_or(true, |n| n > MAX_FILE_BYTES) {
            return Err(format!("contents exceed {MAX_FILE_BYTES} bytes"));
        }
        let mut file = no_follow()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(json!({ "written": len }))
    }

    async fn net_connect(&self, host: &str, port: u16, send: Option<String>) -> Result<Value, String> {
        let exchange = async {
            let mut stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| e.to_string())?;
            if let Some(request) = send {
                stream
                    .write_all(request.as_bytes())
                    .await
                    .map_err(|e| e.to_string())?;
                stream.shutdown().await.map_err(|e| e.to_string())?;
            }
            let mut response = Vec::new();
            stream
                .take(MAX_RESPONSE_BYTES)
                .read_to_end(&mut response)
                .await
                .map_err(|e| e.to_string())?;
            Ok::<_, String>(String::from_utf8_lossy(&response).into_owned())
        };
        let response = tokio::time::timeout(self.io_timeout, exchange)
            .await
            .map_err(|_| format!("connection to {host}:{port} timed out"))??;
        Ok(json!({ "response": response }))
    }

    async fn net_accept(&self, interface: &str, port: u16) -> Result<Value, String> {
        let listener = TcpListener::bind((interface, port))
            .await
            .map_err(|e| e.to_string())?;
        let exchange = async {
            let (stream, peer) = listener.accept().await.map_err(|e| e.to_string())?;
            let mut received = Vec::new();
            stream
                .take(MAX_RESPONSE_BYTES)
                .read_to_end(&mut received)
                .await
                .map_err(|e| e.to_string())?;
            Ok::<_, String>(json!({
                "peer": peer.to_string(),
                "received": String::from_utf8_lossy(&received),
            }))
        };
        tokio::time::timeout(self.io_timeout, exchange)
            .await
            .map_err(|_| format!("no connection on {interface}:{port} in time"))?
    }
}

#[async_trait]
impl HostServices for DefaultHostServices {
    async fn perform(&self, instance: &InstanceId, call: HostCall) -> Result<Value, String> {
        match call {
            HostCall::FsRead { path } => Self::fs_read(&path).await,
            HostCall::FsWrite { path, contents } => Self::fs_write(&path, &contents).await,
            HostCall::NetConnect { host, port, send } => self.net_connect(&host, port, send).await,
            HostCall::NetAccept { interface, port } => self.net_accept(&interface, port).await,
            HostCall::DeviceOpen { subject_id } => match self.devices.get(&subject_id) {
                Some(attributes) => Ok(json!({
                    "subjectId": subject_id,
                    "attributes": attributes,
                })),
                None => Err(format!("device {subject_id} is not attached")),
            },
            HostCall::QueuePublish { topic, message } => {
                self.queue
                    .send(QueueMessage {
                        topic: topic.clone(),
                        message,
                        from: instance.clone(),
                    })
                    .map_err(|_| "queue is closed".to_string())?;
                Ok(json!({ "topic": topic }))
            },
        }
    }
}

/// Open options that refuse a symlink in the final path component.
fn no_follow() -> tokio::fs::OpenOptions {
    let mut options = tokio::fs::OpenOptions::new();
    #[cfg(unix)]
    options.custom_flags(nix::libc::O_NOFOLLOW);
    options
}

/// Rewrite filesystem calls to the physical path they would touch, so the
/// grant check and the IO see the same file. Paths that cannot be resolved
/// are left as written and fail the check.
fn resolve_fs_target(call: HostCall) -> HostCall {
    let resolve = |path: String| match resolve_physical(&path) {
        Some(physical) => physical.display().to_string(),
        None => path,
    };
    match call {
        HostCall::FsRead { path } => HostCall::FsRead {
            path: resolve(path),
        },
        HostCall::FsWrite { path, contents } => HostCall::FsWrite {
            path: resolve(path),
            contents,
        },
        other => other,
    }
}

/// Per-instance gate between a guest and the host services.
pub struct HostBridge {
    instance: InstanceId,
    grants: Arc<GrantSet>,
    enforcer: Arc<PermissionEnforcer>,
    services: Arc<dyn HostServices>,
    kill_switch: mpsc::UnboundedSender<InstanceId>,
}

impl HostBridge {
    /// Create the bridge for `instance`.
    ///
    /// `kill_switch` receives the instance id when a denial crosses the
    /// violation threshold.
    #[must_use]
    pub fn new(
        instance: InstanceId,
        grants: Arc<GrantSet>,
        enforcer: Arc<PermissionEnforcer>,
        services: Arc<dyn HostServices>,
        kill_switch: mpsc::UnboundedSender<InstanceId>,
    ) -> Self {
        Self {
            instance,
            grants,
            enforcer,
            services,
            kill_switch,
        }
    }

    /// Check `call` against the grants and perform it when allowed.
    ///
    /// Filesystem paths are checked after symlink resolution.
    pub async fn handle(&self, call: HostCall) -> HostCallResult {
        let call = resolve_fs_target(call);
        let capability = call.capability();
        let target = call.target();
        match self
            .enforcer
            .check(&self.instance, &self.grants, capability, &target)
        {
            Decision::Deny { violation } => {
                if violation.threshold_exceeded {
                    warn!(instance = %self.instance, "violation threshold exceeded");
                    let _ = self.kill_switch.send(self.instance.clone());
                }
                HostCallResult::Denied { capability, target }
            },
            Decision::Allow => match self.services.perform(&self.instance, call).await {
                Ok(value) => HostCallResult::Ok { value },
                Err(message) => {
                    debug!(instance = %self.instance, %capability, %target, %message, "host call failed");
                    HostCallResult::Failed { message }
                },
            },
        }
    }
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use plughost_core::Capability;
    use plughost_devices::DeviceAttributes;
    use plughost_events::Channel;
    use plughost_manifest::Manifest;
    use plughost_permissions::ViolationPolicy;

    use super::*;

    fn manifest(dir: &std::path::Path) -> Manifest {
        toml::from_str(&format!(
            r#"
            name = "bridge"
            version = "1.0.0"
            entryPoint = "main.native"

            [permissions]
            filesystem = [{{ path = "{}", mode = "readwrite" }}]
            queue = [{{ topic = "alerts", mode = "publish" }}]

            [permissions.device]
            vendorIds = ["0x1234"]

            [isolationLimits]
            maxHeapMb = 64
            "#,
            dir.display()
        ))
        .unwrap()
    }

    struct Fixture {
        bridge: HostBridge,
        queue: mpsc::UnboundedReceiver<QueueMessage>,
        kills: mpsc::UnboundedReceiver<InstanceId>,
        violations: plughost_events::Subscription<plughost_events::PermissionViolation>,
        devices: DeviceDirectory,
    }

    fn fixture(dir: &std::path::Path, policy: ViolationPolicy) -> Fixture {
        let manifest = manifest(dir);
        let grants = Arc::new(GrantSet::from_manifest(&manifest).unwrap());
        let channel = Channel::new("violations");
        let violations = channel.subscribe();
        let enforcer = Arc::new(PermissionEnforcer::new(policy, channel, 16));
        let devices = DeviceDirectory::new();
        let (queue_tx, queue) = mpsc::unbounded_channel();
        let (kill_tx, kills) = mpsc::unbounded_channel();
        let services = Arc::new(DefaultHostServices::new(devices.clone(), queue_tx));
        Fixture {
            bridge: HostBridge::new(manifest.instance_id(), grants, enforcer, services, kill_tx),
            queue,
            kills,
            violations,
            devices,
        }
    }

    #[tokio::test]
    async fn allowed_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), ViolationPolicy::default());
        let path = dir.path().join("out.txt").display().to_string();

        let wrote = f
            .bridge
            .handle(HostCall::FsWrite {
                path: path.clone(),
                contents: "data".into(),
            })
            .await;
        assert!(matches!(wrote, HostCallResult::Ok { .. }));

        let read = f.bridge.handle(HostCall::FsRead { path }).await;
        assert_eq!(
            read,
            HostCallResult::Ok {
                value: json!({"contents": "data"})
            }
        );
    }

    #[tokio::test]
    async fn denied_write_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fixture(dir.path(), ViolationPolicy::default());
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("passwd");

        let result = f
            .bridge
            .handle(HostCall::FsWrite {
                path: target.display().to_string(),
                contents: "root".into(),
            })
            .await;
        assert!(matches!(
            result,
            HostCallResult::Denied {
                capability: Capability::FsWrite,
                ..
            }
        ));
        assert!(!target.exists());
        assert_eq!(f.violations.drain().len(), 1);
        assert!(f.kills.try_recv().is_err());
    }

    #[tokio::test]
    async fn symlinked_target_outside_grant_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fixture(dir.path(), ViolationPolicy::default());
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        std::fs::write(outside.path().join("secret"), "hidden").unwrap();

        let wrote = f
            .bridge
            .handle(HostCall::FsWrite {
                path: dir.path().join("link/escaped.txt").display().to_string(),
                contents: "pwned".into(),
            })
            .await;
        assert!(matches!(
            wrote,
            HostCallResult::Denied {
                capability: Capability::FsWrite,
                ..
            }
        ));
        assert!(!outside.path().join("escaped.txt").exists());

        let read = f
            .bridge
            .handle(HostCall::FsRead {
                path: dir.path().join("link/secret").display().to_string(),
            })
            .await;
        assert!(matches!(
            read,
            HostCallResult::Denied {
                capability: Capability::FsRead,
                ..
            }
        ));
        assert_eq!(f.violations.drain().len(), 2);
    }

    #[tokio::test]
    async fn symlink_inside_grant_still_works() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), ViolationPolicy::default());
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();

        let wrote = f
            .bridge
            .handle(HostCall::FsWrite {
                path: dir.path().join("alias/ok.txt").display().to_string(),
                contents: "fine".into(),
            })
            .await;
        assert!(matches!(wrote, HostCallResult::Ok { .. }));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("real/ok.txt")).unwrap(),
            "fine"
        );
    }

    #[tokio::test]
    async fn threshold_trips_kill_switch() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fixture(
            dir.path(),
            ViolationPolicy::new(2, Duration::from_secs(60)),
        );
        for _ in 0..2 {
            f.bridge
                .handle(HostCall::NetConnect {
                    host: "example.com".into(),
                    port: 80,
                    send: None,
                })
                .await;
        }
        assert_eq!(f.kills.try_recv().unwrap().name().as_str(), "bridge");
    }

    #[tokio::test]
    async fn device_lookup_and_queue_publish() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fixture(dir.path(), ViolationPolicy::default());
        f.devices.insert(
            "usb:1234:0001:001:002",
            DeviceAttributes {
                vendor_id: Some(0x1234),
                ..Default::default()
            },
        );

        let opened = f
            .bridge
            .handle(HostCall::DeviceOpen {
                subject_id: "usb:1234:0001:001:002".into(),
            })
            .await;
        assert!(matches!(opened, HostCallResult::Ok { .. }));

        let published = f
            .bridge
            .handle(HostCall::QueuePublish {
                topic: "alerts".into(),
                message: json!({"level": "high"}),
            })
            .await;
        assert!(matches!(published, HostCallResult::Ok { .. }));
        let msg = f.queue.try_recv().unwrap();
        assert_eq!(msg.topic, "alerts");
        assert_eq!(msg.from.name().as_str(), "bridge");
    }
}
