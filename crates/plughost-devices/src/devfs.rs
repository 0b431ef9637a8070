//! Callback-driven hotplug notices from `/dev/bus/usb`.
//!
//! udev creates `/dev/bus/usb/BBB/DDD` when a device appears and removes it
//! when the device goes away. Watching that tree with `notify` gives attach
//! and detach notifications without linking against libudev.

use std::path::{Component, Path, PathBuf};

use notify::{Event, EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{DeviceError, DeviceResult};

/// Default device node tree.
pub const DEVFS_USB_ROOT: &str = "/dev/bus/usb";

/// Whether a device node appeared or disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    /// Node created.
    Added,
    /// Node removed.
    Removed,
}

/// One platform notification, keyed by physical `bus/address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugNotice {
    /// What happened.
    pub action: HotplugAction,
    /// Physical key, e.g. `001/004`.
    pub key: String,
}

/// Watches a device node tree and forwards [`HotplugNotice`]s.
///
/// Dropping the watcher stops the notifications.
pub struct DevfsWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl DevfsWatcher {
    /// Start watching `root`, sending notices to `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Watcher`] if the watcher cannot be created or
    /// `root` cannot be watched.
    pub fn spawn(
        root: impl Into<PathBuf>,
        tx: mpsc::UnboundedSender<HotplugNotice>,
    ) -> DeviceResult<Self> {
        let root = root.into();
        let watch_root = root.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for notice in notices(&watch_root, &event) {
                        let _ = tx.send(notice);
                    }
                },
                Err(e) => debug!(error = %e, "device node watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| DeviceError::Watcher(e.to_string()))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| DeviceError::Watcher(format!("{}: {e}", root.display())))?;
        info!(root = %root.display(), "watching device nodes");
        Ok(Self {
            root,
            _watcher: watcher,
        })
    }

    /// The watched tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl std::fmt::Debug for DevfsWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevfsWatcher")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

fn notices(root: &Path, event: &Event) -> Vec<HotplugNotice> {
    let action = match event.kind {
        NotifyKind::Create(_) => HotplugAction::Added,
        NotifyKind::Remove(_) => HotplugAction::Removed,
        _ => return Vec::new(),
    };
    event
        .paths
        .iter()
        .filter_map(|path| node_key(root, path))
        .map(|key| HotplugNotice { action, key })
        .collect()
}

/// `root/BBB/DDD` to `BBB/DDD`; anything else is not a device node.
fn node_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;
    let [bus, address] = parts.as_slice() else {
        return None;
    };
    let numeric = |s: &str| s.len() == 3 && s.bytes().all(|b| b.is_ascii_digit());
    (numeric(bus) && numeric(address)).then(|| format!("{bus}/{address}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use notify::event::{CreateKind, ModifyKind, RemoveKind};

    use super::*;

    #[test]
    fn maps_device_nodes_only() {
        let root = Path::new("/dev/bus/usb");
        assert_eq!(
            node_key(root, Path::new("/dev/bus/usb/001/004")).as_deref(),
            Some("001/004")
        );
        assert!(node_key(root, Path::new("/dev/bus/usb/001")).is_none());
        assert!(node_key(root, Path::new("/dev/bus/usb/001/x")).is_none());
        assert!(node_key(root, Path::new("/tmp/001/004")).is_none());
    }

    #[test]
    fn only_create_and_remove_produce_notices() {
        let root = Path::new("/dev/bus/usb");
        let path = PathBuf::from("/dev/bus/usb/002/007");
        let created = Event::new(NotifyKind::Create(CreateKind::File)).add_path(path.clone());
        let removed = Event::new(NotifyKind::Remove(RemoveKind::File)).add_path(path.clone());
        let modified = Event::new(NotifyKind::Modify(ModifyKind::Any)).add_path(path);

        assert_eq!(notices(root, &created)[0].action, HotplugAction::Added);
        assert_eq!(notices(root, &removed)[0].action, HotplugAction::Removed);
        assert!(notices(root, &modified).is_empty());
    }

    #[tokio::test]
    async fn watcher_reports_created_node() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("001")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = DevfsWatcher::spawn(root.path(), tx).unwrap();

        std::fs::write(root.path().join("001/004"), b"").unwrap();
        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            notice,
            HotplugNotice {
                action: HotplugAction::Added,
                key: "001/004".into(),
            }
        );
    }
}
