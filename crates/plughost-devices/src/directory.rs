//! Snapshot of currently attached devices.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::event::DeviceAttributes;

/// Shared map from subject id to the attributes captured at attach.
///
/// The monitor writes it; host `device_open` calls read it. Cloning shares
/// the same map.
#[derive(Debug, Clone, Default)]
pub struct DeviceDirectory {
    inner: Arc<RwLock<HashMap<String, DeviceAttributes>>>,
}

impl DeviceDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes of an attached device.
    #[must_use]
    pub fn get(&self, subject_id: &str) -> Option<DeviceAttributes> {
        self.read().get(subject_id).cloned()
    }

    /// All attached devices, sorted by subject id.
    #[must_use]
    pub fn list(&self) -> Vec<(String, DeviceAttributes)> {
        let mut all: Vec<_> = self
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Record an attached device.
    pub fn insert(&self, subject_id: impl Into<String>, attributes: DeviceAttributes) {
        self.write().insert(subject_id.into(), attributes);
    }

    /// Forget a detached device.
    pub fn remove(&self, subject_id: &str) -> Option<DeviceAttributes> {
        self.write().remove(subject_id)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DeviceAttributes>> {
        self.inner.read().unwrap_or_else(|e| {
            tracing::warn!("device directory lock poisoned, recovering");
            e.into_inner()
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DeviceAttributes>> {
        self.inner.write().unwrap_or_else(|e| {
            tracing::warn!("device directory lock poisoned, recovering");
            e.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let dir = DeviceDirectory::new();
        let other = dir.clone();
        dir.insert(
            "usb:1234:5678:001:004",
            DeviceAttributes {
                vendor_id: Some(0x1234),
                ..Default::default()
            },
        );
        assert_eq!(
            other.get("usb:1234:5678:001:004").unwrap().vendor_id,
            Some(0x1234)
        );
        assert_eq!(other.list().len(), 1);
        assert!(other.remove("usb:1234:5678:001:004").is_some());
        assert!(dir.get("usb:1234:5678:001:004").is_none());
    }
}
