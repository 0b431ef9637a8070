//! Full device enumeration for the poll path.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{DeviceError, DeviceResult};
use crate::event::DeviceAttributes;

/// Default sysfs directory listing USB devices.
pub const SYSFS_USB_ROOT: &str = "/sys/bus/usb/devices";

/// One device found by an enumeration pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Physical key, `bus/address` with three digits each (`001/004`). The
    /// same key names the device node under `/dev/bus/usb`.
    pub key: String,
    /// Attributes that could be read.
    pub attributes: DeviceAttributes,
}

impl DeviceInfo {
    /// Build the info for a device on `bus` at `address`.
    #[must_use]
    pub fn new(bus: u16, address: u16, attributes: DeviceAttributes) -> Self {
        Self {
            key: physical_key(bus, address),
            attributes: DeviceAttributes {
                bus: Some(bus),
                address: Some(address),
                ..attributes
            },
        }
    }
}

/// `bus/address` as used under `/dev/bus/usb`.
#[must_use]
pub fn physical_key(bus: u16, address: u16) -> String {
    format!("{bus:03}/{address:03}")
}

/// Lists attached devices and reads their descriptors.
pub trait DeviceEnumerator: Send + Sync {
    /// Every currently attached device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device list itself cannot be read. A device
    /// whose descriptor cannot be read is still listed with partial
    /// attributes.
    fn enumerate(&self) -> DeviceResult<Vec<DeviceInfo>>;

    /// Read the descriptor of the device with physical key `key`, if it is
    /// still present.
    fn describe(&self, key: &str) -> Option<DeviceInfo> {
        self.enumerate()
            .ok()?
            .into_iter()
            .find(|info| info.key == key)
    }
}

/// Linux enumerator over `/sys/bus/usb/devices`.
#[derive(Debug, Clone)]
pub struct SysfsEnumerator {
    root: PathBuf,
}

impl SysfsEnumerator {
    /// Enumerate under `root` (normally [`SYSFS_USB_ROOT`]).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_device(dir: &Path) -> Option<DeviceInfo> {
        // busnum/devnum are what make this a device node; interfaces lack them.
        let bus = read_attr(dir, "busnum").and_then(|v| v.parse().ok())?;
        let address = read_attr(dir, "devnum").and_then(|v| v.parse().ok())?;
        let hex = |name: &str| read_attr(dir, name).and_then(|v| u16::from_str_radix(&v, 16).ok());
        let attributes = DeviceAttributes {
            vendor_id: hex("idVendor"),
            product_id: hex("idProduct"),
            serial: read_attr(dir, "serial"),
            manufacturer: read_attr(dir, "manufacturer"),
            product: read_attr(dir, "product"),
            ..Default::default()
        };
        Some(DeviceInfo::new(bus, address, attributes))
    }
}

impl Default for SysfsEnumerator {
    fn default() -> Self {
        Self::new(SYSFS_USB_ROOT)
    }
}

impl DeviceEnumerator for SysfsEnumerator {
    fn enumerate(&self) -> DeviceResult<Vec<DeviceInfo>> {
        let entries = fs::read_dir(&self.root).map_err(|e| DeviceError::io(&self.root, &e))?;
        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            // Interface entries look like `1-1:1.0`.
            if name.to_string_lossy().contains(':') {
                continue;
            }
            match Self::read_device(&entry.path()) {
                Some(info) => devices.push(info),
                None => debug!(entry = %name.to_string_lossy(), "skipping sysfs entry without bus address"),
            }
        }
        devices.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(devices)
    }
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    let value = fs::read_to_string(dir.join(name)).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Enumerator over a list maintained by the embedder.
#[derive(Debug, Default)]
pub struct StaticEnumerator {
    devices: Mutex<Vec<DeviceInfo>>,
}

impl StaticEnumerator {
    /// Create an enumerator listing `devices`.
    #[must_use]
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices: Mutex::new(devices),
        }
    }

    /// Replace the device list.
    pub fn set(&self, devices: Vec<DeviceInfo>) {
        *self.lock() = devices;
    }

    /// Add or replace one device.
    pub fn insert(&self, info: DeviceInfo) {
        let mut devices = self.lock();
        devices.retain(|d| d.key != info.key);
        devices.push(info);
    }

    /// Remove a device by physical key.
    pub fn remove(&self, key: &str) {
        self.lock().retain(|d| d.key != key);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DeviceInfo>> {
        self.devices.lock().unwrap_or_else(|e| {
            tracing::warn!("static enumerator lock poisoned, recovering");
            e.into_inner()
        })
    }
}

impl DeviceEnumerator for StaticEnumerator {
    fn enumerate(&self) -> DeviceResult<Vec<DeviceInfo>> {
        Ok(self.lock().clone())
    }
}
