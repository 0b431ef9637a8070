//! Device and file change events.

use std::fmt;
use std::path::Path;

use plughost_core::{HookKind, Timestamp};
use serde::{Deserialize, Serialize};

/// What happened to the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A device appeared.
    Attach,
    /// A device went away.
    Detach,
    /// A watched file was created, modified or removed.
    FileChanged,
}

impl EventKind {
    /// The hook fired for this kind.
    #[must_use]
    pub fn hook(self) -> HookKind {
        match self {
            Self::Attach => HookKind::OnDeviceAttached,
            Self::Detach => HookKind::OnDeviceDetached,
            Self::FileChanged => HookKind::OnFileChanged,
        }
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Attach => "attach",
            Self::Detach => "detach",
            Self::FileChanged => "file_changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which detection path produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Platform change notification.
    Callback,
    /// Periodic enumeration.
    Poll,
}

/// Descriptive attributes. Devices fill the USB fields, file events fill
/// `path` and `hash`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAttributes {
    /// USB vendor id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    /// USB product id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    /// Serial number string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Manufacturer string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// Product string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    /// Bus number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<u16>,
    /// Device address on the bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u16>,
    /// File path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// BLAKE3 hex of the file contents; absent when the file was removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl DeviceAttributes {
    /// Whether any USB descriptor field is missing.
    #[must_use]
    pub fn is_partial_usb(&self) -> bool {
        self.vendor_id.is_none()
            || self.product_id.is_none()
            || self.bus.is_none()
            || self.address.is_none()
    }
}

/// An event before the log assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Stable subject id.
    pub subject_id: String,
    /// Attributes.
    pub attributes: DeviceAttributes,
    /// Descriptor read failed; attributes are partial.
    pub degraded: bool,
    /// Detection path.
    pub source: EventSource,
}

impl NewEvent {
    /// A USB attach or detach, with the subject id derived from `attributes`.
    #[must_use]
    pub fn usb(kind: EventKind, attributes: DeviceAttributes, source: EventSource) -> Self {
        let degraded = attributes.is_partial_usb();
        Self {
            kind,
            subject_id: usb_subject_id(&attributes),
            attributes,
            degraded,
            source,
        }
    }
}

/// A logged event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    /// Sequence number, strictly increasing per stream.
    pub id: u64,
    /// Event kind.
    #[serde(rename = "event")]
    pub kind: EventKind,
    /// Stable subject id.
    pub subject_id: String,
    /// Attributes.
    pub attributes: DeviceAttributes,
    /// Descriptor read failed; attributes are partial.
    #[serde(default)]
    pub degraded: bool,
    /// Detection path.
    pub source: EventSource,
    /// Append time.
    pub timestamp: Timestamp,
}

impl DeviceEvent {
    /// Stamp a new event with its id and the current time.
    #[must_use]
    pub fn stamp(id: u64, event: NewEvent) -> Self {
        Self {
            id,
            kind: event.kind,
            subject_id: event.subject_id,
            attributes: event.attributes,
            degraded: event.degraded,
            source: event.source,
            timestamp: Timestamp::now(),
        }
    }
}

/// `usb:{vid}:{pid}:{bus}:{address}`, hex ids and decimal bus/address.
/// Unknown ids render as `????`, unknown bus or address as `???`.
#[must_use]
pub fn usb_subject_id(attributes: &DeviceAttributes) -> String {
    let hex = |v: Option<u16>| v.map_or_else(|| "????".to_string(), |v| format!("{v:04x}"));
    let dec = |v: Option<u16>| v.map_or_else(|| "???".to_string(), |v| format!("{v:03}"));
    format!(
        "usb:{}:{}:{}:{}",
        hex(attributes.vendor_id),
        hex(attributes.product_id),
        dec(attributes.bus),
        dec(attributes.address)
    )
}

/// `file:{path}`, with the path canonicalized when it (or its parent, for a
/// removed file) still exists.
#[must_use]
pub fn file_subject_id(path: &Path) -> String {
    let canonical = path.canonicalize().ok().or_else(|| {
        let parent = path.parent()?.canonicalize().ok()?;
        Some(parent.join(path.file_name()?))
    });
    format!("file:{}", canonical.as_deref().unwrap_or(path).display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_subject_ids() {
        let full = DeviceAttributes {
            vendor_id: Some(0x1234),
            product_id: Some(0x5678),
            bus: Some(1),
            address: Some(4),
            ..Default::default()
        };
        assert_eq!(usb_subject_id(&full), "usb:1234:5678:001:004");

        let partial = DeviceAttributes {
            bus: Some(2),
            address: Some(9),
            ..Default::default()
        };
        assert_eq!(usb_subject_id(&partial), "usb:????:????:002:009");
        assert!(NewEvent::usb(EventKind::Attach, partial, EventSource::Callback).degraded);
        assert!(!NewEvent::usb(EventKind::Attach, full, EventSource::Poll).degraded);
    }

    #[test]
    fn wire_shape() {
        let event = DeviceEvent::stamp(
            7,
            NewEvent {
                kind: EventKind::Attach,
                subject_id: "usb:1234:5678:001:004".into(),
                attributes: DeviceAttributes {
                    vendor_id: Some(0x1234),
                    ..Default::default()
                },
                degraded: false,
                source: EventSource::Callback,
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "attach");
        assert_eq!(value["subjectId"], "usb:1234:5678:001:004");
        assert_eq!(value["attributes"]["vendorId"], 0x1234);
        assert!(value["attributes"].get("serial").is_none());
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn file_subject_for_removed_file() {
        let dir = std::env::temp_dir();
        let id = file_subject_id(&dir.join("definitely-not-here.txt"));
        assert!(id.starts_with("file:"));
        assert!(id.ends_with("definitely-not-here.txt"));
    }

    #[test]
    fn hooks() {
        assert_eq!(EventKind::Attach.hook(), HookKind::OnDeviceAttached);
        assert_eq!(EventKind::FileChanged.hook(), HookKind::OnFileChanged);
    }
}
