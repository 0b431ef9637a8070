//! Capabilities a plugin can request and hooks it can declare.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A capability-sensitive operation category checked at the sandbox boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Read a file.
    #[serde(rename = "fs.read")]
    FsRead,
    /// Create or overwrite a file.
    #[serde(rename = "fs.write")]
    FsWrite,
    /// Open an outbound network connection.
    #[serde(rename = "net.outbound")]
    NetOutbound,
    /// Accept inbound connections on a local interface.
    #[serde(rename = "net.inbound")]
    NetInbound,
    /// Open a hardware device.
    #[serde(rename = "device.access")]
    DeviceAccess,
    /// Publish to a queue topic.
    #[serde(rename = "queue.publish")]
    QueuePublish,
    /// Receive messages from a queue topic.
    #[serde(rename = "queue.subscribe")]
    QueueSubscribe,
}

impl Capability {
    /// All capabilities, in a stable order.
    pub const ALL: [Self; 7] = [
        Self::FsRead,
        Self::FsWrite,
        Self::NetOutbound,
        Self::NetInbound,
        Self::DeviceAccess,
        Self::QueuePublish,
        Self::QueueSubscribe,
    ];

    /// Dotted name, e.g. `fs.write`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FsRead => "fs.read",
            Self::FsWrite => "fs.write",
            Self::NetOutbound => "net.outbound",
            Self::NetInbound => "net.inbound",
            Self::DeviceAccess => "device.access",
            Self::QueuePublish => "queue.publish",
            Self::QueueSubscribe => "queue.subscribe",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CoreError::UnknownCapability(s.to_string()))
    }
}

/// A lifecycle or event hook a manifest may bind to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    /// Invoked once while the instance is loading.
    OnLoad,
    /// Invoked best-effort while the instance is unloading.
    OnUnload,
    /// A matching device was attached.
    OnDeviceAttached,
    /// A matching device was detached.
    OnDeviceDetached,
    /// A job was submitted to the plugin or published to a subscribed topic.
    OnJobReceived,
    /// A watched file changed.
    OnFileChanged,
}

impl HookKind {
    /// All hooks, in manifest order.
    pub const ALL: [Self; 6] = [
        Self::OnLoad,
        Self::OnUnload,
        Self::OnDeviceAttached,
        Self::OnDeviceDetached,
        Self::OnJobReceived,
        Self::OnFileChanged,
    ];

    /// The key used for this hook in the manifest `hooks` table.
    #[must_use]
    pub fn manifest_key(self) -> &'static str {
        match self {
            Self::OnLoad => "onLoad",
            Self::OnUnload => "onUnload",
            Self::OnDeviceAttached => "onDeviceAttached",
            Self::OnDeviceDetached => "onDeviceDetached",
            Self::OnJobReceived => "onJobReceived",
            Self::OnFileChanged => "onFileChanged",
        }
    }

    /// Resolve a manifest key, accepting `onJob` as an alias of
    /// `onJobReceived`.
    #[must_use]
    pub fn from_manifest_key(key: &str) -> Option<Self> {
        if key == "onJob" {
            return Some(Self::OnJobReceived);
        }
        Self::ALL.into_iter().find(|h| h.manifest_key() == key)
    }

    /// Whether this hook carries job traffic (as opposed to lifecycle).
    #[must_use]
    pub fn is_job_hook(self) -> bool {
        !matches!(self, Self::OnLoad | Self::OnUnload)
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.manifest_key())
    }
}

impl FromStr for HookKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_manifest_key(s).ok_or_else(|| CoreError::UnknownHook(s.to_string()))
    }
}
