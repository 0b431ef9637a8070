//! Typed manifest model.
//!
//! Instances of these types are only produced from documents that passed the
//! schema check, so their fields are already within bounds.

use plughost_core::{HookKind, InstanceId, PluginName};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A parsed `plugin.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Plugin slug, unique per install.
    pub name: PluginName,
    /// Semantic version.
    pub version: semver::Version,
    /// Executable code, relative to the plugin directory.
    pub entry_point: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Handlers may run concurrently up to `maxConcurrentHandlers`.
    #[serde(default)]
    pub concurrency_safe: bool,
    /// Capability grants.
    pub permissions: Permissions,
    /// Hook bindings.
    #[serde(default)]
    pub hooks: Hooks,
    /// Resource ceilings.
    pub isolation_limits: IsolationLimits,
    /// Publisher signature; excluded from the canonical form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureBlock>,
}

impl Manifest {
    /// `name@version`.
    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        InstanceId::new(self.name.clone(), self.version.clone())
    }

    /// Extension of the entry point, without the dot.
    #[must_use]
    pub fn entry_extension(&self) -> Option<&str> {
        std::path::Path::new(&self.entry_point)
            .extension()
            .and_then(|e| e.to_str())
    }

    /// Concurrent handler budget: `maxConcurrentHandlers` when the plugin
    /// declares itself concurrency-safe, otherwise one.
    #[must_use]
    pub fn handler_concurrency(&self) -> usize {
        if self.concurrency_safe {
            usize::try_from(self.isolation_limits.max_concurrent_handlers)
                .unwrap_or(1)
                .max(1)
        } else {
            1
        }
    }
}

/// Capability grants by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    /// Filesystem paths.
    #[serde(default)]
    pub filesystem: Vec<FsGrant>,
    /// Network destinations.
    #[serde(default)]
    pub network: NetworkGrants,
    /// Device filter.
    #[serde(default)]
    pub device: DeviceFilter,
    /// Queue topics.
    #[serde(default)]
    pub queue: Vec<QueueGrant>,
}

/// Filesystem access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Read and write.
    Readwrite,
}

impl AccessMode {
    /// Whether reads are allowed.
    #[must_use]
    pub fn allows_read(self) -> bool {
        matches!(self, Self::Read | Self::Readwrite)
    }

    /// Whether writes are allowed.
    #[must_use]
    pub fn allows_write(self) -> bool {
        matches!(self, Self::Write | Self::Readwrite)
    }
}

/// A filesystem grant: path prefix or glob plus mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGrant {
    /// Absolute path prefix, or a glob pattern.
    pub path: String,
    /// Access mode.
    pub mode: AccessMode,
}

/// Network grants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkGrants {
    /// Outbound destinations: `host`, `host:port`, `*.suffix[:port]` or `*`.
    #[serde(default)]
    pub outbound: Vec<String>,
    /// Inbound listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound: Option<InboundRule>,
}

/// An inbound listener grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRule {
    /// Port to listen on.
    pub port: u16,
    /// Local interface address.
    pub interface: String,
}

/// USB vendor/product filter. An empty list matches any id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFilter {
    /// Accepted vendor ids.
    #[serde(default, with = "hex_ids")]
    pub vendor_ids: Vec<u16>,
    /// Accepted product ids.
    #[serde(default, with = "hex_ids")]
    pub product_ids: Vec<u16>,
}

impl DeviceFilter {
    /// Whether the plugin declared any device grant at all.
    #[must_use]
    pub fn is_declared(&self) -> bool {
        !self.vendor_ids.is_empty() || !self.product_ids.is_empty()
    }
}

/// Queue access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// May publish.
    Publish,
    /// May receive.
    Subscribe,
    /// Both.
    Both,
}

impl QueueMode {
    /// Whether publishing is allowed.
    #[must_use]
    pub fn allows_publish(self) -> bool {
        matches!(self, Self::Publish | Self::Both)
    }

    /// Whether subscribing is allowed.
    #[must_use]
    pub fn allows_subscribe(self) -> bool {
        matches!(self, Self::Subscribe | Self::Both)
    }
}

/// A queue topic grant. `*` matches exactly one dot-separated segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueGrant {
    /// Topic pattern.
    pub topic: String,
    /// Access mode.
    pub mode: QueueMode,
}

/// Hook bindings: handler name per hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hooks {
    /// Runs while loading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_load: Option<String>,
    /// Runs best-effort while unloading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_unload: Option<String>,
    /// Runs for matching attach events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_device_attached: Option<String>,
    /// Runs for matching detach events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_device_detached: Option<String>,
    /// Runs for submitted and queue jobs.
    #[serde(default, alias = "onJob", skip_serializing_if = "Option::is_none")]
    pub on_job_received: Option<String>,
    /// Runs for watched file changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_file_changed: Option<String>,
}

impl Hooks {
    /// Handler bound to `hook`.
    #[must_use]
    pub fn handler(&self, hook: HookKind) -> Option<&str> {
        match hook {
            HookKind::OnLoad => self.on_load.as_deref(),
            HookKind::OnUnload => self.on_unload.as_deref(),
            HookKind::OnDeviceAttached => self.on_device_attached.as_deref(),
            HookKind::OnDeviceDetached => self.on_device_detached.as_deref(),
            HookKind::OnJobReceived => self.on_job_received.as_deref(),
            HookKind::OnFileChanged => self.on_file_changed.as_deref(),
        }
    }

    /// Whether `hook` is bound.
    #[must_use]
    pub fn declares(&self, hook: HookKind) -> bool {
        self.handler(hook).is_some()
    }
}

/// Resource ceilings for the execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolationLimits {
    /// Resident memory ceiling in MiB.
    pub max_heap_mb: u64,
    /// CPU share ceiling in percent of one core.
    #[serde(default = "default_cpu_percent")]
    pub max_cpu_percent: u32,
    /// Concurrent handlers when `concurrencySafe` is set.
    #[serde(default = "default_concurrent_handlers")]
    pub max_concurrent_handlers: u32,
}

fn default_cpu_percent() -> u32 {
    100
}

fn default_concurrent_handlers() -> u32 {
    1
}

/// The `signature` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBlock {
    /// Algorithm id; only `ed25519` is accepted.
    pub algorithm: String,
    /// Base64 signature bytes.
    pub value: String,
    /// Signer reference looked up in the trust registry.
    pub signer: String,
}

/// Device ids as `0x`-prefixed 4-digit hex strings, also accepting integers.
mod hex_ids {
    use super::{Deserialize, Deserializer, Serializer};
    use serde::ser::SerializeSeq;

    pub(super) fn serialize<S: Serializer>(ids: &[u16], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(ids.len()))?;
        for id in ids {
            seq.serialize_element(&format!("0x{id:04x}"))?;
        }
        seq.end()
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Int(i64),
        Text(String),
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u16>, D::Error> {
        let raw = Vec::<RawId>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|id| match id {
                RawId::Int(n) => u16::try_from(n).map_err(serde::de::Error::custom),
                RawId::Text(s) => super::parse_device_id(&s)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid device id '{s}'"))),
            })
            .collect()
    }
}

/// Parse a device id written as hex, with or without a `0x` prefix.
#[must_use]
pub fn parse_device_id(s: &str) -> Option<u16> {
    let s = s.trim();
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if hex.is_empty() || hex.len() > 4 {
        return None;
    }
    u16::from_str_radix(hex, 16).ok()
}
