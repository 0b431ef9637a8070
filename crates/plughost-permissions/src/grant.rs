//! Compiled per-instance grants.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use plughost_core::Capability;
use plughost_manifest::{AccessMode, DeviceFilter, Manifest, QueueMode};

use crate::error::PermissionResult;
use crate::pattern::{HostPattern, InboundPattern, PathPattern, topic_matches};

/// The grants of one plugin instance, compiled from its manifest.
///
/// Grants are derived once at load and never edited. A hot-reload compiles
/// a fresh set from the new manifest; retiring an instance revokes its set,
/// after which every check is denied.
#[derive(Debug)]
pub struct GrantSet {
    filesystem: Vec<(PathPattern, AccessMode)>,
    outbound: Vec<HostPattern>,
    inbound: Option<InboundPattern>,
    device: DeviceFilter,
    queue: Vec<(String, QueueMode)>,
    revoked: AtomicBool,
}

impl GrantSet {
    /// Compile the grants declared by `manifest`.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::InvalidPattern`](crate::PermissionError)
    /// if any pattern fails to compile.
    pub fn from_manifest(manifest: &Manifest) -> PermissionResult<Self> {
        let permissions = &manifest.permissions;
        let filesystem = permissions
            .filesystem
            .iter()
            .map(|g| Ok((PathPattern::parse(&g.path)?.canonicalized(), g.mode)))
            .collect::<PermissionResult<Vec<_>>>()?;
        let outbound = permissions
            .network
            .outbound
            .iter()
            .map(|p| HostPattern::parse(p))
            .collect::<PermissionResult<Vec<_>>>()?;
        let inbound = permissions
            .network
            .inbound
            .as_ref()
            .map(|rule| InboundPattern::new(&rule.interface, rule.port))
            .transpose()?;
        Ok(Self {
            filesystem,
            outbound,
            inbound,
            device: permissions.device.clone(),
            queue: permissions
                .queue
                .iter()
                .map(|g| (g.topic.clone(), g.mode))
                .collect(),
            revoked: AtomicBool::new(false),
        })
    }

    /// Directories the filesystem grants reach, with their access mode.
    /// Glob grants contribute the directory above their first wildcard.
    #[must_use]
    pub fn fs_roots(&self) -> Vec<(PathBuf, AccessMode)> {
        if self.is_revoked() {
            return Vec::new();
        }
        self.filesystem
            .iter()
            .map(|(pattern, mode)| (pattern.root(), *mode))
            .collect()
    }

    /// A set that grants nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            filesystem: Vec::new(),
            outbound: Vec::new(),
            inbound: None,
            device: DeviceFilter::default(),
            queue: Vec::new(),
            revoked: AtomicBool::new(false),
        }
    }

    /// Whether `capability` on `target` is granted.
    #[must_use]
    pub fn allows(&self, capability: Capability, target: &str) -> bool {
        if self.is_revoked() {
            return false;
        }
        match capability {
            Capability::FsRead => self.fs_allows(target, AccessMode::allows_read),
            Capability::FsWrite => self.fs_allows(target, AccessMode::allows_write),
            Capability::NetOutbound => self.outbound.iter().any(|p| p.matches(target)),
            Capability::NetInbound => self.inbound.as_ref().is_some_and(|p| p.matches(target)),
            Capability::DeviceAccess => {
                let (vendor, product) = parse_usb_subject(target);
                self.covers_device(vendor, product)
            },
            Capability::QueuePublish => self.queue_allows(target, QueueMode::allows_publish),
            Capability::QueueSubscribe => self.queue_allows(target, QueueMode::allows_subscribe),
        }
    }

    /// Whether a device with these ids passes the manifest's device filter.
    /// A plugin without any device grant matches nothing; an empty id list
    /// inside a declared filter matches any id, but an unknown id only
    /// matches an empty list.
    #[must_use]
    pub fn covers_device(&self, vendor: Option<u16>, product: Option<u16>) -> bool {
        if self.is_revoked() || !self.device.is_declared() {
            return false;
        }
        id_matches(&self.device.vendor_ids, vendor) && id_matches(&self.device.product_ids, product)
    }

    /// Revoke every grant.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    /// Whether [`Self::revoke`] was called.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    fn fs_allows(&self, target: &str, mode: fn(AccessMode) -> bool) -> bool {
        self.filesystem
            .iter()
            .any(|(pattern, granted)| mode(*granted) && pattern.matches(target))
    }

    fn queue_allows(&self, topic: &str, mode: fn(QueueMode) -> bool) -> bool {
        self.queue
            .iter()
            .any(|(pattern, granted)| mode(*granted) && topic_matches(pattern, topic))
    }
}

fn id_matches(allowed: &[u16], id: Option<u16>) -> bool {
    allowed.is_empty() || id.is_some_and(|id| allowed.contains(&id))
}

/// Vendor and product ids embedded in a `usb:vvvv:pppp:...` subject id.
fn parse_usb_subject(subject: &str) -> (Option<u16>, Option<u16>) {
    let mut parts = subject.split(':');
    if parts.next() != Some("usb") {
        return (None, None);
    }
    let mut next_id = || parts.next().and_then(|p| u16::from_str_radix(p, 16).ok());
    let vendor = next_id();
    let product = next_id();
    (vendor, product)
}

#[cfg(test)]
mod tests {
    use plughost_manifest::{FsGrant, InboundRule, NetworkGrants, Permissions, QueueGrant};

    use super::*;

    fn manifest(permissions: Permissions) -> Manifest {
        let text = r#"
name = "grant-test"
version = "1.0.0"
entryPoint = "main.sh"
[permissions]
[isolationLimits]
maxHeapMb = 8
"#;
        let mut m: Manifest = toml::from_str(text).unwrap();
        m.permissions = permissions;
        m
    }

    fn grants() -> GrantSet {
        GrantSet::from_manifest(&manifest(Permissions {
            filesystem: vec![
                FsGrant {
                    path: "/plugins".into(),
                    mode: AccessMode::Read,
                },
                FsGrant {
                    path: "/tmp/out/*.json".into(),
                    mode: AccessMode::Readwrite,
                },
            ],
            network: NetworkGrants {
                outbound: vec!["api.example.com:443".into()],
                inbound: Some(InboundRule {
                    port: 8080,
                    interface: "127.0.0.1".into(),
                }),
            },
            device: DeviceFilter {
                vendor_ids: vec![0x1234],
                product_ids: vec![],
            },
            queue: vec![QueueGrant {
                topic: "devices.*".into(),
                mode: QueueMode::Publish,
            }],
        }))
        .unwrap()
    }

    #[test]
    fn filesystem_modes() {
        let g = grants();
        assert!(g.allows(Capability::FsRead, "/plugins/a.txt"));
        assert!(!g.allows(Capability::FsWrite, "/plugins/a.txt"));
        assert!(g.allows(Capability::FsWrite, "/tmp/out/r.json"));
        assert!(!g.allows(Capability::FsWrite, "/etc/passwd"));
    }

    #[test]
    fn fs_roots_for_confinement() {
        let g = grants();
        assert_eq!(
            g.fs_roots(),
            vec![
                (PathBuf::from("/plugins"), AccessMode::Read),
                (PathBuf::from("/tmp/out"), AccessMode::Readwrite),
            ]
        );
        g.revoke();
        assert!(g.fs_roots().is_empty());
    }

    #[test]
    fn network_and_queue() {
        let g = grants();
        assert!(g.allows(Capability::NetOutbound, "api.example.com:443"));
        assert!(!g.allows(Capability::NetOutbound, "evil.com:443"));
        assert!(g.allows(Capability::NetInbound, "127.0.0.1:8080"));
        assert!(g.allows(Capability::QueuePublish, "devices.usb"));
        assert!(!g.allows(Capability::QueueSubscribe, "devices.usb"));
    }

    #[test]
    fn device_filter() {
        let g = grants();
        assert!(g.covers_device(Some(0x1234), Some(0x9999)));
        assert!(g.covers_device(Some(0x1234), None));
        assert!(!g.covers_device(Some(0x4321), Some(0x9999)));
        assert!(!g.covers_device(None, None));
        assert!(g.allows(Capability::DeviceAccess, "usb:1234:5678:001:004"));
        assert!(!g.allows(Capability::DeviceAccess, "usb:abcd:5678:001:004"));
        assert!(!g.allows(Capability::DeviceAccess, "file:/x"));
    }

    #[test]
    fn undeclared_device_grant_matches_nothing() {
        let g = GrantSet::empty();
        assert!(!g.covers_device(Some(1), Some(2)));
    }

    #[test]
    fn revoked_set_denies_everything() {
        let g = grants();
        g.revoke();
        assert!(!g.allows(Capability::FsRead, "/plugins/a.txt"));
        assert!(!g.covers_device(Some(0x1234), Some(1)));
    }

    #[test]
    fn empty_set_denies_everything() {
        let g = GrantSet::empty();
        for capability in Capability::ALL {
            assert!(!g.allows(capability, "/"));
        }
    }
}
