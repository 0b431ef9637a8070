//! Deny-by-default capability checks.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use plughost_core::{Capability, InstanceId, Timestamp};
use plughost_events::{Channel, PermissionViolation};
use tracing::{debug, warn};

use crate::audit::{AuditRing, DenialRecord};
use crate::grant::GrantSet;
use crate::policy::{ViolationPolicy, ViolationWindow};

/// Outcome of a capability check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// A grant covers the request.
    Allow,
    /// No grant covers the request.
    Deny {
        /// The violation published for this denial.
        violation: Arc<PermissionViolation>,
    },
}

impl Decision {
    /// Whether the request may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Whether this denial crossed the violation threshold.
    #[must_use]
    pub fn threshold_exceeded(&self) -> bool {
        match self {
            Self::Allow => false,
            Self::Deny { violation } => violation.threshold_exceeded,
        }
    }
}

/// Checks capability requests against an instance's grants.
///
/// The enforcer holds no grants itself; each instance owns its
/// [`GrantSet`]. What the enforcer owns is the record of denials: the
/// violations channel, the audit ring and the per-instance sliding windows.
#[derive(Debug)]
pub struct PermissionEnforcer {
    policy: ViolationPolicy,
    violations: Channel<PermissionViolation>,
    windows: DashMap<InstanceId, ViolationWindow>,
    audit: AuditRing,
}

impl PermissionEnforcer {
    /// Create an enforcer publishing on `violations`.
    #[must_use]
    pub fn new(
        policy: ViolationPolicy,
        violations: Channel<PermissionViolation>,
        audit_capacity: usize,
    ) -> Self {
        Self {
            policy,
            violations,
            windows: DashMap::new(),
            audit: AuditRing::new(audit_capacity),
        }
    }

    /// Check `capability` on `target` for `instance`.
    ///
    /// A denial is recorded in the audit ring and published as exactly one
    /// [`PermissionViolation`].
    pub fn check(
        &self,
        instance: &InstanceId,
        grants: &GrantSet,
        capability: Capability,
        target: &str,
    ) -> Decision {
        if grants.allows(capability, target) {
            debug!(instance = %instance, capability = %capability, target, "capability granted");
            return Decision::Allow;
        }

        let timestamp = Timestamp::now();
        let count = self
            .windows
            .entry(instance.clone())
            .or_default()
            .record(Instant::now(), self.policy.window);
        let threshold_exceeded = self.policy.exceeded(count);

        self.audit.push(DenialRecord {
            instance: instance.clone(),
            capability,
            target: target.to_string(),
            timestamp,
        });

        let violation = PermissionViolation {
            plugin_id: instance.clone(),
            capability,
            target: target.to_string(),
            timestamp,
            violations_in_window: count,
            threshold_exceeded,
        };
        warn!(
            instance = %instance,
            capability = %capability,
            target,
            violations_in_window = count,
            threshold_exceeded,
            "capability denied"
        );
        self.violations.publish(violation.clone());
        Decision::Deny {
            violation: Arc::new(violation),
        }
    }

    /// Drop the sliding window of a retired instance.
    pub fn forget(&self, instance: &InstanceId) {
        self.windows.remove(instance);
    }

    /// Recent denials.
    #[must_use]
    pub fn audit(&self) -> &AuditRing {
        &self.audit
    }

    /// The policy in force.
    #[must_use]
    pub fn policy(&self) -> ViolationPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn instance() -> InstanceId {
        "enforcer-test@1.0.0".parse().unwrap()
    }

    #[tokio::test]
    async fn deny_emits_exactly_one_violation() {
        let channel = Channel::new("violations");
        let mut sub = channel.subscribe();
        let enforcer = PermissionEnforcer::new(ViolationPolicy::default(), channel, 16);

        let decision = enforcer.check(
            &instance(),
            &GrantSet::empty(),
            Capability::FsWrite,
            "/etc/passwd",
        );
        assert!(!decision.is_allowed());

        let violation = sub.recv().await.unwrap();
        assert_eq!(violation.capability, Capability::FsWrite);
        assert_eq!(violation.target, "/etc/passwd");
        assert_eq!(violation.plugin_id, instance());
        assert_eq!(violation.violations_in_window, 1);
        assert!(sub.try_recv().is_none());
        assert_eq!(enforcer.audit().len(), 1);
    }

    #[tokio::test]
    async fn threshold_flags_the_crossing_denial() {
        let channel = Channel::new("violations");
        let enforcer =
            PermissionEnforcer::new(ViolationPolicy::new(2, Duration::from_secs(60)), channel, 16);
        let grants = GrantSet::empty();
        let first = enforcer.check(&instance(), &grants, Capability::NetOutbound, "x:1");
        let second = enforcer.check(&instance(), &grants, Capability::NetOutbound, "x:1");
        assert!(!first.threshold_exceeded());
        assert!(second.threshold_exceeded());

        enforcer.forget(&instance());
        let third = enforcer.check(&instance(), &grants, Capability::NetOutbound, "x:1");
        assert!(!third.threshold_exceeded());
    }

    #[test]
    fn allow_records_nothing() {
        let enforcer = PermissionEnforcer::new(
            ViolationPolicy::default(),
            Channel::new("violations"),
            16,
        );
        let text = r#"
name = "enforcer-test"
version = "1.0.0"
entryPoint = "main.sh"
[permissions]
filesystem = [{ path = "/data", mode = "read" }]
[isolationLimits]
maxHeapMb = 8
"#;
        let manifest: plughost_manifest::Manifest = toml::from_str(text).unwrap();
        let grants = GrantSet::from_manifest(&manifest).unwrap();
        assert!(
            enforcer
                .check(&instance(), &grants, Capability::FsRead, "/data/x")
                .is_allowed()
        );
        assert!(enforcer.audit().is_empty());
    }
}
