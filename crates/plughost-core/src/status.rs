//! Plugin instance lifecycle.
//!
//! ```text
//! Validating -> Loading -> Loaded -> Active -> Unloading -> Unloaded
//!      |           |          |         |
//!      +-----------+----------+---------+-----> Failed
//! ```
//!
//! `Loaded -> Unloading` covers an instance that is discarded before it was
//! ever routed (a reload superseded by a newer one, or a runtime shutdown).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Manifest schema and signature are being checked.
    Validating,
    /// The execution context is starting and `onLoad` is running.
    Loading,
    /// `onLoad` succeeded; not yet routed.
    Loaded,
    /// Registered in the dispatch table and receiving jobs.
    Active,
    /// Draining in-flight jobs before teardown.
    Unloading,
    /// Context torn down and resources released.
    Unloaded,
    /// Terminal failure.
    Failed,
}

impl InstanceStatus {
    /// Whether the lifecycle permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use InstanceStatus::{Active, Failed, Loaded, Loading, Unloaded, Unloading, Validating};
        matches!(
            (self, next),
            (Validating, Loading | Failed)
                | (Loading, Loaded | Failed)
                | (Loaded, Active | Unloading | Failed)
                | (Active, Unloading | Failed)
                | (Unloading, Unloaded)
        )
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Unloaded | Self::Failed)
    }

    /// Lowercase label used in logs and diagnostics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Active => "active",
            Self::Unloading => "unloading",
            Self::Unloaded => "unloaded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
