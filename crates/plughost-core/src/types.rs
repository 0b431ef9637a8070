//! Common identity types used throughout plughost.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

static NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]{3,50}$").ok());

/// Namespace for deterministic job ids derived from event deliveries.
const JOB_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x2c, 0x9d, 0x41, 0x0b, 0x77, 0x4e, 0x1a, 0x93, 0x5e, 0x2d, 0xc8, 0x71, 0x04, 0xa6, 0x3b,
]);

/// A UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// The current time.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns this timestamp shifted forward by `delay`.
    #[must_use]
    pub fn after(&self, delay: std::time::Duration) -> Self {
        let delta = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        Self(self.0.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// A plugin name: a slug of 3 to 50 characters from `[a-z0-9-]`.
///
/// Names are unique per install and key the dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PluginName(String);

impl PluginName {
    /// Validate and wrap a plugin name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidName`] if the name is not a valid slug.
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(CoreError::InvalidName(name))
        }
    }

    /// Whether `name` is an acceptable plugin slug.
    #[must_use]
    pub fn is_valid(name: &str) -> bool {
        NAME_PATTERN.as_ref().is_some_and(|re| re.is_match(name))
    }

    /// The name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PluginName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for PluginName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for PluginName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PluginName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// Identity of a plugin instance: `name@version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId {
    name: PluginName,
    version: semver::Version,
}

impl InstanceId {
    /// Build an instance id from its parts.
    #[must_use]
    pub fn new(name: PluginName, version: semver::Version) -> Self {
        Self { name, version }
    }

    /// The plugin name.
    #[must_use]
    pub fn name(&self) -> &PluginName {
        &self.name
    }

    /// The plugin version.
    #[must_use]
    pub fn version(&self) -> &semver::Version {
        &self.version
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl FromStr for InstanceId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = s
            .split_once('@')
            .ok_or_else(|| CoreError::InvalidInstanceId(s.to_string()))?;
        let name = PluginName::new(name)?;
        let version = semver::Version::parse(version).map_err(|e| CoreError::InvalidVersion {
            version: version.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { name, version })
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id for delivering event `event_id` of `stream` to
    /// `plugin`.
    ///
    /// Replaying the same event after a restart yields the same id, which
    /// lets the job store reject the duplicate.
    #[must_use]
    pub fn for_event(stream: &str, event_id: u64, plugin: &PluginName) -> Self {
        let key = format!("{stream}/{event_id}/{plugin}");
        Self(Uuid::new_v5(&JOB_NAMESPACE, key.as_bytes()))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_name_accepts_slugs() {
        assert!(PluginName::new("usb-logger").is_ok());
        assert!(PluginName::new("abc").is_ok());
        assert!(PluginName::new("a".repeat(50)).is_ok());
    }

    #[test]
    fn plugin_name_rejects_bad_slugs() {
        assert!(PluginName::new("ab").is_err());
        assert!(PluginName::new("a".repeat(51)).is_err());
        assert!(PluginName::new("Upper").is_err());
        assert!(PluginName::new("under_score").is_err());
        assert!(PluginName::new("dot.name").is_err());
    }

    #[test]
    fn instance_id_round_trips_through_display() {
        let id: InstanceId = "usb-logger@1.2.3".parse().unwrap();
        assert_eq!(id.name().as_str(), "usb-logger");
        assert_eq!(id.version(), &semver::Version::new(1, 2, 3));
        assert_eq!(id.to_string(), "usb-logger@1.2.3");
    }

    #[test]
    fn instance_id_rejects_missing_version() {
        assert!("usb-logger".parse::<InstanceId>().is_err());
        assert!("usb-logger@one".parse::<InstanceId>().is_err());
    }

    #[test]
    fn event_job_ids_are_deterministic() {
        let name = PluginName::new("usb-logger").unwrap();
        let a = JobId::for_event("devices", 7, &name);
        let b = JobId::for_event("devices", 7, &name);
        let c = JobId::for_event("devices", 8, &name);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn timestamp_after_moves_forward() {
        let now = Timestamp::now();
        let later = now.after(std::time::Duration::from_secs(5));
        assert!(later > now);
    }
}
