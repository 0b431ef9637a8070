//! Grant pattern types and matching logic.

use std::fmt;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};

use crate::error::{PermissionError, PermissionResult};

/// Whether `target` contains a `..` segment. Such targets never match.
#[must_use]
pub fn has_traversal(target: &str) -> bool {
    Path::new(target)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

/// A filesystem grant: a path prefix or a glob.
#[derive(Debug, Clone)]
pub enum PathPattern {
    /// Matches the path itself and everything below it, component-wise.
    Prefix(PathBuf),
    /// Matches paths the glob matches; `*` does not cross `/`.
    Glob {
        /// The pattern as written.
        source: String,
        /// Compiled matcher.
        matcher: GlobMatcher,
    },
}

impl PathPattern {
    /// Compile a manifest path grant.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::InvalidPattern`] for relative patterns,
    /// patterns with `..`, or malformed globs.
    pub fn parse(pattern: &str) -> PermissionResult<Self> {
        let invalid = |reason: &str| PermissionError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };
        if !pattern.starts_with('/') {
            return Err(invalid("path grants must be absolute"));
        }
        if has_traversal(pattern) {
            return Err(invalid("path grants must not contain '..'"));
        }
        if pattern.contains(['*', '?', '[', '{']) {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| invalid(&e.to_string()))?;
            return Ok(Self::Glob {
                source: pattern.to_string(),
                matcher: glob.compile_matcher(),
            });
        }
        Ok(Self::Prefix(PathBuf::from(pattern)))
    }

    /// The same grant with its literal leading directory replaced by the
    /// canonical path, when that directory exists. Targets are matched after
    /// symlink resolution, so grants must be expressed the same way.
    #[must_use]
    pub fn canonicalized(self) -> Self {
        match self {
            Self::Prefix(prefix) => match std::fs::canonicalize(&prefix) {
                Ok(canonical) => Self::Prefix(canonical),
                Err(_) => Self::Prefix(prefix),
            },
            Self::Glob { source, matcher } => {
                let (base, rest) = split_glob_base(&source);
                let rebuilt = std::fs::canonicalize(base).ok().and_then(|canonical| {
                    let canonical = canonical.display().to_string();
                    Self::parse(&format!("{}/{rest}", canonical.trim_end_matches('/'))).ok()
                });
                rebuilt.unwrap_or(Self::Glob { source, matcher })
            },
        }
    }

    /// The directory below which every match lies.
    #[must_use]
    pub fn root(&self) -> PathBuf {
        match self {
            Self::Prefix(prefix) => prefix.clone(),
            Self::Glob { source, .. } => PathBuf::from(split_glob_base(source).0),
        }
    }

    /// Whether the grant covers `target`.
    #[must_use]
    pub fn matches(&self, target: &str) -> bool {
        if !target.starts_with('/') || has_traversal(target) {
            return false;
        }
        match self {
            Self::Prefix(prefix) => Path::new(target).starts_with(prefix),
            Self::Glob { matcher, .. } => matcher.is_match(target),
        }
    }
}

/// Split a glob at the last `/` before its first wildcard.
fn split_glob_base(pattern: &str) -> (&str, &str) {
    let wildcard = pattern.find(['*', '?', '[', '{']).unwrap_or(pattern.len());
    match pattern[..wildcard].rfind('/') {
        Some(0) | None => ("/", pattern.trim_start_matches('/')),
        Some(slash) => (&pattern[..slash], &pattern[slash.saturating_add(1)..]),
    }
}

/// Resolve `requested` to the physical path the host would touch.
///
/// The deepest existing ancestor is canonicalized, so every symlink on the
/// way is followed, and the components that do not exist yet are appended
/// unchanged. Returns `None` for relative paths, paths with `..`, or when
/// the existing part cannot be resolved.
#[must_use]
pub fn resolve_physical(requested: &str) -> Option<PathBuf> {
    if !requested.starts_with('/') || has_traversal(requested) {
        return None;
    }
    let mut existing = PathBuf::from(requested);
    let mut missing = Vec::new();
    while std::fs::symlink_metadata(&existing).is_err() {
        let name = existing.file_name()?.to_os_string();
        missing.push(name);
        if !existing.pop() {
            return None;
        }
    }
    let mut resolved = std::fs::canonicalize(&existing).ok()?;
    for component in missing.into_iter().rev() {
        resolved.push(component);
    }
    Some(resolved)
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prefix(p) => write!(f, "{}", p.display()),
            Self::Glob { source, .. } => f.write_str(source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostMatch {
    Any,
    Exact(String),
    Suffix(String),
}

/// An outbound destination grant: `*`, `host`, or `*.suffix`, each with an
/// optional `:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    host: HostMatch,
    port: Option<u16>,
}

impl HostPattern {
    /// Compile a manifest destination.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::InvalidPattern`] for an empty host or an
    /// invalid port.
    pub fn parse(pattern: &str) -> PermissionResult<Self> {
        let invalid = |reason: String| PermissionError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };
        if pattern == "*" {
            return Ok(Self {
                host: HostMatch::Any,
                port: None,
            });
        }
        let (host, port) = split_host_port(pattern);
        let port = port
            .map(|p| p.parse::<u16>().map_err(|e| invalid(format!("port: {e}"))))
            .transpose()?;
        let host = host.to_ascii_lowercase();
        let host = if host == "*" {
            HostMatch::Any
        } else if let Some(suffix) = host.strip_prefix("*.") {
            if suffix.is_empty() {
                return Err(invalid("empty host suffix".to_string()));
            }
            HostMatch::Suffix(suffix.to_string())
        } else if host.is_empty() {
            return Err(invalid("empty host".to_string()));
        } else {
            HostMatch::Exact(host)
        };
        Ok(Self { host, port })
    }

    /// Whether the grant covers `target` (`host:port`).
    #[must_use]
    pub fn matches(&self, target: &str) -> bool {
        let (host, port) = split_host_port(target);
        let Some(port) = port.and_then(|p| p.parse::<u16>().ok()) else {
            return false;
        };
        if self.port.is_some_and(|p| p != port) {
            return false;
        }
        let host = host.to_ascii_lowercase();
        match &self.host {
            HostMatch::Any => !host.is_empty(),
            HostMatch::Exact(h) => *h == host,
            HostMatch::Suffix(suffix) => host
                .strip_suffix(suffix.as_str())
                .is_some_and(|rest| rest.len() > 1 && rest.ends_with('.')),
        }
    }
}

/// An inbound listener grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPattern {
    interface: IpAddr,
    port: u16,
}

impl InboundPattern {
    /// Compile an inbound rule.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::InvalidPattern`] if the interface is not an
    /// IP address.
    pub fn new(interface: &str, port: u16) -> PermissionResult<Self> {
        let interface = interface
            .parse()
            .map_err(|e: std::net::AddrParseError| PermissionError::InvalidPattern {
                pattern: format!("{interface}:{port}"),
                reason: e.to_string(),
            })?;
        Ok(Self { interface, port })
    }

    /// Whether the grant covers `target` (`interface:port`).
    #[must_use]
    pub fn matches(&self, target: &str) -> bool {
        let (iface, port) = split_host_port(target);
        let iface = iface.trim_start_matches('[').trim_end_matches(']');
        port.and_then(|p| p.parse::<u16>().ok()) == Some(self.port)
            && iface.parse::<IpAddr>().ok() == Some(self.interface)
    }
}

/// Whether queue `topic` matches `pattern`. Segments are dot-separated and a
/// `*` segment in the pattern matches exactly one segment.
#[must_use]
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut p = pattern.split('.');
    let mut t = topic.split('.');
    loop {
        match (p.next(), t.next()) {
            (None, None) => return true,
            (Some(ps), Some(ts)) if !ts.is_empty() && (ps == "*" || ps == ts) => {},
            _ => return false,
        }
    }
}

/// Split `host:port`. The port is whatever follows the last `:` when it is
/// all digits.
fn split_host_port(s: &str) -> (&str, Option<&str>) {
    match s.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            (host, Some(port))
        },
        _ => (s, None),
    }
}
