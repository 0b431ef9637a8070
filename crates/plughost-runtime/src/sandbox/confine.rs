//! OS confinement for plugin processes.
//!
//! The child is restricted before `exec` so it cannot reach past its grants
//! even when it never asks the host:
//!
//! - Landlock path rules: the staged payload and system directories are
//!   read-only, each filesystem grant is opened with its own mode, and
//!   everything else is denied. TCP bind and connect are denied outright,
//!   since network access goes through host calls.
//! - rlimits: no core dumps, a bounded descriptor table, and an address
//!   space ceiling well above the resident memory limit so the sampler
//!   still reports the breach.
//!
//! Rules are prepared in the parent (opening path descriptors allocates)
//! and only the raw syscalls run between `fork` and `exec`.

#![allow(unsafe_code)]

use std::path::{Path, PathBuf};

use tokio::process::Command;

use super::LaunchSpec;

/// Directories every plugin process may read and execute from.
const SYSTEM_READ_PATHS: &[&str] = &["/bin", "/sbin", "/lib", "/lib32", "/lib64", "/usr", "/etc"];

/// Device nodes every plugin process may read and write.
const SYSTEM_DEVICES: &[&str] = &["/dev/null", "/dev/zero", "/dev/urandom"];

/// Open descriptor ceiling.
const MAX_OPEN_FILES: u64 = 256;

/// Address space allowed on top of the heap limit, for code, stacks and
/// allocator slack.
const ADDRESS_SPACE_HEADROOM_MB: u64 = 512;

/// Multiple of the heap limit reserved as address space.
const ADDRESS_SPACE_FACTOR: u64 = 4;

/// One Landlock path rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    /// Directory or file the rule covers, with everything below it.
    pub path: PathBuf,
    /// Read and execute.
    pub read: bool,
    /// Create, write and remove.
    pub write: bool,
}

impl PathRule {
    fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read: true,
            write: false,
        }
    }
}

/// What a plugin process is confined to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confinement {
    rules: Vec<PathRule>,
    address_space_bytes: Option<u64>,
    max_open_files: u64,
}

impl Confinement {
    /// Derive the confinement of the process launched for `spec`.
    /// `interpreter` is the program run when it is not the entry point.
    #[must_use]
    pub fn for_launch(spec: &LaunchSpec, interpreter: Option<&Path>) -> Self {
        let mut rules = vec![PathRule::read_only(&spec.dir)];
        rules.extend(SYSTEM_READ_PATHS.iter().map(PathRule::read_only));
        if let Some(parent) = interpreter.and_then(Path::parent)
            && parent.is_absolute()
            && !SYSTEM_READ_PATHS.iter().any(|p| parent.starts_with(p))
        {
            rules.push(PathRule::read_only(parent));
        }
        rules.extend(SYSTEM_DEVICES.iter().map(|device| PathRule {
            path: PathBuf::from(device),
            read: true,
            write: true,
        }));
        rules.extend(spec.grants.fs_roots().into_iter().map(|(path, mode)| PathRule {
            path,
            read: mode.allows_read(),
            write: mode.allows_write(),
        }));

        let heap_mb = spec.manifest.isolation_limits.max_heap_mb;
        let address_space_bytes = (heap_mb > 0).then(|| {
            heap_mb
                .saturating_mul(ADDRESS_SPACE_FACTOR)
                .saturating_add(ADDRESS_SPACE_HEADROOM_MB)
                .saturating_mul(1024 * 1024)
        });
        Self {
            rules,
            address_space_bytes,
            max_open_files: MAX_OPEN_FILES,
        }
    }

    /// Path rules, in the order they are added.
    #[must_use]
    pub fn rules(&self) -> &[PathRule] {
        &self.rules
    }

    /// `RLIMIT_AS` in bytes, when the manifest sets a heap limit.
    #[must_use]
    pub fn address_space_bytes(&self) -> Option<u64> {
        self.address_space_bytes
    }

    /// Install the confinement on `cmd`, to take effect in the child.
    #[cfg(target_os = "linux")]
    pub(crate) fn apply(&self, cmd: &mut Command) {
        let mut prepared = Some(landlock_rules::prepare(&self.rules));
        let address_space = self.address_space_bytes;
        let max_open_files = self.max_open_files;
        // SAFETY: pre_exec runs between fork() and exec(). The closure only
        // issues setrlimit and the Landlock syscalls on descriptors opened
        // above. Error values may allocate, but an error aborts the spawn.
        unsafe {
            cmd.pre_exec(move || {
                apply_rlimits(address_space, max_open_files)?;
                let rules = prepared
                    .take()
                    .ok_or_else(|| std::io::Error::other("confinement applied twice"))?;
                landlock_rules::enforce(rules)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::PermissionDenied, e))
            });
        }
    }

    /// Install the confinement on `cmd`. Only rlimits are available here.
    #[cfg(all(unix, not(target_os = "linux")))]
    pub(crate) fn apply(&self, cmd: &mut Command) {
        let address_space = self.address_space_bytes;
        let max_open_files = self.max_open_files;
        // SAFETY: the closure only issues setrlimit.
        unsafe {
            cmd.pre_exec(move || apply_rlimits(address_space, max_open_files));
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn apply(&self, _cmd: &mut Command) {}
}

#[cfg(unix)]
fn apply_rlimits(address_space: Option<u64>, max_open_files: u64) -> std::io::Result<()> {
    use nix::sys::resource::{Resource, setrlimit};

    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    setrlimit(Resource::RLIMIT_NOFILE, max_open_files, max_open_files)?;
    if let Some(bytes) = address_space {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    Ok(())
}

/// Whether this kernel enforces Landlock for the current process.
#[must_use]
pub fn landlock_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        landlock_rules::available()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg(target_os = "linux")]
mod landlock_rules {
    use landlock::{
        ABI, Access, AccessFs, AccessNet, BitFlags, CompatLevel, Compatible, PathBeneath, PathFd,
        Ruleset, RulesetAttr, RulesetCreatedAttr,
    };

    use super::PathRule;

    const ABI_TARGET: ABI = ABI::V5;

    /// Pre-opened `(fd, read, write, is_dir)` tuples.
    pub(super) struct Prepared {
        rules: Vec<(PathFd, bool, bool, bool)>,
    }

    /// Open a descriptor per rule. Missing paths are skipped.
    pub(super) fn prepare(rules: &[PathRule]) -> Prepared {
        let rules = rules
            .iter()
            .filter(|rule| rule.read || rule.write)
            .filter_map(|rule| {
                let is_dir = rule.path.is_dir();
                PathFd::new(&rule.path)
                    .ok()
                    .map(|fd| (fd, rule.read, rule.write, is_dir))
            })
            .collect();
        Prepared { rules }
    }

    /// Create the ruleset and restrict the calling process. A kernel
    /// without Landlock leaves the process unrestricted.
    pub(super) fn enforce(prepared: Prepared) -> Result<(), String> {
        let abi = ABI_TARGET;
        let mut ruleset = Ruleset::default()
            .set_compatibility(CompatLevel::BestEffort)
            .handle_access(AccessFs::from_all(abi))
            .map_err(|e| format!("landlock ruleset: {e}"))?
            .handle_access(AccessNet::from_all(abi))
            .map_err(|e| format!("landlock ruleset: {e}"))?
            .create()
            .map_err(|e| format!("landlock ruleset: {e}"))?;

        for (fd, read, write, is_dir) in prepared.rules {
            let mut access: BitFlags<AccessFs> = match (read, write) {
                (true, true) => AccessFs::from_all(abi),
                (true, false) => AccessFs::from_read(abi),
                (false, true) => AccessFs::from_write(abi),
                (false, false) => continue,
            };
            if !is_dir {
                access &= AccessFs::from_file(abi);
            }
            ruleset = ruleset
                .add_rule(PathBeneath::new(fd, access))
                .map_err(|e| format!("landlock rule: {e}"))?;
        }

        ruleset
            .restrict_self()
            .map_err(|e| format!("landlock restrict: {e}"))?;
        Ok(())
    }

    /// Whether a ruleset can be created at all.
    pub(super) fn available() -> bool {
        Ruleset::default()
            .set_compatibility(CompatLevel::HardRequirement)
            .handle_access(AccessFs::from_all(ABI::V1))
            .and_then(|ruleset| ruleset.create())
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use plughost_manifest::Manifest;
    use plughost_permissions::GrantSet;

    use super::*;

    fn spec(permissions: &str, heap_mb: u64) -> LaunchSpec {
        let manifest: Manifest = toml::from_str(&format!(
            r#"
            name = "confined"
            version = "1.0.0"
            entryPoint = "main.sh"

            [permissions]
            {permissions}

            [isolationLimits]
            maxHeapMb = {heap_mb}
            "#
        ))
        .unwrap();
        LaunchSpec {
            instance: manifest.instance_id(),
            generation: 1,
            grants: Arc::new(GrantSet::from_manifest(&manifest).unwrap()),
            manifest: Arc::new(manifest),
            dir: PathBuf::from("/var/lib/plughost/state/staging/abc"),
            entry: PathBuf::from("/var/lib/plughost/state/staging/abc/main.sh"),
        }
    }

    #[test]
    fn rules_follow_the_grants() {
        let spec = spec(
            r#"filesystem = [
                { path = "/srv/plugins-data", mode = "read" },
                { path = "/srv/out/*.json", mode = "readwrite" },
            ]"#,
            64,
        );
        let confinement = Confinement::for_launch(&spec, Some(Path::new("/bin/sh")));
        let rules = confinement.rules();

        assert_eq!(rules[0], PathRule::read_only("/var/lib/plughost/state/staging/abc"));
        assert!(rules.contains(&PathRule::read_only("/usr")));
        assert!(rules.contains(&PathRule::read_only("/srv/plugins-data")));
        assert!(rules.contains(&PathRule {
            path: PathBuf::from("/srv/out"),
            read: true,
            write: true,
        }));
        let writable: Vec<_> = rules
            .iter()
            .filter(|r| r.write)
            .map(|r| r.path.clone())
            .collect();
        assert_eq!(
            writable,
            vec![
                PathBuf::from("/dev/null"),
                PathBuf::from("/dev/zero"),
                PathBuf::from("/dev/urandom"),
                PathBuf::from("/srv/out"),
            ]
        );
        assert!(!rules.iter().any(|r| r.path == Path::new("/tmp")));
    }

    #[test]
    fn interpreter_outside_system_dirs_is_readable() {
        let spec = spec("", 16);
        let confinement = Confinement::for_launch(&spec, Some(Path::new("/opt/node/bin/node")));
        assert!(
            confinement
                .rules()
                .contains(&PathRule::read_only("/opt/node/bin"))
        );
        let system = Confinement::for_launch(&spec, Some(Path::new("/usr/bin/python3")));
        assert!(!system.rules().contains(&PathRule::read_only("/usr/bin")));
    }

    #[test]
    fn address_space_leaves_room_above_the_heap() {
        let confinement = Confinement::for_launch(&spec("", 16), None);
        assert_eq!(
            confinement.address_space_bytes(),
            Some((16 * 4 + 512) * 1024 * 1024)
        );
        assert!(confinement.address_space_bytes().unwrap() > 16 * 1024 * 1024);
    }
}
