//! Private, read-only copies of verified payloads.
//!
//! A plugin directory stays writable after validation, so contexts never
//! run from it. The loader copies every payload file into a fresh directory
//! under the staging root, checks each copy against the hash that was
//! signed, seals the tree read-only and launches from there.

use std::path::{Path, PathBuf};

use plughost_crypto::ContentHash;
use plughost_manifest::ValidatedManifest;
use tempfile::TempDir;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{RuntimeError, RuntimeResult};

/// Where verified payloads are staged.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    /// Stage below `root`, created on first use.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Staging root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy the payload of `validated` into a sealed directory named after
    /// its digest.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Startup`] if the plugin was not validated from
    /// a directory or a file changed since it was hashed, and
    /// [`RuntimeError::Io`] if copying fails.
    pub fn stage(&self, validated: &ValidatedManifest) -> RuntimeResult<StagedPayload> {
        let source = validated.dir().ok_or_else(|| {
            RuntimeError::Startup("plugin was not validated from a directory".to_string())
        })?;
        create_private_dir(&self.root)?;
        let digest = validated.payload_digest().to_hex();
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", digest.get(..16).unwrap_or(digest.as_str())))
            .tempdir_in(&self.root)?;

        for file in validated.payload().files() {
            let contents = std::fs::read(source.join(&file.path))?;
            if ContentHash::hash(&contents) != file.hash {
                return Err(RuntimeError::Startup(format!(
                    "payload file {} changed after it was verified",
                    file.path
                )));
            }
            let target = dir.path().join(&file.path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, &contents)?;
            let executable = is_executable(&source.join(&file.path));
            seal_file(&target, executable)?;
        }
        seal_dirs(dir.path())?;

        let entry = dir.path().join(&validated.manifest().entry_point);
        debug!(
            instance = %validated.instance_id(),
            dir = %dir.path().display(),
            files = validated.payload().files().len(),
            "payload staged"
        );
        Ok(StagedPayload {
            entry,
            dir: Some(dir),
        })
    }
}

/// A sealed payload copy. Removed when dropped.
#[derive(Debug)]
pub struct StagedPayload {
    entry: PathBuf,
    dir: Option<TempDir>,
}

impl StagedPayload {
    /// Staged directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.as_ref().map_or_else(|| Path::new(""), TempDir::path)
    }

    /// Staged entry point.
    #[must_use]
    pub fn entry(&self) -> &Path {
        &self.entry
    }
}

impl Drop for StagedPayload {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        unseal_dirs(dir.path());
        if let Err(e) = dir.close() {
            warn!(error = %e, "failed to remove staged payload");
        }
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

#[cfg(unix)]
fn seal_file(path: &Path, executable: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o555 } else { 0o444 };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn seal_file(path: &Path, _executable: bool) -> std::io::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    std::fs::set_permissions(path, permissions)
}

/// Make every directory in the tree read-only, deepest first.
fn seal_dirs(root: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = entry.map_err(std::io::Error::other)?;
        if entry.file_type().is_dir() {
            set_dir_writable(entry.path(), false)?;
        }
    }
    Ok(())
}

/// Restore write access to every directory so the tree can be removed.
fn unseal_dirs(root: &Path) {
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_dir() {
            let _ = set_dir_writable(entry.path(), true);
        }
    }
}

#[cfg(unix)]
fn set_dir_writable(path: &Path, writable: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if writable { 0o700 } else { 0o555 };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_dir_writable(path: &Path, writable: bool) -> std::io::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_readonly(!writable);
    std::fs::set_permissions(path, permissions)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use plughost_manifest::ManifestValidator;
    use plughost_test::{PluginFixture, TestSigner};

    use super::*;

    fn validated(dir: &Path, signer: &TestSigner) -> ValidatedManifest {
        PluginFixture::script("staged", "1.0.0", "#!/bin/sh\n. ./lib.sh\n")
            .file("lib.sh", "echo signed\n")
            .file("data/table.txt", "1 2 3\n")
            .write_signed(dir, signer)
            .unwrap();
        ManifestValidator::new(Arc::new(signer.registry()), Default::default())
            .validate_dir(dir)
            .unwrap()
    }

    #[test]
    fn staged_copy_is_sealed_and_removed_on_drop() {
        let source = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let signer = TestSigner::new("acme");
        let validated = validated(source.path(), &signer);

        let staged = StagingArea::new(root.path().join("staging"))
            .stage(&validated)
            .unwrap();
        let dir = staged.dir().to_path_buf();
        assert!(dir.starts_with(root.path().join("staging")));
        assert_eq!(staged.entry(), dir.join("main.sh"));
        assert_eq!(
            std::fs::read_to_string(dir.join("lib.sh")).unwrap(),
            "echo signed\n"
        );
        assert!(std::fs::read_to_string(dir.join("data/table.txt")).is_ok());
        assert!(!dir.join(plughost_manifest::MANIFEST_FILE_NAME).exists());
        let sealed = std::fs::metadata(dir.join("lib.sh")).unwrap().permissions();
        assert!(sealed.readonly());
        assert!(std::fs::metadata(&dir).unwrap().permissions().readonly());

        std::fs::write(source.path().join("lib.sh"), "echo unsigned\n").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.join("lib.sh")).unwrap(),
            "echo signed\n"
        );

        drop(staged);
        assert!(!dir.exists());
    }

    #[test]
    fn file_changed_after_validation_is_refused() {
        let source = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let signer = TestSigner::new("acme");
        let validated = validated(source.path(), &signer);
        std::fs::write(source.path().join("lib.sh"), "echo tampered > tampered.txt\n").unwrap();

        let err = StagingArea::new(root.path())
            .stage(&validated)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Startup(ref m) if m.contains("lib.sh")));
        let leftovers = std::fs::read_dir(root.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
