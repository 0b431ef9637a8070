//! Code payload: every file shipped next to the manifest.

use std::io;
use std::path::Path;

use plughost_crypto::ContentHash;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::MANIFEST_FILE_NAME;

const PAYLOAD_DOMAIN: &str = "plughost code payload v1";

/// One payload file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFile {
    /// Path relative to the plugin directory, `/`-separated.
    pub path: String,
    /// BLAKE3 of the contents.
    pub hash: ContentHash,
    /// Size in bytes.
    pub size: u64,
}

/// The set of files covered by a manifest signature, sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePayload {
    files: Vec<PayloadFile>,
}

impl CodePayload {
    /// Build a payload from in-memory files.
    #[must_use]
    pub fn from_files<P: Into<String>>(files: impl IntoIterator<Item = (P, Vec<u8>)>) -> Self {
        let mut files: Vec<PayloadFile> = files
            .into_iter()
            .map(|(path, contents)| PayloadFile {
                path: path.into(),
                hash: ContentHash::hash(&contents),
                size: contents.len() as u64,
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self { files }
    }

    /// Collect every regular file under `dir`, excluding the manifest and
    /// hidden entries.
    ///
    /// # Errors
    ///
    /// Fails if the tree cannot be read or contains a symlink.
    pub fn from_dir(dir: &Path) -> io::Result<Self> {
        let mut files = Vec::new();
        let walker = WalkDir::new(dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = entry.map_err(io::Error::other)?;
            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(io::Error::other)?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if file_type.is_symlink() {
                return Err(io::Error::other(format!(
                    "symlinks are not allowed in plugin payloads: {rel}"
                )));
            }
            if rel == MANIFEST_FILE_NAME {
                continue;
            }
            let hash = ContentHash::hash_file(entry.path()).map_err(io::Error::other)?;
            let size = entry.metadata().map_err(io::Error::other)?.len();
            files.push(PayloadFile {
                path: rel,
                hash,
                size,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self { files })
    }

    /// Files, sorted by path.
    #[must_use]
    pub fn files(&self) -> &[PayloadFile] {
        &self.files
    }

    /// Whether the payload holds `path`. A leading `./` is ignored.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        let path = path.strip_prefix("./").unwrap_or(path);
        self.files.iter().any(|f| f.path == path)
    }

    /// Total size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.iter().fold(0u64, |acc, f| acc.saturating_add(f.size))
    }

    /// Digest binding every path to its content hash.
    #[must_use]
    pub fn digest(&self) -> ContentHash {
        let mut buf = Vec::with_capacity(self.files.len().saturating_mul(80));
        for file in &self.files {
            buf.extend_from_slice(&(file.path.len() as u64).to_le_bytes());
            buf.extend_from_slice(file.path.as_bytes());
            buf.extend_from_slice(file.hash.as_bytes());
        }
        ContentHash::hash_with_domain(PAYLOAD_DOMAIN, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_dir_skips_manifest_and_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE_NAME), "name = 'x'").unwrap();
        std::fs::write(dir.path().join("main.sh"), "echo hi").unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/util.sh"), "true").unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();

        let payload = CodePayload::from_dir(dir.path()).unwrap();
        let paths: Vec<_> = payload.files().iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["lib/util.sh", "main.sh"]);
        assert!(payload.contains("./main.sh"));
        assert_eq!(payload.total_size(), 11);
    }

    #[test]
    fn digest_tracks_content_and_paths() {
        let a = CodePayload::from_files([("main.sh", b"echo 1".to_vec())]);
        let b = CodePayload::from_files([("main.sh", b"echo 2".to_vec())]);
        let c = CodePayload::from_files([("other.sh", b"echo 1".to_vec())]);
        assert_ne!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(
            a.digest(),
            CodePayload::from_files([("main.sh", b"echo 1".to_vec())]).digest()
        );
    }

    #[test]
    fn in_memory_and_on_disk_agree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.py"), "print(2)").unwrap();
        std::fs::write(dir.path().join("a.py"), "print(1)").unwrap();
        let disk = CodePayload::from_dir(dir.path()).unwrap();
        let memory = CodePayload::from_files([
            ("b.py", b"print(2)".to_vec()),
            ("a.py", b"print(1)".to_vec()),
        ]);
        assert_eq!(disk.digest(), memory.digest());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("link.sh")).unwrap();
        assert!(CodePayload::from_dir(dir.path()).is_err());
    }
}
