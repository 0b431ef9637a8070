//! Plugin directory discovery.
//!
//! Each subdirectory of a plugin root that contains `plugin.toml` is a
//! plugin. A root that is itself a plugin directory is accepted too.
//! Nothing is parsed here; validation happens when the loader reads the
//! manifest, so a broken plugin is reported through the usual diagnostics
//! instead of vanishing from the scan.

use std::path::{Path, PathBuf};

use plughost_manifest::MANIFEST_FILE_NAME;
use tracing::{debug, info, warn};

/// Plugin directories under `roots`, sorted and without duplicates.
///
/// Missing roots are skipped; unreadable roots are logged and skipped.
#[must_use]
pub fn discover_plugin_dirs(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for root in roots {
        if !root.exists() {
            debug!(root = %root.display(), "plugin root does not exist, skipping");
            continue;
        }
        if is_plugin_dir(root) {
            dirs.push(root.clone());
            continue;
        }
        match scan(root) {
            Ok(found) => dirs.extend(found),
            Err(e) => warn!(root = %root.display(), error = %e, "failed to scan plugin root"),
        }
    }
    dirs.sort();
    dirs.dedup();
    info!(count = dirs.len(), "discovered plugin directories");
    dirs
}

/// Whether `dir` holds a plugin manifest.
#[must_use]
pub fn is_plugin_dir(dir: &Path) -> bool {
    dir.join(MANIFEST_FILE_NAME).is_file()
}

fn scan(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() && is_plugin_dir(&path) {
            debug!(path = %path.display(), "found plugin directory");
            found.push(path);
        }
    }
    Ok(found)
}
