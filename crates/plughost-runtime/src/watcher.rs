//! Plugin directory watcher for hot reload.
//!
//! ```text
//! filesystem events (notify)
//!   → drop ignored dirs (.git, target, node_modules)
//!   → map to plugin directory (nearest ancestor with plugin.toml)
//!   → debounce per plugin
//!   → manifest gone?  PluginRemoved
//!   → blake3 source tree hash, unchanged? skip
//!   → PluginChanged
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use plughost_crypto::ContentHash;
use plughost_manifest::MANIFEST_FILE_NAME;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::discovery::discover_plugin_dirs;
use crate::error::{RuntimeError, RuntimeResult};

/// Default debounce per plugin directory.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Directory names never watched or hashed.
pub const IGNORED_DIRS: &[&str] = &[".git", "target", "node_modules"];

/// What the watcher reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A plugin directory's contents changed.
    PluginChanged {
        /// Directory holding `plugin.toml`.
        plugin_dir: PathBuf,
        /// BLAKE3 hex over the directory tree after the change.
        source_hash: String,
    },
    /// A previously seen plugin directory lost its manifest.
    PluginRemoved {
        /// The directory.
        plugin_dir: PathBuf,
    },
    /// Non-fatal watcher failure.
    Error(String),
}

/// Watcher settings.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Plugin roots, watched recursively.
    pub watch_paths: Vec<PathBuf>,
    /// Quiet period before a directory is re-hashed.
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            watch_paths: Vec::new(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Watches plugin roots and reports content changes per plugin directory.
pub struct PluginWatcher {
    config: WatcherConfig,
    hash_cache: HashMap<PathBuf, String>,
    watcher: RecommendedWatcher,
    raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    event_tx: mpsc::Sender<WatchEvent>,
}

impl PluginWatcher {
    /// Create a watcher and the receiver its events arrive on.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Startup`] if the platform watcher cannot be
    /// created.
    pub fn new(config: WatcherConfig) -> RuntimeResult<(Self, mpsc::Receiver<WatchEvent>)> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| RuntimeError::Startup(format!("filesystem watcher: {e}")))?;
        Ok((
            Self {
                config,
                hash_cache: HashMap::new(),
                watcher,
                raw_rx,
                event_tx,
            },
            event_rx,
        ))
    }

    /// Watch until `shutdown` fires, the receiver is dropped, or the
    /// platform watcher stops.
    ///
    /// Plugins present at startup are hashed first, so touching a file
    /// without changing it is not reported and their removal is.
    pub async fn run(mut self, shutdown: CancellationToken) {
        for path in &self.config.watch_paths {
            if !path.exists() {
                warn!(path = %path.display(), "plugin root does not exist, not watching");
                continue;
            }
            match self.watcher.watch(path, RecursiveMode::Recursive) {
                Ok(()) => info!(path = %path.display(), "watching plugin root"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to watch plugin root"),
            }
        }
        self.prime().await;

        let debounce = self.config.debounce;
        let mut pending: HashMap<PathBuf, tokio::time::Instant> = HashMap::new();
        loop {
            let next_deadline = pending.values().copied().min();
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                () = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let now = tokio::time::Instant::now();
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(dir, _)| dir.clone())
                        .collect();
                    for dir in ready {
                        pending.remove(&dir);
                        if !self.process(&dir).await {
                            return;
                        }
                    }
                }

                event = self.raw_rx.recv() => match event {
                    Some(Ok(ev)) => self.handle_raw_event(&ev, &mut pending, debounce),
                    Some(Err(e)) => {
                        warn!(error = %e, "filesystem watcher error");
                        if self.event_tx.send(WatchEvent::Error(e.to_string())).await.is_err() {
                            return;
                        }
                    },
                    None => {
                        debug!("filesystem watcher channel closed, stopping");
                        break;
                    },
                },
            }
        }
    }

    async fn prime(&mut self) {
        let roots = self.config.watch_paths.clone();
        let hashed = tokio::task::spawn_blocking(move || {
            discover_plugin_dirs(&roots)
                .into_iter()
                .filter_map(|dir| compute_source_hash(&dir).ok().map(|h| (dir, h)))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();
        debug!(plugins = hashed.len(), "primed source hashes");
        self.hash_cache.extend(hashed);
    }

    fn handle_raw_event(
        &self,
        event: &Event,
        pending: &mut HashMap<PathBuf, tokio::time::Instant>,
        debounce: Duration,
    ) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {},
            _ => return,
        }
        for path in &event.paths {
            if is_in_ignored_dir(path) {
                continue;
            }
            if let Some(dir) = self.resolve_plugin_dir(path) {
                debug!(path = %path.display(), plugin_dir = %dir.display(), "change in plugin directory");
                #[allow(clippy::arithmetic_side_effects)]
                // Instant + Duration cannot overflow in practice
                let deadline = tokio::time::Instant::now() + debounce;
                pending.insert(dir, deadline);
            }
        }
    }

    /// Nearest ancestor of `path` that has a manifest or was a plugin
    /// directory before, stopping at the watch roots.
    fn resolve_plugin_dir(&self, path: &Path) -> Option<PathBuf> {
        let mut current = path.parent()?.to_path_buf();
        loop {
            if current.join(MANIFEST_FILE_NAME).exists() || self.hash_cache.contains_key(&current)
            {
                return Some(current);
            }
            if self
                .config
                .watch_paths
                .iter()
                .any(|root| current.components().eq(root.components()))
            {
                return None;
            }
            current = current.parent()?.to_path_buf();
        }
    }

    /// Report what happened to `dir`. Returns `false` once the receiver is
    /// gone.
    async fn process(&mut self, dir: &Path) -> bool {
        if !dir.join(MANIFEST_FILE_NAME).exists() {
            if self.hash_cache.remove(dir).is_none() {
                return true;
            }
            info!(plugin_dir = %dir.display(), "plugin manifest removed");
            return self
                .send(WatchEvent::PluginRemoved {
                    plugin_dir: dir.to_path_buf(),
                })
                .await;
        }

        let target = dir.to_path_buf();
        let hashed = match tokio::task::spawn_blocking(move || compute_source_hash(&target)).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "hash task failed");
                return true;
            },
        };
        match hashed {
            Ok(hash) => {
                if self.hash_cache.get(dir).is_some_and(|h| *h == hash) {
                    debug!(plugin_dir = %dir.display(), "source hash unchanged, skipping");
                    return true;
                }
                info!(plugin_dir = %dir.display(), hash = %hash, "plugin source changed");
                self.hash_cache.insert(dir.to_path_buf(), hash.clone());
                self.send(WatchEvent::PluginChanged {
                    plugin_dir: dir.to_path_buf(),
                    source_hash: hash,
                })
                .await
            },
            Err(e) => {
                warn!(plugin_dir = %dir.display(), error = %e, "failed to hash plugin directory");
                self.send(WatchEvent::Error(format!("hash failed for {}: {e}", dir.display())))
                    .await
            },
        }
    }

    async fn send(&self, event: WatchEvent) -> bool {
        if self.event_tx.send(event).await.is_err() {
            debug!("watch event receiver dropped, stopping");
            return false;
        }
        true
    }
}

impl std::fmt::Debug for PluginWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginWatcher")
            .field("config", &self.config)
            .field("known", &self.hash_cache.len())
            .finish_non_exhaustive()
    }
}

fn is_in_ignored_dir(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| IGNORED_DIRS.contains(&s))
    })
}

/// BLAKE3 over the file tree under `dir`, manifest included.
///
/// Files are visited in name order per directory. Each contributes its
/// length-prefixed relative path and its own BLAKE3 digest, so a rename
/// changes the result. Ignored directories and symlinks are skipped, as are
/// files that vanish or turn unreadable mid-walk.
///
/// # Errors
///
/// Returns an error if `dir` itself cannot be read.
pub fn compute_source_hash(dir: &Path) -> std::io::Result<String> {
    std::fs::read_dir(dir)?;
    let tree = WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .is_some_and(|name| IGNORED_DIRS.contains(&name)))
        });

    let mut hasher = blake3::Hasher::new();
    for entry in tree.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let digest = match ContentHash::hash_file(entry.path()) {
            Ok(digest) => digest,
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "skipping unreadable file");
                continue;
            },
        };
        let rel = rel.to_string_lossy();
        hasher.update(&(rel.len() as u64).to_le_bytes());
        hasher.update(rel.as_bytes());
        hasher.update(digest.as_bytes());
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join("lib")).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE_NAME), "name = \"demo\"").unwrap();
        std::fs::write(dir.join("lib/main.sh"), "echo hi").unwrap();
        dir
    }

    #[test]
    fn hash_tracks_content_and_names() {
        let root = tempfile::tempdir().unwrap();
        let dir = plugin(root.path(), "demo");
        let first = compute_source_hash(&dir).unwrap();
        assert_eq!(first, compute_source_hash(&dir).unwrap());

        std::fs::write(dir.join("lib/main.sh"), "echo bye").unwrap();
        let changed = compute_source_hash(&dir).unwrap();
        assert_ne!(first, changed);

        std::fs::rename(dir.join("lib/main.sh"), dir.join("lib/other.sh")).unwrap();
        assert_ne!(changed, compute_source_hash(&dir).unwrap());
    }

    #[test]
    fn hash_skips_ignored_dirs() {
        let root = tempfile::tempdir().unwrap();
        let dir = plugin(root.path(), "demo");
        let before = compute_source_hash(&dir).unwrap();
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        std::fs::write(dir.join(".git/HEAD"), "ref").unwrap();
        assert_eq!(before, compute_source_hash(&dir).unwrap());
    }

    #[test]
    fn resolves_nearest_plugin_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = plugin(root.path(), "demo");
        let (watcher, _rx) = PluginWatcher::new(WatcherConfig {
            watch_paths: vec![root.path().to_path_buf()],
            debounce: Duration::from_millis(10),
        })
        .unwrap();
        assert_eq!(
            watcher.resolve_plugin_dir(&dir.join("lib/main.sh")),
            Some(dir.clone())
        );
        assert_eq!(watcher.resolve_plugin_dir(&dir.join(MANIFEST_FILE_NAME)), Some(dir));
        assert!(watcher.resolve_plugin_dir(&root.path().join("loose.txt")).is_none());
        assert!(is_in_ignored_dir(Path::new("/p/demo/node_modules/x.js")));
    }

    #[tokio::test]
    async fn reports_change_then_removal() {
        let root = tempfile::tempdir().unwrap();
        let dir = plugin(root.path(), "demo");
        let (watcher, mut rx) = PluginWatcher::new(WatcherConfig {
            watch_paths: vec![root.path().to_path_buf()],
            debounce: Duration::from_millis(50),
        })
        .unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(dir.join("lib/main.sh"), "echo changed").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, WatchEvent::PluginChanged { ref plugin_dir, .. } if *plugin_dir == dir));

        std::fs::remove_file(dir.join(MANIFEST_FILE_NAME)).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, WatchEvent::PluginRemoved { plugin_dir: dir });

        shutdown.cancel();
        handle.await.unwrap();
    }
}
