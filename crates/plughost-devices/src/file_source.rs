//! `FileChanged` events for watched paths.
//!
//! ```text
//! filesystem events (notify)
//!   → filter to configured paths, skip ignored dirs
//!   → debounce per file
//!   → BLAKE3 hash contents (absent when removed)
//!   → compare to cached hash
//!   → append FileChanged
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher};
use plughost_crypto::ContentHash;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DeviceError, DeviceResult};
use crate::event::{
    DeviceAttributes, DeviceEvent, EventKind, EventSource, NewEvent, file_subject_id,
};
use crate::log::EventLog;

/// Default debounce for file changes.
pub const DEFAULT_FILE_DEBOUNCE: Duration = Duration::from_millis(250);

/// Directory names never reported.
const IGNORED_DIRS: &[&str] = &[".git", "target", "node_modules"];

/// What hashing a changed path found.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Observed {
    Present(String),
    Removed,
    Unreadable,
}

/// Watches files and directories and logs content changes.
pub struct FileChangeSource {
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
    debounce: Duration,
    log: Arc<dyn EventLog>,
    stream: String,
    hash_cache: HashMap<PathBuf, Observed>,
    watcher: RecommendedWatcher,
    raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

impl FileChangeSource {
    /// Create a source for `paths` appending to `stream`.
    ///
    /// Existing directories are watched recursively; anything else is treated
    /// as a file and watched through its parent, which keeps working when an
    /// editor replaces the file by renaming over it.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Watcher`] if the platform watcher cannot start.
    pub fn new(
        log: Arc<dyn EventLog>,
        stream: impl Into<String>,
        paths: Vec<PathBuf>,
    ) -> DeviceResult<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| DeviceError::Watcher(e.to_string()))?;

        let (dirs, files): (Vec<PathBuf>, Vec<PathBuf>) =
            paths.into_iter().partition(|p| p.is_dir());
        Ok(Self {
            files,
            dirs,
            debounce: DEFAULT_FILE_DEBOUNCE,
            log,
            stream: stream.into(),
            hash_cache: HashMap::new(),
            watcher,
            raw_rx,
        })
    }

    /// Set the debounce window.
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Run until `shutdown` fires or the platform watcher stops.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.start_watching();
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
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in ready {
                        pending.remove(&path);
                        if let Err(e) = self.process(&path).await {
                            warn!(path = %path.display(), error = %e, "failed to log file change");
                        }
                    }
                }

                event = self.raw_rx.recv() => match event {
                    Some(Ok(ev)) => self.handle_raw_event(&ev, &mut pending),
                    Some(Err(e)) => warn!(error = %e, "file watcher error"),
                    None => {
                        debug!("file watcher channel closed, stopping");
                        break;
                    },
                },
            }
        }
    }

    fn start_watching(&mut self) {
        let mut targets: Vec<(PathBuf, RecursiveMode)> = self
            .dirs
            .iter()
            .map(|d| (d.clone(), RecursiveMode::Recursive))
            .collect();
        for file in &self.files {
            if let Some(parent) = file.parent() {
                let parent = parent.to_path_buf();
                if !targets.iter().any(|(p, _)| *p == parent) {
                    targets.push((parent, RecursiveMode::NonRecursive));
                }
            }
        }
        for (path, mode) in targets {
            match self.watcher.watch(&path, mode) {
                Ok(()) => info!(path = %path.display(), "watching for file changes"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to watch path"),
            }
        }
    }

    fn handle_raw_event(
        &self,
        event: &Event,
        pending: &mut HashMap<PathBuf, tokio::time::Instant>,
    ) {
        match event.kind {
            NotifyKind::Create(_) | NotifyKind::Modify(_) | NotifyKind::Remove(_) => {},
            _ => return,
        }
        for path in &event.paths {
            if !self.is_watched(path) || path.is_dir() {
                continue;
            }
            #[allow(clippy::arithmetic_side_effects)]
            // Instant + Duration cannot overflow in practice
            let deadline = tokio::time::Instant::now() + self.debounce;
            pending.insert(path.clone(), deadline);
        }
    }

    fn is_watched(&self, path: &Path) -> bool {
        let ignored = path.components().any(|c| {
            c.as_os_str()
                .to_str()
                .is_some_and(|s| IGNORED_DIRS.contains(&s))
        });
        !ignored
            && (self.files.iter().any(|f| f == path)
                || self.dirs.iter().any(|d| path.starts_with(d)))
    }

    /// Hash `path` and log a `FileChanged` if its contents changed.
    async fn process(&mut self, path: &Path) -> DeviceResult<Option<DeviceEvent>> {
        let target = path.to_path_buf();
        let observed = tokio::task::spawn_blocking(move || observe(&target))
            .await
            .unwrap_or(Observed::Unreadable);

        if self.hash_cache.get(path) == Some(&observed) && observed != Observed::Unreadable {
            debug!(path = %path.display(), "contents unchanged, skipping");
            return Ok(None);
        }
        self.hash_cache.insert(path.to_path_buf(), observed.clone());

        let (hash, degraded) = match observed {
            Observed::Present(hash) => (Some(hash), false),
            Observed::Removed => (None, false),
            Observed::Unreadable => (None, true),
        };
        let event = NewEvent {
            kind: EventKind::FileChanged,
            subject_id: file_subject_id(path),
            attributes: DeviceAttributes {
                path: Some(path.display().to_string()),
                hash,
                ..Default::default()
            },
            degraded,
            source: EventSource::Callback,
        };
        let logged = self.log.append(&self.stream, event).await?;
        info!(id = logged.id, subject_id = %logged.subject_id, "file change logged");
        Ok(Some(logged))
    }
}

impl std::fmt::Debug for FileChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChangeSource")
            .field("files", &self.files)
            .field("dirs", &self.dirs)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

fn observe(path: &Path) -> Observed {
    if !path.exists() {
        return Observed::Removed;
    }
    match ContentHash::hash_file(path) {
        Ok(hash) => Observed::Present(hash.to_hex()),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "file unreadable");
            Observed::Unreadable
        },
    }
}
