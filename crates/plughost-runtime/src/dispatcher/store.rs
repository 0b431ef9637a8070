//! Durable job storage.
//!
//! Active jobs (pending, running, failed-awaiting-retry) and archived jobs
//! (succeeded, dead-lettered) are kept apart so recovery only scans what
//! may still run. Inserts are idempotent on the job id across both sets,
//! which is what makes event-derived jobs exactly-once per delivery.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fs2::FileExt;
use plughost_core::JobId;
use tracing::{debug, warn};

use super::job::{Job, JobState};
use crate::error::{RuntimeError, RuntimeResult};

/// Job persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new job. Returns `false`, storing nothing, if a job with the
    /// same id exists, active or archived.
    async fn insert(&self, job: &Job) -> RuntimeResult<bool>;

    /// Replace an active job.
    async fn update(&self, job: &Job) -> RuntimeResult<()>;

    /// Move a job to the archive in its final state.
    async fn archive(&self, job: &Job) -> RuntimeResult<()>;

    /// Look a job up in either set.
    async fn get(&self, id: JobId) -> RuntimeResult<Option<Job>>;

    /// Active jobs, oldest first.
    async fn active(&self) -> RuntimeResult<Vec<Job>>;

    /// Archived dead-lettered jobs, oldest first.
    async fn dead_letters(&self) -> RuntimeResult<Vec<Job>>;

    /// Move an archived job back to the active set as `job`.
    async fn restore(&self, job: &Job) -> RuntimeResult<()>;
}

fn by_age(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

/// Archived jobs kept by a [`MemoryJobStore`] unless configured otherwise.
pub const DEFAULT_ARCHIVE_LIMIT: usize = 10_000;

#[derive(Debug, Default)]
struct Sets {
    active: HashMap<JobId, Job>,
    archive: HashMap<JobId, Job>,
    /// Archive ids, oldest first.
    archived_order: VecDeque<JobId>,
}

/// In-memory store, for tests and embedders that do not need durability.
///
/// The archive is capped: once it holds more than the limit, the jobs
/// archived earliest are evicted and their ids can be inserted again.
#[derive(Debug)]
pub struct MemoryJobStore {
    sets: Mutex<Sets>,
    archive_limit: usize,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self {
            sets: Mutex::new(Sets::default()),
            archive_limit: DEFAULT_ARCHIVE_LIMIT,
        }
    }
}

impl MemoryJobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` archived jobs.
    #[must_use]
    pub fn with_archive_limit(mut self, limit: usize) -> Self {
        self.archive_limit = limit;
        self
    }

    /// Number of archived jobs held.
    #[must_use]
    pub fn archived_len(&self) -> usize {
        self.lock().archive.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Sets> {
        self.sets.lock().unwrap_or_else(|e| {
            tracing::warn!("job store lock poisoned, recovering");
            e.into_inner()
        })
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> RuntimeResult<bool> {
        let mut sets = self.lock();
        if sets.active.contains_key(&job.id) || sets.archive.contains_key(&job.id) {
            return Ok(false);
        }
        sets.active.insert(job.id, job.clone());
        Ok(true)
    }

    async fn update(&self, job: &Job) -> RuntimeResult<()> {
        let mut sets = self.lock();
        match sets.active.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            },
            None => Err(RuntimeError::NotFound(format!("active job {}", job.id))),
        }
    }

    async fn archive(&self, job: &Job) -> RuntimeResult<()> {
        let mut sets = self.lock();
        sets.active.remove(&job.id);
        if sets.archive.insert(job.id, job.clone()).is_none() {
            sets.archived_order.push_back(job.id);
        }
        while sets.archive.len() > self.archive_limit {
            let Some(oldest) = sets.archived_order.pop_front() else {
                break;
            };
            if sets.archive.remove(&oldest).is_some() {
                debug!(job = %oldest, "evicted archived job");
            }
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> RuntimeResult<Option<Job>> {
        let sets = self.lock();
        Ok(sets
            .active
            .get(&id)
            .or_else(|| sets.archive.get(&id))
            .cloned())
    }

    async fn active(&self) -> RuntimeResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self.lock().active.values().cloned().collect();
        by_age(&mut jobs);
        Ok(jobs)
    }

    async fn dead_letters(&self) -> RuntimeResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .lock()
            .archive
            .values()
            .filter(|j| j.state == JobState::DeadLettered)
            .cloned()
            .collect();
        by_age(&mut jobs);
        Ok(jobs)
    }

    async fn restore(&self, job: &Job) -> RuntimeResult<()> {
        let mut sets = self.lock();
        if sets.archive.remove(&job.id).is_none() {
            return Err(RuntimeError::NotFound(format!("archived job {}", job.id)));
        }
        sets.archived_order.retain(|id| *id != job.id);
        sets.active.insert(job.id, job.clone());
        Ok(())
    }
}

/// One JSON file per job under `active/` and `archive/`.
///
/// Every write goes to a temporary file in the target directory that is
/// synced and renamed into place, so a crash leaves either the old or the
/// new record. An exclusive lock on `.lock` keeps a second runtime from
/// opening the same store.
#[derive(Debug)]
pub struct FileJobStore {
    root: PathBuf,
    _lock: File,
}

impl FileJobStore {
    /// Open or create a store under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Store`] if the directories cannot be created
    /// or another process holds the store.
    pub fn open(root: impl Into<PathBuf>) -> RuntimeResult<Self> {
        let root = root.into();
        for dir in [root.join("active"), root.join("archive")] {
            fs::create_dir_all(&dir).map_err(|e| store_error(&dir, &e))?;
        }
        let lock_path = root.join(".lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(&lock_path)
            .map_err(|e| store_error(&lock_path, &e))?;
        lock.try_lock_exclusive().map_err(|e| {
            RuntimeError::Store(format!(
                "job store {} is in use by another process: {e}",
                root.display()
            ))
        })?;
        debug!(root = %root.display(), "job store opened");
        Ok(Self { root, _lock: lock })
    }

    /// Store directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn active_path(&self, id: JobId) -> PathBuf {
        self.root.join("active").join(format!("{id}.json"))
    }

    fn archive_path(&self, id: JobId) -> PathBuf {
        self.root.join("archive").join(format!("{id}.json"))
    }

    async fn blocking<T, F>(&self, f: F) -> RuntimeResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> RuntimeResult<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| RuntimeError::Store(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn insert(&self, job: &Job) -> RuntimeResult<bool> {
        let active = self.active_path(job.id);
        let archive = self.archive_path(job.id);
        let job = job.clone();
        self.blocking(move || {
            if active.exists() || archive.exists() {
                return Ok(false);
            }
            write_job(&active, &job)?;
            Ok(true)
        })
        .await
    }

    async fn update(&self, job: &Job) -> RuntimeResult<()> {
        let path = self.active_path(job.id);
        let job = job.clone();
        self.blocking(move || {
            if !path.exists() {
                return Err(RuntimeError::NotFound(format!("active job {}", job.id)));
            }
            write_job(&path, &job)
        })
        .await
    }

    async fn archive(&self, job: &Job) -> RuntimeResult<()> {
        let active = self.active_path(job.id);
        let archive = self.archive_path(job.id);
        let job = job.clone();
        self.blocking(move || {
            write_job(&archive, &job)?;
            remove_if_present(&active)
        })
        .await
    }

    async fn get(&self, id: JobId) -> RuntimeResult<Option<Job>> {
        let active = self.active_path(id);
        let archive = self.archive_path(id);
        self.blocking(move || {
            for path in [active, archive] {
                if path.exists() {
                    return read_job(&path).map(Some);
                }
            }
            Ok(None)
        })
        .await
    }

    async fn active(&self) -> RuntimeResult<Vec<Job>> {
        let dir = self.root.join("active");
        self.blocking(move || {
            let mut jobs = read_all(&dir)?;
            by_age(&mut jobs);
            Ok(jobs)
        })
        .await
    }

    async fn dead_letters(&self) -> RuntimeResult<Vec<Job>> {
        let dir = self.root.join("archive");
        self.blocking(move || {
            let mut jobs: Vec<Job> = read_all(&dir)?
                .into_iter()
                .filter(|j| j.state == JobState::DeadLettered)
                .collect();
            by_age(&mut jobs);
            Ok(jobs)
        })
        .await
    }

    async fn restore(&self, job: &Job) -> RuntimeResult<()> {
        let active = self.active_path(job.id);
        let archive = self.archive_path(job.id);
        let job = job.clone();
        self.blocking(move || {
            if !archive.exists() {
                return Err(RuntimeError::NotFound(format!("archived job {}", job.id)));
            }
            write_job(&active, &job)?;
            remove_if_present(&archive)
        })
        .await
    }
}

fn store_error(path: &Path, e: &std::io::Error) -> RuntimeError {
    RuntimeError::Store(format!("{}: {e}", path.display()))
}

fn write_job(path: &Path, job: &Job) -> RuntimeResult<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let body = serde_json::to_vec_pretty(job)
        .map_err(|e| RuntimeError::Store(format!("failed to serialize job {}: {e}", job.id)))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| store_error(parent, &e))?;
    tmp.write_all(&body).map_err(|e| store_error(path, &e))?;
    tmp.as_file().sync_all().map_err(|e| store_error(path, &e))?;
    tmp.persist(path).map_err(|e| store_error(path, &e.error))?;
    Ok(())
}

fn read_job(path: &Path) -> RuntimeResult<Job> {
    let bytes = fs::read(path).map_err(|e| store_error(path, &e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| RuntimeError::Store(format!("{}: {e}", path.display())))
}

fn read_all(dir: &Path) -> RuntimeResult<Vec<Job>> {
    let entries = fs::read_dir(dir).map_err(|e| store_error(dir, &e))?;
    let mut jobs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_job(&path) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job record"),
        }
    }
    Ok(jobs)
}

fn remove_if_present(path: &Path) -> RuntimeResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(store_error(path, &e)),
    }
}
