//! Append-only, per-stream event log with consumer cursors.
//!
//! Ids are assigned by the log and strictly increase per stream, so a
//! consumer's position is a single number. Entries are retained until every
//! known consumer has committed past them; [`EventLog::compact`] drops the
//! rest.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{DeviceError, DeviceResult};
use crate::event::{DeviceEvent, NewEvent};

/// Durable ordered event storage.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event, assigning the next id of `stream`.
    async fn append(&self, stream: &str, event: NewEvent) -> DeviceResult<DeviceEvent>;

    /// Up to `limit` retained events with `id > after`, in id order.
    async fn read_after(
        &self,
        stream: &str,
        after: u64,
        limit: usize,
    ) -> DeviceResult<Vec<DeviceEvent>>;

    /// Record that `consumer` has processed everything up to `id`. Cursors
    /// never move backwards.
    async fn commit(&self, stream: &str, consumer: &str, id: u64) -> DeviceResult<()>;

    /// Last id committed by `consumer`, `0` if none.
    async fn cursor(&self, stream: &str, consumer: &str) -> DeviceResult<u64>;

    /// Drop events every known consumer has passed. Returns how many were
    /// dropped. A stream without consumers keeps everything.
    async fn compact(&self, stream: &str) -> DeviceResult<usize>;

    /// Watch the id of the newest event in `stream`.
    fn head(&self, stream: &str) -> DeviceResult<watch::Receiver<u64>>;
}

fn validate_stream(stream: &str) -> DeviceResult<()> {
    let valid = !stream.is_empty()
        && stream.len() <= 64
        && stream
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DeviceError::InvalidStream(stream.to_string()))
    }
}

/// In-memory state of one stream.
#[derive(Debug)]
struct StreamState {
    events: VecDeque<DeviceEvent>,
    last_id: u64,
    cursors: BTreeMap<String, u64>,
    head: watch::Sender<u64>,
}

impl StreamState {
    fn new(last_id: u64) -> Self {
        Self {
            events: VecDeque::new(),
            last_id,
            cursors: BTreeMap::new(),
            head: watch::Sender::new(last_id),
        }
    }

    fn next(&mut self, event: NewEvent) -> DeviceEvent {
        self.last_id = self.last_id.saturating_add(1);
        DeviceEvent::stamp(self.last_id, event)
    }

    fn push(&mut self, event: DeviceEvent) {
        let id = event.id;
        self.events.push_back(event);
        self.head.send_replace(id);
    }

    fn read_after(&self, after: u64, limit: usize) -> Vec<DeviceEvent> {
        let start = self.events.partition_point(|e| e.id <= after);
        self.events.iter().skip(start).take(limit).cloned().collect()
    }

    fn commit(&mut self, consumer: &str, id: u64) -> bool {
        let id = id.min(self.last_id);
        let cursor = self.cursors.entry(consumer.to_string()).or_insert(0);
        if id > *cursor {
            *cursor = id;
            true
        } else {
            false
        }
    }

    fn cursor(&self, consumer: &str) -> u64 {
        self.cursors.get(consumer).copied().unwrap_or(0)
    }

    fn compact(&mut self) -> usize {
        let Some(floor) = self.cursors.values().copied().min() else {
            return 0;
        };
        let keep_from = self.events.partition_point(|e| e.id <= floor);
        self.events.drain(..keep_from).count()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| {
        warn!("{what} lock poisoned, recovering");
        e.into_inner()
    })
}

/// Volatile log for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    streams: Mutex<HashMap<String, StreamState>>,
}

impl MemoryEventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_stream<R>(
        &self,
        stream: &str,
        f: impl FnOnce(&mut StreamState) -> R,
    ) -> DeviceResult<R> {
        validate_stream(stream)?;
        let mut streams = lock(&self.streams, "MemoryEventLog");
        let state = streams
            .entry(stream.to_string())
            .or_insert_with(|| StreamState::new(0));
        Ok(f(state))
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, stream: &str, event: NewEvent) -> DeviceResult<DeviceEvent> {
        self.with_stream(stream, |s| {
            let event = s.next(event);
            s.push(event.clone());
            event
        })
    }

    async fn read_after(
        &self,
        stream: &str,
        after: u64,
        limit: usize,
    ) -> DeviceResult<Vec<DeviceEvent>> {
        self.with_stream(stream, |s| s.read_after(after, limit))
    }

    async fn commit(&self, stream: &str, consumer: &str, id: u64) -> DeviceResult<()> {
        self.with_stream(stream, |s| {
            s.commit(consumer, id);
        })
    }

    async fn cursor(&self, stream: &str, consumer: &str) -> DeviceResult<u64> {
        self.with_stream(stream, |s| s.cursor(consumer))
    }

    async fn compact(&self, stream: &str) -> DeviceResult<usize> {
        self.with_stream(stream, StreamState::compact)
    }

    fn head(&self, stream: &str) -> DeviceResult<watch::Receiver<u64>> {
        self.with_stream(stream, |s| s.head.subscribe())
    }
}

/// Persisted per-stream metadata.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamMeta {
    last_id: u64,
    cursors: BTreeMap<String, u64>,
}

#[derive(Debug)]
struct FileStream {
    state: StreamState,
    writer: File,
}

/// Durable log: one JSON-lines file plus one metadata file per stream.
///
/// ```text
/// <root>/.lock               exclusive process lock
/// <root>/<stream>.jsonl      one DeviceEvent per line
/// <root>/<stream>.meta.json  { lastId, cursors }
/// ```
///
/// Every append is synced before it is acknowledged. A torn trailing line
/// left by a crash is skipped on open.
#[derive(Debug)]
pub struct FileEventLog {
    root: PathBuf,
    streams: Mutex<HashMap<String, FileStream>>,
    lock_file: File,
}

impl FileEventLog {
    /// Open (or create) a log under `root`, taking an exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Locked`] if another process holds the log, or
    /// an I/O error if the directory cannot be prepared.
    pub fn open(root: impl Into<PathBuf>) -> DeviceResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| DeviceError::io(&root, &e))?;
        let lock_path = root.join(".lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| DeviceError::io(&lock_path, &e))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| DeviceError::Locked(root.display().to_string()))?;
        info!(root = %root.display(), "opened event log");
        Ok(Self {
            root,
            streams: Mutex::new(HashMap::new()),
            lock_file,
        })
    }

    /// Directory holding the log.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn events_path(&self, stream: &str) -> PathBuf {
        self.root.join(format!("{stream}.jsonl"))
    }

    fn meta_path(&self, stream: &str) -> PathBuf {
        self.root.join(format!("{stream}.meta.json"))
    }

    fn load(&self, stream: &str) -> DeviceResult<FileStream> {
        let meta_path = self.meta_path(stream);
        let meta: StreamMeta = match std::fs::read(&meta_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| DeviceError::Serialization(format!("{}: {e}", meta_path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StreamMeta::default(),
            Err(e) => return Err(DeviceError::io(&meta_path, &e)),
        };

        let mut events = VecDeque::new();
        let events_path = self.events_path(stream);
        let content = match std::fs::read_to_string(&events_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(DeviceError::io(&events_path, &e)),
        };
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DeviceEvent>(line) {
                Ok(event) => events.push_back(event),
                Err(e) => {
                    warn!(
                        path = %events_path.display(),
                        line = n.saturating_add(1),
                        error = %e,
                        "skipping unreadable event log line"
                    );
                },
            }
        }

        let last_id = events.back().map_or(0, |e| e.id).max(meta.last_id);
        let mut state = StreamState::new(last_id);
        state.events = events;
        state.cursors = meta.cursors;
        debug!(stream, last_id, retained = state.events.len(), "loaded event stream");

        let mut writer = self.open_writer(&events_path)?;
        if !content.is_empty() && !content.ends_with('\n') {
            // Terminate a torn line so the next append starts cleanly.
            writer
                .write_all(b"\n")
                .map_err(|e| DeviceError::io(&events_path, &e))?;
        }
        Ok(FileStream { state, writer })
    }

    fn open_writer(&self, path: &Path) -> DeviceResult<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| DeviceError::io(path, &e))
    }

    fn with_stream<R>(
        &self,
        stream: &str,
        f: impl FnOnce(&Self, &mut FileStream) -> DeviceResult<R>,
    ) -> DeviceResult<R> {
        validate_stream(stream)?;
        let mut streams = lock(&self.streams, "FileEventLog");
        if !streams.contains_key(stream) {
            let loaded = self.load(stream)?;
            streams.insert(stream.to_string(), loaded);
        }
        match streams.get_mut(stream) {
            Some(fs) => f(self, fs),
            None => Err(DeviceError::InvalidStream(stream.to_string())),
        }
    }

    fn write_meta(&self, stream: &str, state: &StreamState) -> DeviceResult<()> {
        let meta = StreamMeta {
            last_id: state.last_id,
            cursors: state.cursors.clone(),
        };
        let bytes =
            serde_json::to_vec_pretty(&meta).map_err(|e| DeviceError::Serialization(e.to_string()))?;
        write_atomic(&self.meta_path(stream), &bytes)
    }
}

/// Write through a temp file in the same directory, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> DeviceResult<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| DeviceError::io(path, &e))?;
    tmp.write_all(bytes).map_err(|e| DeviceError::io(path, &e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| DeviceError::io(path, &e))?;
    tmp.persist(path)
        .map_err(|e| DeviceError::io(path, &e.error))?;
    Ok(())
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn append(&self, stream: &str, event: NewEvent) -> DeviceResult<DeviceEvent> {
        self.with_stream(stream, |log, fs| {
            let event = fs.state.next(event);
            let mut line =
                serde_json::to_vec(&event).map_err(|e| DeviceError::Serialization(e.to_string()))?;
            line.push(b'\n');
            let path = log.events_path(stream);
            fs.writer
                .write_all(&line)
                .and_then(|()| fs.writer.sync_data())
                .map_err(|e| DeviceError::io(&path, &e))?;
            fs.state.push(event.clone());
            Ok(event)
        })
    }

    async fn read_after(
        &self,
        stream: &str,
        after: u64,
        limit: usize,
    ) -> DeviceResult<Vec<DeviceEvent>> {
        self.with_stream(stream, |_, fs| Ok(fs.state.read_after(after, limit)))
    }

    async fn commit(&self, stream: &str, consumer: &str, id: u64) -> DeviceResult<()> {
        self.with_stream(stream, |log, fs| {
            if fs.state.commit(consumer, id) {
                log.write_meta(stream, &fs.state)?;
            }
            Ok(())
        })
    }

    async fn cursor(&self, stream: &str, consumer: &str) -> DeviceResult<u64> {
        self.with_stream(stream, |_, fs| Ok(fs.state.cursor(consumer)))
    }

    async fn compact(&self, stream: &str) -> DeviceResult<usize> {
        self.with_stream(stream, |log, fs| {
            let dropped = fs.state.compact();
            if dropped == 0 {
                return Ok(0);
            }
            let mut body = Vec::new();
            for event in &fs.state.events {
                serde_json::to_writer(&mut body, event)
                    .map_err(|e| DeviceError::Serialization(e.to_string()))?;
                body.push(b'\n');
            }
            // Metadata first so last_id survives even if every event is gone.
            log.write_meta(stream, &fs.state)?;
            let path = log.events_path(stream);
            write_atomic(&path, &body)?;
            fs.writer = log.open_writer(&path)?;
            info!(stream, dropped, retained = fs.state.events.len(), "compacted event stream");
            Ok(dropped)
        })
    }

    fn head(&self, stream: &str) -> DeviceResult<watch::Receiver<u64>> {
        self.with_stream(stream, |_, fs| Ok(fs.state.head.subscribe()))
    }
}

impl Drop for FileEventLog {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DeviceAttributes, EventKind, EventSource};

    fn attach(n: u16) -> NewEvent {
        NewEvent::usb(
            EventKind::Attach,
            DeviceAttributes {
                vendor_id: Some(0x1234),
                product_id: Some(n),
                bus: Some(1),
                address: Some(n),
                ..Default::default()
            },
            EventSource::Callback,
        )
    }

    async fn exercise(log: &dyn EventLog) {
        let a = log.append("devices", attach(1)).await.unwrap();
        let b = log.append("devices", attach(2)).await.unwrap();
        assert_eq!((a.id, b.id), (1, 2));

        let all = log.read_after("devices", 0, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        let tail = log.read_after("devices", 1, 10).await.unwrap();
        assert_eq!(tail[0].id, 2);

        log.commit("devices", "pump", 1).await.unwrap();
        log.commit("devices", "pump", 0).await.unwrap();
        assert_eq!(log.cursor("devices", "pump").await.unwrap(), 1);
        assert_eq!(log.cursor("devices", "other").await.unwrap(), 0);

        assert_eq!(log.compact("devices").await.unwrap(), 1);
        let retained = log.read_after("devices", 0, 10).await.unwrap();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].id, 2);
    }

    #[tokio::test]
    async fn memory_log_semantics() {
        exercise(&MemoryEventLog::new()).await;
    }

    #[tokio::test]
    async fn file_log_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileEventLog::open(dir.path()).unwrap();
        exercise(&log).await;
    }

    #[tokio::test]
    async fn file_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileEventLog::open(dir.path()).unwrap();
            log.append("devices", attach(1)).await.unwrap();
            log.append("devices", attach(2)).await.unwrap();
            log.commit("devices", "pump", 2).await.unwrap();
            log.compact("devices").await.unwrap();
        }
        let log = FileEventLog::open(dir.path()).unwrap();
        assert_eq!(log.cursor("devices", "pump").await.unwrap(), 2);
        assert!(log.read_after("devices", 0, 10).await.unwrap().is_empty());
        let next = log.append("devices", attach(3)).await.unwrap();
        assert_eq!(next.id, 3);
    }

    #[tokio::test]
    async fn torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileEventLog::open(dir.path()).unwrap();
            log.append("devices", attach(1)).await.unwrap();
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("devices.jsonl"))
            .unwrap();
        file.write_all(b"{\"id\":2,\"eve").unwrap();
        drop(file);

        let log = FileEventLog::open(dir.path()).unwrap();
        assert_eq!(log.read_after("devices", 0, 10).await.unwrap().len(), 1);
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let _first = FileEventLog::open(dir.path()).unwrap();
        assert!(matches!(
            FileEventLog::open(dir.path()),
            Err(DeviceError::Locked(_))
        ));
    }

    #[tokio::test]
    async fn head_tracks_appends() {
        let log = MemoryEventLog::new();
        let mut head = log.head("devices").unwrap();
        assert_eq!(*head.borrow_and_update(), 0);
        log.append("devices", attach(1)).await.unwrap();
        head.changed().await.unwrap();
        assert_eq!(*head.borrow(), 1);
    }

    #[tokio::test]
    async fn invalid_stream_names() {
        let log = MemoryEventLog::new();
        assert!(log.append("../x", attach(1)).await.is_err());
        assert!(log.cursor("", "c").await.is_err());
    }
}
