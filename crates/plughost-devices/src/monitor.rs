//! Hotplug detection: callback notices reconciled by periodic enumeration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dedup::Deduplicator;
use crate::devfs::{HotplugAction, HotplugNotice};
use crate::directory::DeviceDirectory;
use crate::enumerate::DeviceEnumerator;
use crate::error::DeviceResult;
use crate::event::{DeviceAttributes, DeviceEvent, EventKind, EventSource, NewEvent};
use crate::log::EventLog;

/// Default interval between full enumerations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Turns platform notices and enumeration snapshots into logged events.
///
/// Both paths consult the same known-device set, keyed by physical
/// `bus/address`, so a device seen by the callback and then by the poll
/// (or the other way round) is logged once. The [`Deduplicator`] catches
/// the remaining races, such as a notice that is delivered twice.
pub struct DeviceMonitor {
    log: Arc<dyn EventLog>,
    stream: String,
    enumerator: Arc<dyn DeviceEnumerator>,
    directory: DeviceDirectory,
    dedup: Deduplicator,
    known: HashMap<String, DeviceAttributes>,
    poll_interval: Duration,
}

impl DeviceMonitor {
    /// Create a monitor appending to `stream` of `log`.
    #[must_use]
    pub fn new(
        log: Arc<dyn EventLog>,
        stream: impl Into<String>,
        enumerator: Arc<dyn DeviceEnumerator>,
        directory: DeviceDirectory,
    ) -> Self {
        Self {
            log,
            stream: stream.into(),
            enumerator,
            directory,
            dedup: Deduplicator::default(),
            known: HashMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the enumeration interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the deduplication window.
    #[must_use]
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup = Deduplicator::new(window);
        self
    }

    /// Number of devices currently believed attached.
    #[must_use]
    pub fn known_devices(&self) -> usize {
        self.known.len()
    }

    /// Handle one platform notice.
    ///
    /// Returns the logged event, or `None` if the change was already known.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be appended to the log.
    pub async fn handle_notice(&mut self, notice: HotplugNotice) -> DeviceResult<Option<DeviceEvent>> {
        match notice.action {
            HotplugAction::Added => {
                if self.known.contains_key(&notice.key) {
                    debug!(key = %notice.key, "attach already known");
                    return Ok(None);
                }
                let attributes = self
                    .enumerator
                    .describe(&notice.key)
                    .map_or_else(|| partial_attributes(&notice.key), |info| info.attributes);
                self.attach(notice.key, attributes, EventSource::Callback)
                    .await
            },
            HotplugAction::Removed => {
                if !self.known.contains_key(&notice.key) {
                    debug!(key = %notice.key, "detach of unknown device");
                    return Ok(None);
                }
                self.detach(&notice.key, EventSource::Callback).await
            },
        }
    }

    /// Enumerate every device and log the differences from the known set.
    ///
    /// # Errors
    ///
    /// Returns an error if enumeration fails or an event cannot be appended.
    pub async fn reconcile(&mut self) -> DeviceResult<Vec<DeviceEvent>> {
        let snapshot = self.enumerator.enumerate()?;
        let mut logged = Vec::new();

        let present: HashMap<String, DeviceAttributes> = snapshot
            .into_iter()
            .map(|info| (info.key, info.attributes))
            .collect();

        let gone: Vec<String> = self
            .known
            .keys()
            .filter(|key| !present.contains_key(*key))
            .cloned()
            .collect();
        for key in gone {
            if let Some(event) = self.detach(&key, EventSource::Poll).await? {
                logged.push(event);
            }
        }

        let mut added: Vec<_> = present
            .into_iter()
            .filter(|(key, _)| !self.known.contains_key(key))
            .collect();
        added.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, attributes) in added {
            if let Some(event) = self.attach(key, attributes, EventSource::Poll).await? {
                logged.push(event);
            }
        }

        if !logged.is_empty() {
            info!(events = logged.len(), "enumeration reconciled missed changes");
        }
        Ok(logged)
    }

    /// Run until `shutdown` fires. The first enumeration happens
    /// immediately so devices present at startup are logged.
    pub async fn run(
        mut self,
        notices: mpsc::UnboundedReceiver<HotplugNotice>,
        shutdown: CancellationToken,
    ) {
        let mut notices = Some(notices);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(stream = %self.stream, interval = ?self.poll_interval, "device monitor started");

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                notice = async {
                    match notices.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match notice {
                    Some(notice) => {
                        if let Err(e) = self.handle_notice(notice).await {
                            warn!(error = %e, "failed to log hotplug notice");
                        }
                    },
                    None => {
                        warn!("hotplug notices closed, continuing with enumeration only");
                        notices = None;
                    },
                },

                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "device enumeration failed");
                    }
                },
            }
        }
        debug!("device monitor stopped");
    }

    async fn attach(
        &mut self,
        key: String,
        attributes: DeviceAttributes,
        source: EventSource,
    ) -> DeviceResult<Option<DeviceEvent>> {
        let event = NewEvent::usb(EventKind::Attach, attributes, source);
        self.known.insert(key, event.attributes.clone());
        self.directory
            .insert(event.subject_id.clone(), event.attributes.clone());
        self.emit(event).await
    }

    async fn detach(&mut self, key: &str, source: EventSource) -> DeviceResult<Option<DeviceEvent>> {
        let Some(attributes) = self.known.remove(key) else {
            return Ok(None);
        };
        let event = NewEvent::usb(EventKind::Detach, attributes, source);
        self.directory.remove(&event.subject_id);
        self.emit(event).await
    }

    async fn emit(&mut self, event: NewEvent) -> DeviceResult<Option<DeviceEvent>> {
        if !self
            .dedup
            .admit(&event.subject_id, event.kind, Instant::now())
        {
            debug!(subject_id = %event.subject_id, kind = %event.kind, "duplicate suppressed");
            return Ok(None);
        }
        if event.degraded {
            warn!(subject_id = %event.subject_id, kind = %event.kind, "descriptor unreadable, logging partial event");
        }
        let logged = self.log.append(&self.stream, event).await?;
        info!(
            id = logged.id,
            subject_id = %logged.subject_id,
            kind = %logged.kind,
            source = ?logged.source,
            "device event logged"
        );
        Ok(Some(logged))
    }
}

impl std::fmt::Debug for DeviceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMonitor")
            .field("stream", &self.stream)
            .field("known", &self.known.len())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// Bus and address recovered from a `BBB/DDD` key when the descriptor is gone.
fn partial_attributes(key: &str) -> DeviceAttributes {
    let mut parts = key.split('/').map(|p| p.parse::<u16>().ok());
    DeviceAttributes {
        bus: parts.next().flatten(),
        address: parts.next().flatten(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enumerate::{DeviceInfo, StaticEnumerator};
    use crate::log::MemoryEventLog;

    fn widget() -> DeviceInfo {
        DeviceInfo::new(
            1,
            4,
            DeviceAttributes {
                vendor_id: Some(0x1234),
                product_id: Some(0x5678),
                ..Default::default()
            },
        )
    }

    fn added(key: &str) -> HotplugNotice {
        HotplugNotice {
            action: HotplugAction::Added,
            key: key.into(),
        }
    }

    fn removed(key: &str) -> HotplugNotice {
        HotplugNotice {
            action: HotplugAction::Removed,
            key: key.into(),
        }
    }

    fn setup() -> (Arc<MemoryEventLog>, Arc<StaticEnumerator>, DeviceMonitor) {
        let log = Arc::new(MemoryEventLog::new());
        let enumerator = Arc::new(StaticEnumerator::default());
        let monitor = DeviceMonitor::new(
            Arc::clone(&log) as Arc<dyn EventLog>,
            "devices",
            Arc::clone(&enumerator) as Arc<dyn DeviceEnumerator>,
            DeviceDirectory::new(),
        );
        (log, enumerator, monitor)
    }

    #[tokio::test]
    async fn callback_then_poll_logs_one_attach() {
        let (log, enumerator, mut monitor) = setup();
        enumerator.insert(widget());

        let event = monitor.handle_notice(added("001/004")).await.unwrap().unwrap();
        assert_eq!(event.subject_id, "usb:1234:5678:001:004");
        assert_eq!(event.source, EventSource::Callback);
        assert!(!event.degraded);

        assert!(monitor.reconcile().await.unwrap().is_empty());
        assert!(monitor.handle_notice(added("001/004")).await.unwrap().is_none());
        assert_eq!(log.read_after("devices", 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn poll_then_callback_logs_one_attach_and_one_detach() {
        let (log, enumerator, mut monitor) = setup();
        enumerator.insert(widget());

        let polled = monitor.reconcile().await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].source, EventSource::Poll);
        assert!(monitor.handle_notice(added("001/004")).await.unwrap().is_none());

        enumerator.remove("001/004");
        let detach = monitor.handle_notice(removed("001/004")).await.unwrap().unwrap();
        assert_eq!(detach.kind, EventKind::Detach);
        assert_eq!(detach.subject_id, "usb:1234:5678:001:004");
        assert!(monitor.reconcile().await.unwrap().is_empty());

        let all = log.read_after("devices", 0, 10).await.unwrap();
        let kinds: Vec<_> = all.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Attach, EventKind::Detach]);
    }

    #[tokio::test]
    async fn unreadable_descriptor_is_logged_degraded() {
        let (_log, _enumerator, mut monitor) = setup();
        let event = monitor.handle_notice(added("003/011")).await.unwrap().unwrap();
        assert!(event.degraded);
        assert_eq!(event.attributes.bus, Some(3));
        assert_eq!(event.attributes.address, Some(11));
        assert_eq!(event.subject_id, "usb:????:????:003:011");

        // Detach reuses what was captured at attach.
        let detach = monitor.handle_notice(removed("003/011")).await.unwrap().unwrap();
        assert_eq!(detach.subject_id, event.subject_id);
    }

    #[tokio::test]
    async fn poll_synthesizes_missed_detach() {
        let (_log, enumerator, mut monitor) = setup();
        enumerator.insert(widget());
        monitor.handle_notice(added("001/004")).await.unwrap();
        enumerator.remove("001/004");

        let events = monitor.reconcile().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Detach);
        assert_eq!(monitor.known_devices(), 0);
    }

    #[tokio::test]
    async fn directory_tracks_attached_devices() {
        let log = Arc::new(MemoryEventLog::new());
        let enumerator = Arc::new(StaticEnumerator::new(vec![widget()]));
        let directory = DeviceDirectory::new();
        let mut monitor = DeviceMonitor::new(
            log,
            "devices",
            Arc::clone(&enumerator) as Arc<dyn DeviceEnumerator>,
            directory.clone(),
        );
        monitor.reconcile().await.unwrap();
        assert!(directory.get("usb:1234:5678:001:004").is_some());
        enumerator.set(Vec::new());
        monitor.reconcile().await.unwrap();
        assert!(directory.list().is_empty());
    }

    #[tokio::test]
    async fn run_reconciles_at_startup_and_stops_on_shutdown() {
        let (log, enumerator, monitor) = setup();
        enumerator.insert(widget());
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            monitor
                .with_poll_interval(Duration::from_millis(20))
                .run(rx, shutdown.clone()),
        );

        let mut head = log.head("devices").unwrap();
        tokio::time::timeout(Duration::from_secs(5), head.wait_for(|id| *id >= 1))
            .await
            .unwrap()
            .unwrap();
        drop(tx);
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(log.read_after("devices", 0, 10).await.unwrap().len(), 1);
    }
}
