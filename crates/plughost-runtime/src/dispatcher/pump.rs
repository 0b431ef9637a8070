//! Feeds the event log into the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use plughost_devices::{EventLog, subscribe};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::JobDispatcher;

/// Delay before retrying a failed read or route.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Events committed between compactions.
const COMPACT_EVERY: u32 = 256;

/// Consumes one event stream from its committed cursor.
///
/// An event is committed only after its jobs are in the store. A crash in
/// between replays the event, and the deterministic job ids make the replay
/// a no-op.
pub struct EventPump {
    log: Arc<dyn EventLog>,
    stream: String,
    consumer: String,
    dispatcher: JobDispatcher,
}

impl EventPump {
    /// Create a pump for `stream` committing as `consumer`.
    #[must_use]
    pub fn new(
        log: Arc<dyn EventLog>,
        stream: impl Into<String>,
        consumer: impl Into<String>,
        dispatcher: JobDispatcher,
    ) -> Self {
        Self {
            log,
            stream: stream.into(),
            consumer: consumer.into(),
            dispatcher,
        }
    }

    /// Run until `shutdown` fires or the log goes away.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut events = subscribe(Arc::clone(&self.log), self.stream.clone(), self.consumer.clone());
        let mut since_compact: u32 = 0;
        info!(stream = %self.stream, consumer = %self.consumer, "event pump started");

        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                next = events.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!(stream = %self.stream, error = %e, "event read failed");
                    if pause(&shutdown).await {
                        break;
                    }
                    continue;
                },
                None => {
                    debug!(stream = %self.stream, "event log closed");
                    break;
                },
            };

            loop {
                match self.dispatcher.route_event(&self.stream, &event).await {
                    Ok(jobs) => {
                        debug!(event_id = event.id, jobs = jobs.len(), "event routed");
                        break;
                    },
                    Err(e) => {
                        warn!(event_id = event.id, error = %e, "routing failed, retrying");
                        if pause(&shutdown).await {
                            return;
                        }
                    },
                }
            }

            if let Err(e) = self.log.commit(&self.stream, &self.consumer, event.id).await {
                warn!(event_id = event.id, error = %e, "failed to commit cursor");
                continue;
            }
            since_compact = since_compact.saturating_add(1);
            if since_compact >= COMPACT_EVERY {
                since_compact = 0;
                match self.log.compact(&self.stream).await {
                    Ok(dropped) => debug!(stream = %self.stream, dropped, "event log compacted"),
                    Err(e) => warn!(stream = %self.stream, error = %e, "compaction failed"),
                }
            }
        }
        info!(stream = %self.stream, "event pump stopped");
    }
}

impl std::fmt::Debug for EventPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPump")
            .field("stream", &self.stream)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

/// Sleep before a retry. Returns `true` if shutdown fired instead.
async fn pause(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => true,
        () = tokio::time::sleep(RETRY_DELAY) => false,
    }
}
