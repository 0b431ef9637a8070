//! Lazy, ordered, restartable event subscriptions.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;

use crate::error::DeviceResult;
use crate::event::DeviceEvent;
use crate::log::EventLog;

const READ_BATCH: usize = 256;

struct State {
    log: Arc<dyn EventLog>,
    stream: String,
    last: u64,
    buffer: VecDeque<DeviceEvent>,
    head: Option<watch::Receiver<u64>>,
    started: bool,
    consumer: String,
}

/// Subscribe to `stream` from the cursor committed by `consumer`.
///
/// The stream is infinite: once caught up it waits for new appends. Events
/// arrive in id order. Delivery is at-least-once: the subscription does not
/// commit, so a consumer that restarts before committing sees the
/// uncommitted events again. It ends only if the log can no longer notify
/// (the log was dropped), and yields an error item if a read fails.
#[must_use]
pub fn subscribe(
    log: Arc<dyn EventLog>,
    stream: impl Into<String>,
    consumer: impl Into<String>,
) -> BoxStream<'static, DeviceResult<DeviceEvent>> {
    let state = State {
        log,
        stream: stream.into(),
        last: 0,
        buffer: VecDeque::new(),
        head: None,
        started: false,
        consumer: consumer.into(),
    };
    stream::unfold(state, next).boxed()
}

async fn next(mut state: State) -> Option<(DeviceResult<DeviceEvent>, State)> {
    if !state.started {
        state.started = true;
        match state.log.cursor(&state.stream, &state.consumer).await {
            Ok(cursor) => state.last = cursor,
            Err(e) => return Some((Err(e), state)),
        }
        match state.log.head(&state.stream) {
            Ok(head) => state.head = Some(head),
            Err(e) => return Some((Err(e), state)),
        }
    }

    loop {
        if let Some(event) = state.buffer.pop_front() {
            state.last = event.id;
            return Some((Ok(event), state));
        }

        // Mark the current head as seen before reading so an append that
        // lands after the read still wakes us.
        let head = state.head.as_mut()?;
        head.borrow_and_update();

        match state
            .log
            .read_after(&state.stream, state.last, READ_BATCH)
            .await
        {
            Ok(batch) if !batch.is_empty() => state.buffer.extend(batch),
            Ok(_) => {
                let head = state.head.as_mut()?;
                if head.changed().await.is_err() {
                    return None;
                }
            },
            Err(e) => return Some((Err(e), state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::event::{DeviceAttributes, EventKind, EventSource, NewEvent};
    use crate::log::MemoryEventLog;

    fn event(n: u16) -> NewEvent {
        NewEvent::usb(
            EventKind::Attach,
            DeviceAttributes {
                vendor_id: Some(1),
                product_id: Some(n),
                bus: Some(1),
                address: Some(n),
                ..Default::default()
            },
            EventSource::Poll,
        )
    }

    #[tokio::test]
    async fn yields_backlog_then_live_events() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
        log.append("devices", event(1)).await.unwrap();
        log.append("devices", event(2)).await.unwrap();

        let mut sub = subscribe(Arc::clone(&log), "devices", "test");
        assert_eq!(sub.next().await.unwrap().unwrap().id, 1);
        assert_eq!(sub.next().await.unwrap().unwrap().id, 2);

        let writer = Arc::clone(&log);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("devices", event(3)).await.unwrap();
        });
        let live = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(live.id, 3);
    }

    #[tokio::test]
    async fn restarts_from_committed_cursor() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
        for n in 1..=3 {
            log.append("devices", event(n)).await.unwrap();
        }
        {
            let mut sub = subscribe(Arc::clone(&log), "devices", "pump");
            let first = sub.next().await.unwrap().unwrap();
            log.commit("devices", "pump", first.id).await.unwrap();
            // Second event read but never committed.
            let _ = sub.next().await.unwrap().unwrap();
        }
        let mut sub = subscribe(Arc::clone(&log), "devices", "pump");
        assert_eq!(sub.next().await.unwrap().unwrap().id, 2);
        assert_eq!(sub.next().await.unwrap().unwrap().id, 3);
    }

    #[tokio::test]
    async fn invalid_stream_yields_error() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
        let mut sub = subscribe(log, "not valid", "c");
        assert!(sub.next().await.unwrap().is_err());
    }
}
