//! A broadcast channel for one notification type.

use std::fmt;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast channel carrying values of a single type.
///
/// Publishing never blocks. A subscriber that falls more than the channel
/// capacity behind skips the oldest values and logs how many it missed.
pub struct Channel<T> {
    name: &'static str,
    sender: broadcast::Sender<Arc<T>>,
}

impl<T: Send + Sync + 'static> Channel<T> {
    /// Create a channel with the default capacity.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self::with_capacity(name, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a channel with the given capacity.
    #[must_use]
    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { name, sender }
    }

    /// Publish a value. Returns the number of subscribers it reached.
    pub fn publish(&self, value: T) -> usize {
        match self.sender.send(Arc::new(value)) {
            Ok(count) => count,
            Err(_) => {
                trace!(channel = self.name, "no subscribers");
                0
            },
        }
    }

    /// Subscribe to values published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            name: self.name,
            receiver: self.sender.subscribe(),
        }
    }

    /// Current number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            sender: self.sender.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Receiving end of a [`Channel`].
pub struct Subscription<T> {
    name: &'static str,
    receiver: broadcast::Receiver<Arc<T>>,
}

impl<T: Send + Sync + 'static> Subscription<T> {
    /// Wait for the next value. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        loop {
            match self.receiver.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = self.name, skipped, "subscriber lagged, values dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next value if one is already queued.
    pub fn try_recv(&mut self) -> Option<Arc<T>> {
        loop {
            match self.receiver.try_recv() {
                Ok(value) => return Some(value),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(channel = self.name, skipped, "subscriber lagged, values dropped");
                },
                Err(_) => return None,
            }
        }
    }

    /// Drain every value currently queued.
    pub fn drain(&mut self) -> Vec<Arc<T>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Turn the subscription into a stream.
    pub fn into_stream(self) -> impl Stream<Item = Arc<T>> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let next = sub.recv().await?;
            Some((next, sub))
        })
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
