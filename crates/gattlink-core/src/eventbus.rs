//! Broadcast bus carrying gateway events to applications.
//!
//! Sessions publish here and apps subscribe, optionally with a predicate.
//! The bus is generic so `gattlink-devices` can supply its own event enum.

use tokio::sync::broadcast;
use uuid::Uuid;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Envelope attached to each published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMetadata {
    pub event_id: Uuid,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub source: String,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            source: source.into(),
        }
    }
}

type Envelope<E> = (E, EventMetadata);
type Predicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

/// Cloneable publisher side. A subscriber that falls behind skips the
/// oldest events; publishers never wait.
pub struct EventBus<E> {
    tx: broadcast::Sender<Envelope<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish tagged with `source`. Returns whether anyone was listening.
    pub fn publish_with_source(&self, event: E, source: impl Into<String>) -> bool {
        self.tx.send((event, EventMetadata::new(source))).is_ok()
    }

    pub fn publish(&self, event: E) -> bool {
        self.publish_with_source(event, "gateway")
    }

    pub fn subscribe(&self) -> Subscription<E> {
        Subscription {
            rx: self.tx.subscribe(),
            predicate: None,
        }
    }

    /// Subscribe to the events for which `predicate` holds.
    pub fn subscribe_filtered<F>(&self, predicate: F) -> Subscription<E>
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Subscription {
            rx: self.tx.subscribe(),
            predicate: Some(Box::new(predicate)),
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the bus.
pub struct Subscription<E> {
    rx: broadcast::Receiver<Envelope<E>>,
    predicate: Option<Predicate<E>>,
}

impl<E: Clone> Subscription<E> {
    fn wants(&self, event: &E) -> bool {
        self.predicate.as_ref().is_none_or(|p| p(event))
    }

    /// Wait for the next wanted event; `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Envelope<E>> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if self.wants(&envelope.0) => return Some(envelope),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next wanted event already buffered, if any.
    pub fn try_recv(&mut self) -> Option<Envelope<E>> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if self.wants(&envelope.0) => return Some(envelope),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}
