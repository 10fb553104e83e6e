//! Local fan-out of finalized events
//!
//! The event-source holder hands every committed event to a [`Dispatch`],
//! keyed by the event's uri. Subscribers see events in final-id order.

use crate::event::FinalEvent;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

/// Default per-topic channel capacity
pub const DEFAULT_DISPATCH_CAPACITY: usize = 1024;

/// Delivery of finalized events to local subscribers
pub trait Dispatch: Send + Sync {
    /// Deliver `event` to subscribers of `topic`. Returns the number of
    /// receivers it reached.
    fn publish(&self, topic: &str, event: FinalEvent) -> usize;

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<FinalEvent>;
}

/// In-process dispatch with one broadcast channel per topic
pub struct LocalDispatch {
    topics: DashMap<String, broadcast::Sender<FinalEvent>>,
    all: broadcast::Sender<FinalEvent>,
    capacity: usize,
}

impl LocalDispatch {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DISPATCH_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            topics: DashMap::new(),
            all,
            capacity,
        }
    }

    /// Every dispatched event, whatever its topic
    pub fn subscribe_all(&self) -> broadcast::Receiver<FinalEvent> {
        self.all.subscribe()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for LocalDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatch for LocalDispatch {
    fn publish(&self, topic: &str, event: FinalEvent) -> usize {
        let _ = self.all.send(event.clone());
        let reached = match self.topics.get(topic) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        };
        trace!(topic = %topic, reached, "dispatched event");
        reached
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<FinalEvent> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}
