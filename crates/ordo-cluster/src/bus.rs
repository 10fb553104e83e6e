//! Topic bus between cluster nodes
//!
//! Every subscriber owns one unbounded channel, so messages from one sender
//! reach one receiver in publish order. Publishing never blocks and reaches
//! the publisher too when it subscribes to the topic.

use crate::error::Result;
use crate::node::NodeId;
use crate::protocol::{Envelope, Outbound, Topic};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Inbound messages for one subscriber
pub type Subscription = mpsc::UnboundedReceiver<Envelope>;

/// Publish/subscribe transport between nodes
pub trait Bus: Send + Sync {
    /// Deliver `envelope` to every subscriber of its topic
    fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Register `node` for `topics`
    fn subscribe(&self, node: &NodeId, topics: &[Topic]) -> Subscription;
}

/// Publish a node's outbound messages in order, logging failures
pub fn publish_all(bus: &dyn Bus, source: &NodeId, outbound: Vec<Outbound>) {
    for message in outbound {
        let envelope = message.into_envelope(source);
        let kind = envelope.message.kind();
        if let Err(e) = bus.publish(envelope) {
            warn!(node = %source, kind, error = %e, "failed to publish");
        }
    }
}

/// Predicate deciding whether a message to a subscriber is dropped
pub type DropRule = Arc<dyn Fn(&NodeId, &Envelope) -> bool + Send + Sync>;

struct Subscriber {
    node: NodeId,
    topics: Vec<Topic>,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// In-process bus
#[derive(Default)]
pub struct LocalBus {
    subscribers: RwLock<Vec<Subscriber>>,
    drop_rule: RwLock<Option<DropRule>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a rule that silently drops matching deliveries
    pub fn set_drop_rule(&self, rule: DropRule) {
        *self.drop_rule.write() = Some(rule);
    }

    pub fn clear_drop_rule(&self) {
        *self.drop_rule.write() = None;
    }

    /// Remove every subscription of `node`
    pub fn disconnect(&self, node: &NodeId) {
        self.subscribers.write().retain(|s| &s.node != node);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Bus for LocalBus {
    fn publish(&self, envelope: Envelope) -> Result<()> {
        let rule = self.drop_rule.read().clone();
        let mut closed = false;
        for subscriber in self.subscribers.read().iter() {
            if !subscriber.topics.contains(&envelope.topic) {
                continue;
            }
            if rule.as_ref().map_or(false, |matches| matches(&subscriber.node, &envelope)) {
                trace!(to = %subscriber.node, kind = envelope.message.kind(), "dropped by rule");
                continue;
            }
            if subscriber.tx.send(envelope.clone()).is_err() {
                closed = true;
            }
        }
        if closed {
            self.subscribers.write().retain(|s| !s.tx.is_closed());
        }
        Ok(())
    }

    fn subscribe(&self, node: &NodeId, topics: &[Topic]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(Subscriber {
            node: node.clone(),
            topics: topics.to_vec(),
            tx,
        });
        rx
    }
}
