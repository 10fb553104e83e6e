//! Heartbeat-based failure detection
//!
//! Every node publishes a heartbeat to the sync nodes at a fixed interval.
//! A sync node's tracker moves each peer through
//!
//! ```text
//!   Unknown/Alive ──(suspect_after)──► Suspect ──(dead_after)──► Dead
//!        ▲                                │                        │
//!        └──────────── heartbeat ─────────┴────────────────────────┘
//! ```
//!
//! Quorums only shrink on `NodeFailed`; a dead node that heartbeats again
//! joins back.

use crate::node::{Node, NodeId, NodeInfo, NodeRole, NodeState};
use crate::observability::ClusterMetrics;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Membership change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node was heard from for the first time, or again after being
    /// declared dead
    NodeJoined(NodeInfo),
    /// A node failed (missed heartbeats for `dead_after`)
    NodeFailed(NodeInfo),
    /// A node missed heartbeats for `suspect_after`
    NodeSuspected(NodeId),
    /// A suspected node sent a heartbeat
    NodeRecovered(NodeId),
}

/// Failure detector over peer heartbeats
#[derive(Debug)]
pub struct MemberTracker {
    local: NodeId,
    members: HashMap<NodeId, Node>,
    suspect_after: Duration,
    dead_after: Duration,
    event_tx: broadcast::Sender<MembershipEvent>,
}

impl MemberTracker {
    pub fn new(local: impl Into<NodeId>, suspect_after: Duration, dead_after: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            local: local.into(),
            members: HashMap::new(),
            suspect_after,
            dead_after: dead_after.max(suspect_after),
            event_tx,
        }
    }

    /// Register a configured peer that has not been heard from yet. It is
    /// failed like any other peer if it never heartbeats.
    pub fn add_known(&mut self, info: NodeInfo, now: Instant) {
        if info.id == self.local {
            return;
        }
        self.members
            .entry(info.id.clone())
            .or_insert_with(|| Node::new(info, now));
    }

    /// Record a heartbeat
    pub fn observe(&mut self, node: &NodeId, role: NodeRole, now: Instant) -> Option<MembershipEvent> {
        if node == &self.local {
            return None;
        }

        let event = match self.members.get_mut(node) {
            Some(member) => match member.mark_alive(now) {
                NodeState::Dead => {
                    info!(node = %node, "dead node is heartbeating again");
                    Some(MembershipEvent::NodeJoined(member.info.clone()))
                }
                NodeState::Suspect => {
                    info!(node = %node, "suspected node recovered");
                    Some(MembershipEvent::NodeRecovered(node.clone()))
                }
                NodeState::Unknown => {
                    debug!(node = %node, role = %role, "first heartbeat from configured node");
                    None
                }
                NodeState::Alive => None,
            },
            None => {
                let info = NodeInfo::new(node.clone(), role);
                let mut member = Node::new(info.clone(), now);
                member.mark_alive(now);
                self.members.insert(node.clone(), member);
                info!(node = %node, role = %role, "node joined");
                Some(MembershipEvent::NodeJoined(info))
            }
        };

        if let Some(event) = &event {
            self.emit(event.clone());
        }
        event
    }

    /// Advance suspicion timers
    pub fn check(&mut self, now: Instant) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        for member in self.members.values_mut() {
            let silent = now.saturating_duration_since(member.last_seen);
            match member.state {
                NodeState::Dead => {}
                _ if silent >= self.dead_after => {
                    member.mark_dead();
                    warn!(node = %member.id(), silent_ms = silent.as_millis() as u64, "node failed");
                    ClusterMetrics::increment_failures_detected();
                    events.push(MembershipEvent::NodeFailed(member.info.clone()));
                }
                NodeState::Alive | NodeState::Unknown if silent >= self.suspect_after => {
                    member.mark_suspect();
                    debug!(node = %member.id(), "node suspected");
                    events.push(MembershipEvent::NodeSuspected(member.info.id.clone()));
                }
                _ => {}
            }
        }
        for event in &events {
            self.emit(event.clone());
        }
        events
    }

    fn emit(&self, event: MembershipEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self, node: &NodeId) -> Option<NodeState> {
        self.members.get(node).map(|m| m.state)
    }

    /// Peers not declared dead with the given role
    pub fn live_members(&self, role: NodeRole) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .members
            .values()
            .filter(|m| m.role() == role && m.state.is_member())
            .map(|m| m.info.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}
