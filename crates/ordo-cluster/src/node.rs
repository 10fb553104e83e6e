//! Node types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Unique node identifier (human-readable string)
pub type NodeId = String;

/// Role a node plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Agrees on segment order and commit watermarks
    Sync,
    /// Accepts writes and stores finalized history
    Entry,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Sync => "sync",
            NodeRole::Entry => "entry",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(NodeRole::Sync),
            "entry" => Ok(NodeRole::Entry),
            other => Err(format!("unknown node role: {other}")),
        }
    }
}

/// Node liveness as seen by the local failure detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Node is healthy and sending heartbeats
    Alive,
    /// Node missed heartbeats, suspected but not confirmed dead
    Suspect,
    /// Node confirmed dead and removed from quorums
    Dead,
    /// Node state is unknown (configured, never heard from)
    #[default]
    Unknown,
}

impl NodeState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, NodeState::Alive)
    }

    /// Check if node still counts as a quorum member
    pub fn is_member(&self) -> bool {
        !matches!(self, NodeState::Dead)
    }
}

/// Static information about a cluster node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub role: NodeRole,
    /// Cluster communication address, if reachable over TCP
    pub cluster_addr: Option<SocketAddr>,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, role: NodeRole) -> Self {
        Self {
            id: id.into(),
            role,
            cluster_addr: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.cluster_addr = Some(addr);
        self
    }
}

/// Node with runtime liveness state
#[derive(Debug, Clone)]
pub struct Node {
    pub info: NodeInfo,
    pub state: NodeState,
    pub last_seen: Instant,
}

impl Node {
    pub fn new(info: NodeInfo, now: Instant) -> Self {
        Self {
            info,
            state: NodeState::Unknown,
            last_seen: now,
        }
    }

    /// Record a heartbeat. Returns the previous state.
    pub fn mark_alive(&mut self, now: Instant) -> NodeState {
        let previous = self.state;
        self.state = NodeState::Alive;
        self.last_seen = now;
        previous
    }

    pub fn mark_suspect(&mut self) {
        if matches!(self.state, NodeState::Alive | NodeState::Unknown) {
            self.state = NodeState::Suspect;
        }
    }

    pub fn mark_dead(&mut self) {
        self.state = NodeState::Dead;
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn role(&self) -> NodeRole {
        self.info.role
    }
}
