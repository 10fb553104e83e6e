//! Cluster configuration

use crate::election::{ExtractionPolicy, DEFAULT_ELECTED_HISTORY};
use crate::error::{ClusterError, Result};
use crate::id::MINUTE_PREFIX_WIDTH;
use crate::node::{NodeId, NodeInfo, NodeRole};
use crate::transport::TransportConfig;
use crate::watermark::DEFAULT_COMMITTED_HISTORY;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default cluster port
pub const DEFAULT_CLUSTER_PORT: u16 = 7450;

fn default_cluster_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_CLUSTER_PORT))
}

/// Cluster operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// One sync node and one entry node in a single process
    #[default]
    Standalone,
    /// Nodes in separate processes, connected over TCP
    Cluster,
}

/// Another member of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub role: NodeRole,
    /// Cluster address; `None` for members hosted in the same process
    pub addr: Option<SocketAddr>,
}

impl PeerConfig {
    pub fn new(id: impl Into<NodeId>, role: NodeRole) -> Self {
        Self {
            id: id.into(),
            role,
            addr: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Parse `id=role@host:port` or `id=role`
    pub fn parse(value: &str) -> Result<Self> {
        let (id, rest) = value
            .split_once('=')
            .ok_or_else(|| ClusterError::InvalidConfig(format!("peer {value:?}: expected id=role[@addr]")))?;
        let (role, addr) = match rest.split_once('@') {
            Some((role, addr)) => (role, Some(addr)),
            None => (rest, None),
        };
        let role = role
            .parse::<NodeRole>()
            .map_err(|e| ClusterError::InvalidConfig(format!("peer {value:?}: {e}")))?;
        let mut peer = PeerConfig::new(id.trim(), role);
        if let Some(addr) = addr {
            let addr = addr
                .parse()
                .map_err(|e| ClusterError::InvalidConfig(format!("peer {value:?}: {e}")))?;
            peer = peer.with_addr(addr);
        }
        Ok(peer)
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Operating mode
    pub mode: ClusterMode,

    /// Node identifier (unique across cluster)
    pub node_id: NodeId,

    /// Role of this node
    pub role: NodeRole,

    /// Data directory for the event history
    pub data_dir: PathBuf,

    /// Cluster communication address
    pub cluster_addr: SocketAddr,

    /// Advertised cluster address (for NAT/container environments)
    pub advertise_addr: Option<SocketAddr>,

    /// Every other member of the cluster
    pub peers: Vec<PeerConfig>,

    /// Sync node hosting the event-source lock (default: lowest sync id)
    pub lock_host: Option<NodeId>,

    pub election: ElectionConfig,
    pub commit: CommitConfig,
    pub entry: EntryConfig,
    pub heartbeat: HeartbeatConfig,
    pub transport: TransportConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::standalone()
    }
}

impl ClusterConfig {
    /// Single process configuration: this sync node plus a co-located entry
    /// node, see [`ClusterConfig::for_member`]
    pub fn standalone() -> Self {
        Self {
            mode: ClusterMode::Standalone,
            node_id: "sync-1".to_string(),
            role: NodeRole::Sync,
            data_dir: PathBuf::from("./data"),
            cluster_addr: default_cluster_addr(),
            advertise_addr: None,
            peers: vec![PeerConfig::new("entry-1", NodeRole::Entry)],
            lock_host: None,
            election: ElectionConfig::default(),
            commit: CommitConfig::default(),
            entry: EntryConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            transport: TransportConfig::default(),
        }
    }

    /// Create cluster configuration builder
    pub fn cluster() -> ClusterConfigBuilder {
        ClusterConfigBuilder::new()
    }

    /// Check if running in cluster mode
    pub fn is_cluster(&self) -> bool {
        matches!(self.mode, ClusterMode::Cluster)
    }

    /// Get the advertised address (for other nodes to connect)
    pub fn advertised_cluster_addr(&self) -> SocketAddr {
        self.advertise_addr.unwrap_or(self.cluster_addr)
    }

    /// This node and every peer
    pub fn members(&self) -> Vec<NodeInfo> {
        let mut local = NodeInfo::new(self.node_id.clone(), self.role);
        if self.is_cluster() {
            local = local.with_addr(self.advertised_cluster_addr());
        }
        let mut members = vec![local];
        members.extend(self.peers.iter().map(|peer| {
            let info = NodeInfo::new(peer.id.clone(), peer.role);
            match peer.addr {
                Some(addr) => info.with_addr(addr),
                None => info,
            }
        }));
        members
    }

    fn member_ids(&self, role: NodeRole) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .members()
            .into_iter()
            .filter(|m| m.role == role)
            .map(|m| m.id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Sync node ids, sorted
    pub fn sync_members(&self) -> Vec<NodeId> {
        self.member_ids(NodeRole::Sync)
    }

    /// Entry node ids, sorted
    pub fn entry_members(&self) -> Vec<NodeId> {
        self.member_ids(NodeRole::Entry)
    }

    /// Draft lane of this node and the lane count. Lanes are assigned by
    /// position among the sorted sync ids unless configured.
    pub fn lane(&self) -> (u32, u32) {
        let sync = self.sync_members();
        let lanes = self.election.lanes.unwrap_or(sync.len().max(1) as u32);
        let lane = self.election.lane.unwrap_or_else(|| {
            sync.iter()
                .position(|id| id == &self.node_id)
                .unwrap_or_default() as u32
        });
        (lane, lanes)
    }

    /// Sync node hosting the retained table
    pub fn lock_host(&self) -> Option<NodeId> {
        self.lock_host
            .clone()
            .or_else(|| self.sync_members().into_iter().next())
    }

    /// Drafts needed before a segment may be elected
    pub fn election_quorum(&self) -> usize {
        self.election
            .quorum
            .unwrap_or_else(|| majority(self.sync_members().len()))
    }

    /// Replica votes needed before a segment is committed
    pub fn commit_quorum(&self) -> usize {
        self.commit
            .quorum
            .unwrap_or_else(|| majority(self.entry_members().len()))
    }

    /// The same cluster seen from another member, for hosting several
    /// members in one process
    pub fn for_member(&self, id: &str) -> Result<ClusterConfig> {
        let members = self.members();
        let me = members
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| ClusterError::NodeNotFound(id.to_string()))?;

        let mut config = self.clone();
        config.node_id = me.id.clone();
        config.role = me.role;
        if let Some(addr) = me.cluster_addr {
            config.cluster_addr = addr;
            config.advertise_addr = None;
        }
        config.election.lane = None;
        config.peers = members
            .iter()
            .filter(|m| m.id != id)
            .map(|m| PeerConfig {
                id: m.id.clone(),
                role: m.role,
                addr: m.cluster_addr,
            })
            .collect();
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(ClusterError::InvalidConfig("node id must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for member in self.members() {
            if !seen.insert(member.id.clone()) {
                return Err(ClusterError::NodeIdConflict(member.id));
            }
        }
        if self.is_cluster() {
            if let Some(peer) = self.peers.iter().find(|p| p.addr.is_none()) {
                return Err(ClusterError::InvalidConfig(format!(
                    "peer {} has no address in cluster mode",
                    peer.id
                )));
            }
        }

        let sync = self.sync_members().len();
        let entry = self.entry_members().len();
        if sync == 0 || entry == 0 {
            return Err(ClusterError::InvalidConfig(format!(
                "cluster needs at least one sync and one entry node ({sync} sync, {entry} entry)"
            )));
        }

        let quorum = self.election_quorum();
        if quorum == 0 || quorum > sync {
            return Err(ClusterError::InvalidConfig(format!(
                "election quorum {quorum} outside 1..={sync} sync nodes"
            )));
        }
        let quorum = self.commit_quorum();
        if quorum == 0 || quorum > entry {
            return Err(ClusterError::InvalidConfig(format!(
                "commit quorum {quorum} outside 1..={entry} entry nodes"
            )));
        }

        let (lane, lanes) = self.lane();
        if lanes == 0 || lane >= lanes {
            return Err(ClusterError::InvalidConfig(format!(
                "draft lane {lane} outside 0..{lanes}"
            )));
        }
        if (lanes as usize) < sync {
            return Err(ClusterError::InvalidConfig(format!(
                "{lanes} lanes cannot separate {sync} sync nodes"
            )));
        }

        if let Some(host) = self.lock_host() {
            if !self.sync_members().contains(&host) {
                return Err(ClusterError::InvalidConfig(format!(
                    "lock host {host} is not a sync node"
                )));
            }
        }

        if self.heartbeat.suspect_after <= self.heartbeat.interval
            || self.heartbeat.dead_after < self.heartbeat.suspect_after
        {
            return Err(ClusterError::InvalidConfig(
                "heartbeat timeouts must satisfy interval < suspect_after <= dead_after".into(),
            ));
        }
        if self.entry.max_pending_segments == 0 {
            return Err(ClusterError::InvalidConfig(
                "max_pending_segments must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn majority(members: usize) -> usize {
    members / 2 + 1
}

/// Builder for cluster configuration
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    node_id: Option<NodeId>,
    role: Option<NodeRole>,
    data_dir: Option<PathBuf>,
    cluster_addr: Option<SocketAddr>,
    advertise_addr: Option<SocketAddr>,
    peers: Vec<PeerConfig>,
    lock_host: Option<NodeId>,
    election: Option<ElectionConfig>,
    commit: Option<CommitConfig>,
    entry: Option<EntryConfig>,
    heartbeat: Option<HeartbeatConfig>,
    transport: Option<TransportConfig>,
}

impl ClusterConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_id(mut self, id: impl Into<NodeId>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    pub fn role(mut self, role: NodeRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn cluster_addr(mut self, addr: SocketAddr) -> Self {
        self.cluster_addr = Some(addr);
        self
    }

    pub fn advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.advertise_addr = Some(addr);
        self
    }

    pub fn peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    pub fn peers(mut self, peers: impl IntoIterator<Item = PeerConfig>) -> Self {
        self.peers.extend(peers);
        self
    }

    pub fn lock_host(mut self, host: impl Into<NodeId>) -> Self {
        self.lock_host = Some(host.into());
        self
    }

    pub fn election(mut self, config: ElectionConfig) -> Self {
        self.election = Some(config);
        self
    }

    pub fn commit(mut self, config: CommitConfig) -> Self {
        self.commit = Some(config);
        self
    }

    pub fn entry(mut self, config: EntryConfig) -> Self {
        self.entry = Some(config);
        self
    }

    pub fn heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.heartbeat = Some(config);
        self
    }

    pub fn transport(mut self, config: TransportConfig) -> Self {
        self.transport = Some(config);
        self
    }

    pub fn build(self) -> ClusterConfig {
        ClusterConfig {
            mode: ClusterMode::Cluster,
            node_id: self.node_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            role: self.role.unwrap_or(NodeRole::Entry),
            data_dir: self.data_dir.unwrap_or_else(|| PathBuf::from("./data")),
            cluster_addr: self.cluster_addr.unwrap_or_else(default_cluster_addr),
            advertise_addr: self.advertise_addr,
            peers: self.peers,
            lock_host: self.lock_host,
            election: self.election.unwrap_or_default(),
            commit: self.commit.unwrap_or_default(),
            entry: self.entry.unwrap_or_default(),
            heartbeat: self.heartbeat.unwrap_or_default(),
            transport: self.transport.unwrap_or_default(),
        }
    }
}

/// Draft election configuration (sync nodes)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// When the smallest pending draft may be elected
    pub policy: ExtractionPolicy,

    /// Drafts needed per segment (default: majority of sync nodes)
    pub quorum: Option<usize>,

    /// Draft lane override (default: position among sync ids)
    pub lane: Option<u32>,

    /// Lane count override (default: number of sync nodes)
    pub lanes: Option<u32>,

    /// Width of the id prefix
    pub prefix_width: usize,

    /// How often the id prefix follows the wall clock
    pub prefix_refresh: Duration,

    /// Elected segments remembered for resends
    pub elected_history: usize,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            policy: ExtractionPolicy::default(),
            quorum: None,
            lane: None,
            lanes: None,
            prefix_width: MINUTE_PREFIX_WIDTH,
            prefix_refresh: Duration::from_secs(1),
            elected_history: DEFAULT_ELECTED_HISTORY,
        }
    }
}

/// Commit watermark configuration (sync nodes)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitConfig {
    /// Replica votes needed per segment (default: majority of entry nodes)
    pub quorum: Option<usize>,

    /// Committed segments remembered for re-announcement
    pub committed_history: usize,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            quorum: None,
            committed_history: DEFAULT_COMMITTED_HISTORY,
        }
    }
}

/// Entry node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Sealed segments allowed to wait for ordering
    pub max_pending_segments: usize,

    /// Re-broadcast a generate request after this long without a commit
    pub stall_timeout: Duration,

    /// Watchdog check interval
    pub watchdog_interval: Duration,

    /// Persisted segments remembered until their commit is announced. Also
    /// caps the segments a replica buffers before they can be persisted.
    pub replica_history: usize,

    /// Abandon another owner's unpersisted segment after this long without
    /// an event or an election for it
    pub replica_timeout: Duration,

    /// Compete for the event-source lock
    pub event_source: bool,

    /// Persist history in redb under `data_dir` (memory otherwise)
    pub persistent: bool,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            max_pending_segments: 64,
            stall_timeout: Duration::from_secs(5),
            watchdog_interval: Duration::from_secs(1),
            replica_history: 1024,
            replica_timeout: Duration::from_secs(600),
            event_source: true,
            persistent: true,
        }
    }
}

/// Heartbeat and failure detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats
    pub interval: Duration,

    /// Silence before a node is suspected
    pub suspect_after: Duration,

    /// Silence before a node is removed from quorums
    pub dead_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            suspect_after: Duration::from_secs(2),
            dead_after: Duration::from_secs(6),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn five_nodes() -> ClusterConfig {
        ClusterConfig::cluster()
            .node_id("s2")
            .role(NodeRole::Sync)
            .cluster_addr("127.0.0.1:7452".parse().unwrap())
            .peers([
                PeerConfig::parse("s1=sync@127.0.0.1:7451").unwrap(),
                PeerConfig::parse("s3=sync@127.0.0.1:7453").unwrap(),
                PeerConfig::parse("e1=entry@127.0.0.1:7461").unwrap(),
                PeerConfig::parse("e2=entry@127.0.0.1:7462").unwrap(),
            ])
            .build()
    }

    #[test]
    fn test_standalone_config() {
        let config = ClusterConfig::standalone();
        assert!(!config.is_cluster());
        assert_eq!(config.mode, ClusterMode::Standalone);
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_host().as_deref(), Some("sync-1"));

        let entry = config.for_member("entry-1").unwrap();
        assert_eq!(entry.role, NodeRole::Entry);
        assert_eq!(entry.peers, vec![PeerConfig::new("sync-1", NodeRole::Sync)]);
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn test_cluster_config_builder() {
        let config = five_nodes();
        assert!(config.is_cluster());
        assert!(config.validate().is_ok());
        assert_eq!(config.sync_members(), vec!["s1", "s2", "s3"]);
        assert_eq!(config.entry_members(), vec!["e1", "e2"]);
        assert_eq!(config.lane(), (1, 3));
        assert_eq!(config.election_quorum(), 2);
        assert_eq!(config.commit_quorum(), 2);
        assert_eq!(config.lock_host().as_deref(), Some("s1"));
    }

    #[test]
    fn test_for_member_swaps_view() {
        let config = five_nodes();
        let e2 = config.for_member("e2").unwrap();
        assert_eq!(e2.node_id, "e2");
        assert_eq!(e2.cluster_addr, "127.0.0.1:7462".parse().unwrap());
        assert!(e2.peers.iter().any(|p| p.id == "s2" && p.addr == Some("127.0.0.1:7452".parse().unwrap())));
        assert!(!e2.peers.iter().any(|p| p.id == "e2"));
        assert!(e2.validate().is_ok());
        assert!(config.for_member("x9").is_err());
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = five_nodes();
        config.election.quorum = Some(4);
        assert!(config.validate().is_err());

        let mut config = five_nodes();
        config.election.lane = Some(3);
        assert!(config.validate().is_err());

        let mut config = five_nodes();
        config.peers.push(PeerConfig::new("s1", NodeRole::Sync));
        assert!(matches!(config.validate(), Err(ClusterError::NodeIdConflict(_))));

        let mut config = five_nodes();
        config.lock_host = Some("e1".into());
        assert!(config.validate().is_err());

        let mut config = five_nodes();
        config.peers.push(PeerConfig::new("e3", NodeRole::Entry));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peer_parse() {
        let peer = PeerConfig::parse("e1=Entry").unwrap();
        assert_eq!(peer, PeerConfig::new("e1", NodeRole::Entry));
        assert!(PeerConfig::parse("e1").is_err());
        assert!(PeerConfig::parse("e1=relay").is_err());
        assert!(PeerConfig::parse("e1=entry@nowhere").is_err());
    }
}
