//! CLI argument parsing for the ordo daemon
//!
//! Every option can also be set through an `ORDO_*` environment variable.

use clap::{ArgAction, Parser, ValueEnum};
use ordo_cluster::config::{
    ClusterConfig, ClusterMode, CommitConfig, ElectionConfig, EntryConfig, HeartbeatConfig,
    PeerConfig, DEFAULT_CLUSTER_PORT,
};
use ordo_cluster::election::ExtractionPolicy;
use ordo_cluster::node::NodeRole;
use ordo_cluster::transport::TransportConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Ordo - leaderless event ordering for clustered routers
///
/// Runs one sync or entry node of an ordo cluster, or a complete
/// single-process cluster in standalone mode.
#[derive(Parser, Debug)]
#[command(name = "ordod")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    // ============ Node Configuration ============
    /// Deployment mode
    #[arg(long, default_value = "standalone", env = "ORDO_MODE")]
    pub mode: DeploymentMode,

    /// Unique node identifier (required in cluster mode)
    #[arg(long, env = "ORDO_NODE_ID")]
    pub node_id: Option<String>,

    /// Role of this node (sync or entry)
    #[arg(long, default_value = "entry", env = "ORDO_ROLE")]
    pub role: NodeRole,

    /// Data directory for event history
    #[arg(short, long, default_value = "./data", env = "ORDO_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Persist event history with redb (memory only otherwise)
    #[arg(long, default_value = "true", action = ArgAction::Set, env = "ORDO_PERSISTENCE")]
    pub persistence: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    // ============ Cluster Configuration ============
    /// Cluster communication bind address
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_CLUSTER_PORT)), env = "ORDO_CLUSTER_BIND")]
    pub cluster_bind: SocketAddr,

    /// Public address this node advertises to other nodes
    #[arg(long, env = "ORDO_ADVERTISE_ADDR")]
    pub advertise_addr: Option<SocketAddr>,

    /// Other cluster members (comma-separated)
    /// Format: id=role@host:port, e.g. sync-1=sync@10.0.0.1:7450
    #[arg(long, value_delimiter = ',', env = "ORDO_PEERS")]
    pub peers: Vec<String>,

    /// Sync node hosting the event-source lock (lowest sync id if unset)
    #[arg(long, env = "ORDO_LOCK_HOST")]
    pub lock_host: Option<String>,

    // ============ Ordering Configuration ============
    /// When the smallest pending draft may be elected
    #[arg(long, default_value = "member-watermark", env = "ORDO_ELECTION_POLICY")]
    pub election_policy: ExtractionPolicy,

    /// Drafts needed to elect a segment (majority of sync nodes if unset)
    #[arg(long, env = "ORDO_ELECTION_QUORUM")]
    pub election_quorum: Option<usize>,

    /// Replica votes needed to commit a segment (majority of entry nodes if unset)
    #[arg(long, env = "ORDO_COMMIT_QUORUM")]
    pub commit_quorum: Option<usize>,

    /// Sealed segments an entry node may queue before refusing commits
    #[arg(long, default_value = "64", env = "ORDO_MAX_PENDING_SEGMENTS")]
    pub max_pending_segments: usize,

    /// Re-broadcast a segment's generate request after this long (ms)
    #[arg(long, default_value = "5000", env = "ORDO_STALL_TIMEOUT_MS")]
    pub stall_timeout_ms: u64,

    /// Compete for the event-source lock (entry nodes)
    #[arg(long, default_value = "true", action = ArgAction::Set, env = "ORDO_EVENT_SOURCE")]
    pub event_source: bool,

    // ============ Failure Detection ============
    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "500", env = "ORDO_HEARTBEAT_MS")]
    pub heartbeat_ms: u64,

    /// Silence before a node is suspected (ms)
    #[arg(long, default_value = "2000", env = "ORDO_SUSPECT_MS")]
    pub suspect_ms: u64,

    /// Silence before a node is removed from quorums (ms)
    #[arg(long, default_value = "6000", env = "ORDO_DEAD_MS")]
    pub dead_ms: u64,

    // ============ Performance Tuning ============
    /// TCP_NODELAY for cluster connections
    #[arg(long, default_value = "true", action = ArgAction::Set, env = "ORDO_TCP_NODELAY")]
    pub tcp_nodelay: bool,

    /// Connection timeout in milliseconds
    #[arg(long, default_value = "5000", env = "ORDO_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: u64,

    /// Enable metrics endpoint
    #[arg(long, default_value = "true", action = ArgAction::Set, env = "ORDO_METRICS")]
    pub metrics: bool,

    /// Metrics endpoint bind address
    #[arg(long, default_value = "0.0.0.0:9090", env = "ORDO_METRICS_BIND")]
    pub metrics_bind: SocketAddr,
}

/// Deployment mode for the daemon
#[derive(ValueEnum, Clone, Debug, Default, PartialEq)]
pub enum DeploymentMode {
    /// One sync node and one entry node in this process
    #[default]
    Standalone,
    /// This process is one member of a multi-process cluster
    Cluster,
}

impl Cli {
    /// Convert CLI args to cluster config
    pub fn to_cluster_config(&self) -> Result<ClusterConfig, String> {
        let base = ClusterConfig::standalone();
        let peers = if self.is_cluster_mode() {
            self.peers
                .iter()
                .map(|peer| PeerConfig::parse(peer).map_err(|e| e.to_string()))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            base.peers.clone()
        };

        Ok(ClusterConfig {
            mode: if self.is_cluster_mode() {
                ClusterMode::Cluster
            } else {
                ClusterMode::Standalone
            },
            node_id: self.effective_node_id(&base),
            role: if self.is_cluster_mode() {
                self.role
            } else {
                base.role
            },
            data_dir: self.data_dir.clone(),
            cluster_addr: self.cluster_bind,
            advertise_addr: self.advertise_addr,
            peers,
            lock_host: self.lock_host.clone(),
            election: ElectionConfig {
                policy: self.election_policy,
                quorum: self.election_quorum,
                ..Default::default()
            },
            commit: CommitConfig {
                quorum: self.commit_quorum,
                ..Default::default()
            },
            entry: EntryConfig {
                max_pending_segments: self.max_pending_segments,
                stall_timeout: Duration::from_millis(self.stall_timeout_ms),
                event_source: self.event_source,
                persistent: self.persistence,
                ..Default::default()
            },
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(self.heartbeat_ms),
                suspect_after: Duration::from_millis(self.suspect_ms),
                dead_after: Duration::from_millis(self.dead_ms),
            },
            transport: TransportConfig {
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                tcp_nodelay: self.tcp_nodelay,
                ..Default::default()
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.is_cluster_mode() {
            if self.node_id.is_none() {
                return Err("node_id (--node-id / ORDO_NODE_ID) is required in cluster mode".into());
            }
            if self.peers.is_empty() {
                return Err("peers (--peers / ORDO_PEERS) are required in cluster mode".into());
            }
        }
        self.to_cluster_config()?
            .validate()
            .map_err(|e| e.to_string())
    }

    fn effective_node_id(&self, base: &ClusterConfig) -> String {
        match (&self.node_id, self.is_cluster_mode()) {
            (Some(id), true) => id.clone(),
            _ => base.node_id.clone(),
        }
    }

    /// Check if running in cluster mode
    pub fn is_cluster_mode(&self) -> bool {
        matches!(self.mode, DeploymentMode::Cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cli() {
        let cli = Cli::parse_from(["ordod"]);
        assert_eq!(cli.mode, DeploymentMode::Standalone);
        assert_eq!(cli.cluster_bind.port(), DEFAULT_CLUSTER_PORT);
        assert!(cli.validate().is_ok());

        let config = cli.to_cluster_config().unwrap();
        assert_eq!(config.role, NodeRole::Sync);
        assert_eq!(config.entry_members(), vec!["entry-1".to_string()]);
    }

    #[test]
    fn test_cluster_mode() {
        let cli = Cli::parse_from([
            "ordod",
            "--mode",
            "cluster",
            "--node-id",
            "entry-1",
            "--role",
            "entry",
            "--cluster-bind",
            "10.0.0.4:7450",
            "--peers",
            "sync-1=sync@10.0.0.1:7450,sync-2=sync@10.0.0.2:7450,sync-3=sync@10.0.0.3:7450",
            "--election-policy",
            "counting",
        ]);
        assert!(cli.validate().is_ok());

        let config = cli.to_cluster_config().unwrap();
        assert_eq!(config.node_id, "entry-1");
        assert_eq!(config.role, NodeRole::Entry);
        assert_eq!(config.peers.len(), 3);
        assert_eq!(config.election.policy, ExtractionPolicy::Counting);
        assert_eq!(config.election_quorum(), 2);
        assert_eq!(config.lock_host().as_deref(), Some("sync-1"));
    }

    #[test]
    fn test_bool_flags_take_values() {
        let cli = Cli::parse_from(["ordod", "--persistence", "false", "--metrics", "false"]);
        assert!(!cli.persistence);
        assert!(!cli.metrics);
        assert!(cli.tcp_nodelay);
        assert!(!cli.to_cluster_config().unwrap().entry.persistent);
    }

    #[test]
    fn test_cluster_mode_requires_peers() {
        let cli = Cli::parse_from(["ordod", "--mode", "cluster", "--node-id", "sync-1"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_malformed_peer() {
        let cli = Cli::parse_from([
            "ordod",
            "--mode",
            "cluster",
            "--node-id",
            "sync-1",
            "--role",
            "sync",
            "--peers",
            "entry-1@10.0.0.4:7450",
        ]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_quorum_larger_than_membership() {
        let cli = Cli::parse_from(["ordod", "--election-quorum", "2"]);
        assert!(cli.validate().is_err());
    }
}
