//! # Ordo Cluster
//!
//! Leaderless ordering of published events for a clustered router:
//! - **Draft election**: sync nodes agree on strictly increasing segment ids
//!   without a leader
//! - **Commit watermark**: entry nodes replicate history and confirm a
//!   segment once a quorum has persisted it
//! - **Event-source lock**: one entry node redistributes finalized events
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │          Entry Node          │        │          Sync Node           │
//! ├──────────────────────────────┤        ├──────────────────────────────┤
//! │ • Segment buffer (owner)     │ ─────► │ • Draft election             │
//! │ • History replica (redb)     │ ◄───── │ • Commit watermark           │
//! │ • Event-source dispatch      │        │ • Retained table (lock host) │
//! └──────────────────────────────┘        └──────────────────────────────┘
//!                 ▲                                      ▲
//!                 └────────── topic bus / TCP ───────────┘
//! ```
//!
//! Final ids are `prefix ‖ counter ‖ offset`, encoded so that byte order is
//! commit order: every node sees every id in the same order.
//!
//! ## Deployment Modes
//!
//! - **Standalone**: one sync and one entry node in a single process
//! - **Cluster**: every node in its own process, connected over TCP
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use ordo_cluster::prelude::*;
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! let config = ClusterConfig::standalone();
//! let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
//! let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
//!
//! let sync = SyncNode::new(&config, Arc::new(MinuteClock), Instant::now())?;
//! SyncService::spawn(sync, bus.clone(), config.heartbeat.interval, shutdown_tx.subscribe());
//!
//! let entry_config = config.for_member("entry-1")?;
//! let entry = EntryNode::new(&entry_config, Arc::new(MemoryHistory::new()), Arc::new(LocalDispatch::new()))?;
//! let (handle, _) = EntryService::spawn(entry, bus, config.heartbeat.interval, shutdown_tx.subscribe());
//!
//! let (id, _) = handle.append_and_commit(RouterEvent::new("realm1", "app.topic", b"hi".to_vec())).await?;
//! ```

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod election;
pub mod entry_node;
pub mod error;
pub mod event;
pub mod id;
pub mod lock;
pub mod membership;
pub mod node;
pub mod observability;
pub mod protocol;
pub mod quorum;
pub mod retained;
pub mod segment;
pub mod storage;
pub mod sync_node;
pub mod transport;
pub mod watermark;

// Re-export main types
pub use bus::{Bus, LocalBus};
pub use config::{
    ClusterConfig, ClusterMode, CommitConfig, ElectionConfig, EntryConfig, HeartbeatConfig,
    PeerConfig,
};
pub use dispatch::{Dispatch, LocalDispatch};
pub use election::{DraftElection, DraftProposal, ElectSegment, ExtractionPolicy};
pub use entry_node::{CommitReceipt, EntryHandle, EntryNode, EntryService, EntryStatus};
pub use error::{ClusterError, Result};
pub use event::{FinalEvent, PublishOptions, RouterEvent};
pub use id::{ComplexId, FixedPrefix, MinuteClock, MonotonicIdGenerator, PrefixSource};
pub use lock::{EventSourceLock, EVENT_SOURCE_KEY};
pub use membership::{MemberTracker, MembershipEvent};
pub use node::{NodeId, NodeInfo, NodeRole, NodeState};
pub use observability::{init_metrics, ClusterMetrics, ElectionMetrics, SegmentMetrics};
pub use protocol::{ClusterMessage, Envelope, Topic};
pub use retained::RetainedTable;
pub use segment::{AdvanceSegment, SegmentBuffer};
pub use storage::{HistoryStore, MemoryHistory, RedbHistory};
pub use sync_node::{SyncHandle, SyncNode, SyncService, SyncStatus};
pub use transport::{Transport, TransportConfig};
pub use watermark::{CommitSegment, CommitWatermark};

/// Re-export common types
pub mod prelude {
    pub use crate::bus::*;
    pub use crate::config::*;
    pub use crate::dispatch::*;
    pub use crate::entry_node::*;
    pub use crate::error::*;
    pub use crate::event::*;
    pub use crate::id::{FixedPrefix, MinuteClock, PrefixSource};
    pub use crate::node::*;
    pub use crate::storage::{HistoryStore, MemoryHistory, RedbHistory};
    pub use crate::sync_node::*;
}
