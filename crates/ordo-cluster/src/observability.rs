//! Metrics for the ordering layer
//!
//! Thin facades over the `metrics` crate. With the `metrics-prometheus`
//! feature disabled every call compiles to nothing.
//!
//! ```rust,ignore
//! use ordo_cluster::observability::{init_metrics, ElectionMetrics};
//!
//! init_metrics(Some("0.0.0.0:9090".parse()?))?;
//! ElectionMetrics::record_elected();
//! ```

use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Election Metrics
// ============================================================================

/// Draft election metrics (sync nodes)
pub struct ElectionMetrics;

impl ElectionMetrics {
    /// Drafts issued by this node
    pub fn record_draft() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("ordo_election_drafts_total").increment(1);
    }

    /// Segments elected by this node
    pub fn record_elected() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("ordo_election_elected_total").increment(1);
    }

    /// Refused elections that would have reordered ids
    pub fn record_order_violation() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("ordo_election_order_violations_total").increment(1);
    }

    /// Drafts waiting for extraction
    pub fn set_pending(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("ordo_election_pending_drafts").set(count as f64);
    }
}

// ============================================================================
// Segment Metrics
// ============================================================================

/// Segment buffer and commit metrics
pub struct SegmentMetrics;

impl SegmentMetrics {
    /// Events accepted into segments
    pub fn record_appended() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("ordo_segment_events_appended_total").increment(1);
    }

    /// Commit watermarks reached
    pub fn record_committed() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("ordo_segment_committed_total").increment(1);
    }

    /// Events written to history under their final id
    pub fn add_persisted(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("ordo_segment_events_persisted_total").increment(count as u64);
    }

    /// Generate requests re-broadcast by the watchdog
    pub fn record_stall_rebroadcast() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("ordo_segment_stall_rebroadcasts_total").increment(1);
    }

    /// Commit requests refused because the queue was full
    pub fn record_backpressure() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("ordo_segment_backpressure_total").increment(1);
    }

    /// Queued plus in-flight segments
    pub fn set_pending_segments(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("ordo_segment_pending").set(count as f64);
    }

    /// Time from commit request to confirmation
    pub fn record_commit_latency(duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("ordo_segment_commit_latency_seconds").record(duration.as_secs_f64());
    }
}

// ============================================================================
// Cluster Metrics
// ============================================================================

/// Membership and event-source metrics
pub struct ClusterMetrics;

impl ClusterMetrics {
    /// Members currently counted by a node's quorums
    pub fn set_member_count(role: &str, count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("ordo_cluster_members", "role" => role.to_string()).set(count as f64);
    }

    /// Nodes declared dead by the failure detector
    pub fn increment_failures_detected() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("ordo_cluster_failures_detected_total").increment(1);
    }

    /// Whether this node is the event source (1 = yes, 0 = no)
    pub fn set_event_source(holder: bool) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("ordo_cluster_event_source").set(if holder { 1.0 } else { 0.0 });
    }
}

// ============================================================================
// Network Metrics
// ============================================================================

/// Transport metrics
pub struct NetworkMetrics;

impl NetworkMetrics {
    pub fn add_bytes_sent(bytes: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("ordo_network_bytes_sent_total").increment(bytes);
    }

    pub fn add_bytes_received(bytes: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("ordo_network_bytes_received_total").increment(bytes);
    }

    /// Outbound peer connections currently open
    pub fn set_active_connections(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("ordo_network_active_connections").set(count as f64);
    }

    /// Messages dropped after a failed write
    pub fn increment_dropped(peer: &str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("ordo_network_dropped_total", "peer" => peer.to_string()).increment(1);
    }
}

// ============================================================================
// Prometheus Backend (when enabled)
// ============================================================================

#[cfg(feature = "metrics-prometheus")]
mod prom {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    /// Install the Prometheus recorder and serve `/metrics` on `addr`
    pub fn init_prometheus_exporter(
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new().with_http_listener(addr).install()?;

        tracing::info!("Prometheus metrics exporter listening on http://{}/metrics", addr);
        Ok(())
    }
}

#[cfg(feature = "metrics-prometheus")]
pub use prom::init_prometheus_exporter;

// ============================================================================
// Unified Initialization
// ============================================================================

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the metrics subsystem. Safe to call more than once.
#[cfg_attr(not(feature = "metrics-prometheus"), allow(unused_variables))]
pub fn init_metrics(
    prometheus_addr: Option<std::net::SocketAddr>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    METRICS_INITIALIZED.get_or_init(|| {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(addr) = prometheus_addr {
            if let Err(e) = init_prometheus_exporter(addr) {
                tracing::error!("Failed to start Prometheus exporter: {}", e);
            }
        }

        tracing::info!(
            prometheus = cfg!(feature = "metrics-prometheus"),
            "Metrics subsystem initialized"
        );
    });

    Ok(())
}
