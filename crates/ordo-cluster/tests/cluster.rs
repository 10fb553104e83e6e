//! Three sync nodes and two entry nodes on an in-process bus

use ordo_cluster::bus::LocalBus;
use ordo_cluster::config::{ClusterConfig, ElectionConfig, EntryConfig, HeartbeatConfig, PeerConfig};
use ordo_cluster::dispatch::{Dispatch, LocalDispatch};
use ordo_cluster::entry_node::{EntryHandle, EntryNode, EntryService};
use ordo_cluster::event::{FinalEvent, RouterEvent};
use ordo_cluster::id::FixedPrefix;
use ordo_cluster::node::{NodeId, NodeRole};
use ordo_cluster::protocol::{ClusterMessage, Envelope};
use ordo_cluster::storage::{HistoryStore, MemoryHistory};
use ordo_cluster::sync_node::{SyncNode, SyncService};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

struct Cluster {
    bus: Arc<LocalBus>,
    entries: Vec<Entry>,
    shutdown: broadcast::Sender<()>,
}

struct Entry {
    handle: EntryHandle,
    history: Arc<MemoryHistory>,
    dispatch: Arc<LocalDispatch>,
}

fn config() -> ClusterConfig {
    let addr = |port: u16| SocketAddr::from(([127, 0, 0, 1], port));
    ClusterConfig::cluster()
        .node_id("s1")
        .role(NodeRole::Sync)
        .cluster_addr(addr(7101))
        .peers([
            PeerConfig::new("s2", NodeRole::Sync).with_addr(addr(7102)),
            PeerConfig::new("s3", NodeRole::Sync).with_addr(addr(7103)),
            PeerConfig::new("e1", NodeRole::Entry).with_addr(addr(7111)),
            PeerConfig::new("e2", NodeRole::Entry).with_addr(addr(7112)),
        ])
        .election(ElectionConfig {
            prefix_width: 1,
            ..ElectionConfig::default()
        })
        .heartbeat(HeartbeatConfig {
            interval: Duration::from_millis(20),
            suspect_after: Duration::from_secs(20),
            dead_after: Duration::from_secs(60),
        })
        .entry(EntryConfig {
            stall_timeout: Duration::from_millis(200),
            watchdog_interval: Duration::from_millis(50),
            persistent: false,
            ..EntryConfig::default()
        })
        .build()
}

fn start() -> Cluster {
    let config = config();
    let bus = Arc::new(LocalBus::new());
    let (shutdown, _) = broadcast::channel(1);
    let interval = config.heartbeat.interval;

    for id in ["s1", "s2", "s3"] {
        let member = config.for_member(id).unwrap();
        let node = SyncNode::new(&member, Arc::new(FixedPrefix("P".into())), Instant::now()).unwrap();
        SyncService::spawn(node, bus.clone(), interval, shutdown.subscribe());
    }

    let entries = ["e1", "e2"]
        .into_iter()
        .map(|id| {
            let member = config.for_member(id).unwrap();
            let history = Arc::new(MemoryHistory::new());
            let dispatch = Arc::new(LocalDispatch::new());
            let node = EntryNode::new(&member, history.clone(), dispatch.clone()).unwrap();
            let (handle, _) = EntryService::spawn(node, bus.clone(), interval, shutdown.subscribe());
            Entry {
                handle,
                history,
                dispatch,
            }
        })
        .collect();

    Cluster {
        bus,
        entries,
        shutdown,
    }
}

/// Index of the entry holding the event-source lock
async fn wait_for_event_source(cluster: &Cluster) -> usize {
    timeout(WAIT, async {
        loop {
            for (i, entry) in cluster.entries.iter().enumerate() {
                if entry.handle.status().await.unwrap().event_source {
                    return i;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no entry acquired the event-source lock")
}

fn event(uri: &str, n: usize) -> RouterEvent {
    RouterEvent::new("realm1", uri, format!("{n}").into_bytes())
}

#[tokio::test]
async fn test_two_entries_commit_in_one_order() {
    let cluster = start();
    let source = wait_for_event_source(&cluster).await;
    let mut dispatched = cluster.entries[source].dispatch.subscribe_all();

    let mut tasks = Vec::new();
    for (i, entry) in cluster.entries.iter().enumerate() {
        let handle = entry.handle.clone();
        tasks.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for n in 0..10 {
                let (id, _) = handle
                    .append_and_commit(event(&format!("app.e{i}"), n))
                    .await
                    .unwrap();
                ids.push(id);
            }
            ids
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        let ids = timeout(WAIT, task).await.unwrap().unwrap();
        // each entry's own events keep their order
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "{ids:?}");
        all.extend(ids);
    }
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(unique.len(), 20);

    // both replicas persist every event under the same ids
    let mut expected = all.clone();
    expected.sort();
    for entry in &cluster.entries {
        timeout(WAIT, async {
            while entry.history.len().unwrap() < 20 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(entry.history.ids(), expected);
    }

    let mut seen: Vec<FinalEvent> = Vec::new();
    while seen.len() < 20 {
        seen.push(timeout(WAIT, dispatched.recv()).await.unwrap().unwrap());
    }
    let dispatched_ids: HashSet<&String> = seen.iter().map(|e| &e.id).collect();
    assert_eq!(dispatched_ids, unique);

    let other = &cluster.entries[1 - source];
    assert!(!other.handle.status().await.unwrap().event_source);

    cluster.shutdown.send(()).unwrap();
}

#[tokio::test]
async fn test_dispatch_by_uri() {
    let cluster = start();
    let source = wait_for_event_source(&cluster).await;
    let mut topic = cluster.entries[source].dispatch.subscribe("app.orders");

    let handle = &cluster.entries[0].handle;
    handle.append_and_commit(event("app.other", 0)).await.unwrap();
    let (id, _) = handle.append_and_commit(event("app.orders", 1)).await.unwrap();

    let received = timeout(WAIT, topic.recv()).await.unwrap().unwrap();
    assert_eq!(received.id, id);
    assert_eq!(received.event.data, b"1".to_vec());

    cluster.shutdown.send(()).unwrap();
}

#[tokio::test]
async fn test_lost_generate_requests_are_rebroadcast() {
    let cluster = start();
    wait_for_event_source(&cluster).await;

    cluster.bus.set_drop_rule(Arc::new(|_: &NodeId, envelope: &Envelope| {
        matches!(envelope.message, ClusterMessage::GenerateSegment(_))
    }));

    let handle = cluster.entries[1].handle.clone();
    let commit = tokio::spawn(async move { handle.append_and_commit(event("app.x", 0)).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!commit.is_finished());
    cluster.bus.clear_drop_rule();

    let (id, receipt) = timeout(WAIT, commit).await.unwrap().unwrap().unwrap();
    assert_eq!(receipt.final_ids, vec![id]);

    cluster.shutdown.send(()).unwrap();
}

#[tokio::test]
async fn test_lost_commit_votes_are_repeated() {
    let cluster = start();
    wait_for_event_source(&cluster).await;

    // votes are lost until the rule is cleared
    cluster.bus.set_drop_rule(Arc::new(|_: &NodeId, envelope: &Envelope| {
        matches!(envelope.message, ClusterMessage::CommitVote { .. })
    }));

    let handle = cluster.entries[0].handle.clone();
    let commit = tokio::spawn(async move { handle.append_and_commit(event("app.y", 0)).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!commit.is_finished());
    cluster.bus.clear_drop_rule();

    let (id, _) = timeout(WAIT, commit).await.unwrap().unwrap().unwrap();
    let status = cluster.entries[0].handle.status().await.unwrap();
    assert_eq!(status.floor.as_deref(), Some(id.as_str()));
    assert_eq!(status.pending_segments, 0);

    cluster.shutdown.send(()).unwrap();
}

#[tokio::test]
async fn test_handles_fail_after_shutdown() {
    let cluster = start();
    cluster.shutdown.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = cluster.entries[0]
        .handle
        .append(event("app.z", 0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ordo_cluster::ClusterError::SessionClosed | ordo_cluster::ClusterError::ShuttingDown
    ));
}
