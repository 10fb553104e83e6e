//! Two sync nodes and two entry nodes, each with its own TCP transport

use ordo_cluster::config::{ClusterConfig, ElectionConfig, HeartbeatConfig, PeerConfig};
use ordo_cluster::dispatch::LocalDispatch;
use ordo_cluster::entry_node::{EntryHandle, EntryNode, EntryService};
use ordo_cluster::event::RouterEvent;
use ordo_cluster::id::FixedPrefix;
use ordo_cluster::node::NodeRole;
use ordo_cluster::protocol::Topic;
use ordo_cluster::storage::{HistoryStore, RedbHistory};
use ordo_cluster::sync_node::{SyncNode, SyncService};
use ordo_cluster::transport::{Transport, TransportConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout;

const MEMBERS: [(&str, NodeRole); 4] = [
    ("s1", NodeRole::Sync),
    ("s2", NodeRole::Sync),
    ("e1", NodeRole::Entry),
    ("e2", NodeRole::Entry),
];

#[tokio::test]
async fn test_commit_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let (shutdown, _) = broadcast::channel(1);

    let mut transports = Vec::new();
    let mut addrs = Vec::new();
    for (id, _) in MEMBERS {
        let transport = Arc::new(Transport::new(
            id.to_string(),
            "127.0.0.1:0".parse().unwrap(),
            TransportConfig::default(),
        ));
        addrs.push(transport.start().await.unwrap());
        transports.push(transport);
    }

    let config = ClusterConfig::cluster()
        .node_id("s1")
        .role(NodeRole::Sync)
        .cluster_addr(addrs[0])
        .peers(
            MEMBERS[1..]
                .iter()
                .zip(&addrs[1..])
                .map(|((id, role), addr)| PeerConfig::new(*id, *role).with_addr(*addr)),
        )
        .election(ElectionConfig {
            prefix_width: 1,
            ..ElectionConfig::default()
        })
        .heartbeat(HeartbeatConfig {
            interval: Duration::from_millis(50),
            suspect_after: Duration::from_secs(20),
            dead_after: Duration::from_secs(60),
        })
        .data_dir(dir.path())
        .build();
    config.validate().unwrap();
    let lock_host = config.lock_host();

    for (transport, (id, _)) in transports.iter().zip(MEMBERS) {
        for (peer, role) in MEMBERS {
            let addr = config
                .members()
                .into_iter()
                .find(|m| m.id == peer)
                .and_then(|m| m.cluster_addr)
                .unwrap();
            let hosts_lock = lock_host.as_deref() == Some(peer);
            transport.add_peer(peer.to_string(), addr, Topic::subscriptions(role, hosts_lock));
        }
        assert_eq!(transport.peer_count(), 3, "{id} should skip itself");
    }

    let interval = config.heartbeat.interval;
    let mut handles: Vec<EntryHandle> = Vec::new();
    let mut histories = Vec::new();
    for (transport, (id, role)) in transports.iter().zip(MEMBERS) {
        let member = config.for_member(id).unwrap();
        match role {
            NodeRole::Sync => {
                let node =
                    SyncNode::new(&member, Arc::new(FixedPrefix("P".into())), Instant::now()).unwrap();
                SyncService::spawn(node, transport.clone(), interval, shutdown.subscribe());
            }
            NodeRole::Entry => {
                let history = Arc::new(RedbHistory::open(dir.path().join(format!("{id}.redb"))).unwrap());
                let node = EntryNode::new(&member, history.clone(), Arc::new(LocalDispatch::new())).unwrap();
                let (handle, _) = EntryService::spawn(node, transport.clone(), interval, shutdown.subscribe());
                handles.push(handle);
                histories.push(history);
            }
        }
    }

    let mut ids = Vec::new();
    for (n, handle) in handles.iter().enumerate() {
        let event = RouterEvent::new("realm1", "app.tcp", vec![n as u8]);
        let (id, receipt) = timeout(Duration::from_secs(10), handle.append_and_commit(event))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(receipt.final_ids, vec![id.clone()]);
        ids.push(id);
    }
    assert!(ids[0] < ids[1]);

    // commit quorum is both entries, so both wrote both events
    for history in &histories {
        assert_eq!(history.len().unwrap(), 2);
        assert_eq!(history.scan_max_id().unwrap().as_deref(), Some(ids[1].as_str()));
        assert_eq!(history.get(&ids[0]).unwrap().unwrap().body, vec![0]);
    }

    shutdown.send(()).unwrap();
    for transport in &transports {
        transport.shutdown();
    }
}
