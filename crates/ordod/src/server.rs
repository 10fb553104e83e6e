//! Node wiring for the daemon
//!
//! Standalone mode hosts a sync node and an entry node on an in-process bus.
//! Cluster mode hosts this node's role behind a TCP transport.

use crate::cli::Cli;
use anyhow::Context;
use ordo_cluster::bus::{Bus, LocalBus};
use ordo_cluster::config::ClusterConfig;
use ordo_cluster::dispatch::LocalDispatch;
use ordo_cluster::entry_node::{EntryHandle, EntryNode, EntryService};
use ordo_cluster::id::MinuteClock;
use ordo_cluster::node::NodeRole;
use ordo_cluster::observability::init_metrics;
use ordo_cluster::protocol::Topic;
use ordo_cluster::storage::{HistoryStore, MemoryHistory, RedbHistory};
use ordo_cluster::sync_node::{SyncHandle, SyncNode, SyncService};
use ordo_cluster::transport::Transport;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long stopped services get to publish their last messages
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle for triggering shutdown from outside the server
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Ordo daemon: the nodes this process hosts
pub struct OrdoServer {
    config: ClusterConfig,
    metrics_addr: Option<std::net::SocketAddr>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Services started by [`OrdoServer::start`]
pub struct RunningServer {
    /// Entry node handle, when this process hosts one
    pub entry: Option<EntryHandle>,
    /// Sync node handle, when this process hosts one
    pub sync: Option<SyncHandle>,
    transport: Option<Arc<Transport>>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl OrdoServer {
    pub fn new(cli: &Cli) -> anyhow::Result<Self> {
        cli.validate().map_err(anyhow::Error::msg)?;
        let config = cli.to_cluster_config().map_err(anyhow::Error::msg)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            metrics_addr: cli.metrics.then_some(cli.metrics_bind),
            shutdown_tx,
        })
    }

    pub fn from_config(config: ClusterConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            metrics_addr: None,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Start every hosted node
    pub async fn start(&self) -> anyhow::Result<RunningServer> {
        if self.metrics_addr.is_some() {
            init_metrics(self.metrics_addr).map_err(|e| anyhow::anyhow!("failed to initialize metrics: {e}"))?;
        }

        let mut running = RunningServer {
            entry: None,
            sync: None,
            transport: None,
            tasks: Vec::new(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };

        if self.config.is_cluster() {
            let transport = Arc::new(Transport::new(
                self.config.node_id.clone(),
                self.config.cluster_addr,
                self.config.transport.clone(),
            ));
            let addr = transport.start().await.context("failed to start cluster transport")?;
            info!(node = %self.config.node_id, addr = %addr, "cluster transport started");

            let lock_host = self.config.lock_host();
            for member in self.config.members() {
                let Some(addr) = member.cluster_addr else {
                    continue;
                };
                let hosts_lock = lock_host.as_deref() == Some(member.id.as_str());
                transport.add_peer(member.id.clone(), addr, Topic::subscriptions(member.role, hosts_lock));
            }
            info!(peers = transport.peer_count(), "cluster peers registered");

            self.start_node(&self.config, transport.clone(), &mut running)?;
            running.transport = Some(transport);
        } else {
            let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
            self.start_node(&self.config, bus.clone(), &mut running)?;
            for entry in self.config.entry_members() {
                let member = self.config.for_member(&entry)?;
                self.start_node(&member, bus.clone(), &mut running)?;
            }
        }

        Ok(running)
    }

    fn start_node(
        &self,
        config: &ClusterConfig,
        bus: Arc<dyn Bus>,
        running: &mut RunningServer,
    ) -> anyhow::Result<()> {
        let interval = config.heartbeat.interval;
        match config.role {
            NodeRole::Sync => {
                let node = SyncNode::new(config, Arc::new(MinuteClock), Instant::now())?;
                info!(
                    node = %config.node_id,
                    lock_host = node.is_lock_host(),
                    sync_members = config.sync_members().len(),
                    "starting sync node"
                );
                running.sync = Some(SyncService::spawn(node, bus, interval, self.shutdown_tx.subscribe()));
            }
            NodeRole::Entry => {
                let history = open_history(config)?;
                let dispatch = Arc::new(LocalDispatch::new());
                running.tasks.push(log_dispatched(&dispatch, self.shutdown_tx.subscribe()));

                let node = EntryNode::new(config, history, dispatch)?;
                info!(
                    node = %config.node_id,
                    event_source = config.entry.event_source,
                    "starting entry node"
                );
                let (handle, task) = EntryService::spawn(node, bus, interval, self.shutdown_tx.subscribe());
                running.tasks.push(task);
                running.entry = Some(handle);
            }
        }
        Ok(())
    }

    /// Start, then run until shutdown is requested
    pub async fn run(self) -> anyhow::Result<()> {
        let running = self.start().await?;
        running.wait().await;
        Ok(())
    }
}

impl RunningServer {
    /// Wait for shutdown, then let the services drain
    pub async fn wait(mut self) {
        let _ = self.shutdown_rx.recv().await;
        info!("shutting down nodes");

        // drop our handle so the entry service can see every handle gone
        self.entry = None;
        let tasks = std::mem::take(&mut self.tasks);
        let sync = self.sync.take();
        let drain = async move {
            for task in tasks {
                let _ = task.await;
            }
            if let Some(sync) = sync {
                sync.join().await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("services did not stop within {:?}", DRAIN_TIMEOUT);
        }

        if let Some(transport) = self.transport.take() {
            transport.shutdown();
        }
    }
}

fn open_history(config: &ClusterConfig) -> anyhow::Result<Arc<dyn HistoryStore>> {
    if !config.entry.persistent {
        return Ok(Arc::new(MemoryHistory::new()));
    }
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;
    let path = config.data_dir.join(format!("{}.redb", config.node_id));
    let history = RedbHistory::open(&path)
        .with_context(|| format!("failed to open history {}", path.display()))?;
    info!(path = %path.display(), records = history.len()?, "opened event history");
    Ok(Arc::new(history))
}

fn log_dispatched(dispatch: &LocalDispatch, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    let mut events = dispatch.subscribe_all();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => debug!(id = %event.id, realm = %event.event.realm, uri = %event.event.uri, "dispatched"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dispatch log lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.recv() => break,
            }
        }
    })
}
