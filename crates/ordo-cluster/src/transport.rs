//! TCP transport for cluster communication
//!
//! Implements [`Bus`] across processes. Every envelope is postcard-encoded
//! once and written as a length-prefixed frame to each peer subscribed to
//! its topic, then delivered to local subscribers.
//!
//! Features:
//! - One writer task and one connection per peer, so a peer receives a
//!   sender's messages in publish order
//! - Lazy connection with reconnect backoff
//! - Frames that cannot be written are dropped and counted; the entry
//!   watchdog recovers the protocol from loss

use crate::bus::{Bus, LocalBus, Subscription};
use crate::error::{ClusterError, Result};
use crate::node::NodeId;
use crate::observability::NetworkMetrics;
use crate::protocol::{
    decode_envelope, encode_envelope, frame_length, frame_message, Envelope, Topic,
    MAX_MESSAGE_SIZE,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Timeout for reading a frame body once its header arrived
    pub read_timeout: Duration,
    /// Write timeout
    pub write_timeout: Duration,
    /// Pause after a failed connect before trying again
    pub reconnect_backoff: Duration,
    /// Enable TCP nodelay
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_millis(250),
            tcp_nodelay: true,
        }
    }
}

type Frame = Arc<Vec<u8>>;

struct PeerLink {
    addr: SocketAddr,
    topics: Vec<Topic>,
    tx: mpsc::UnboundedSender<Frame>,
}

/// Network transport manager
pub struct Transport {
    /// Our node ID
    local_node: NodeId,

    /// Bind address for incoming connections
    bind_addr: SocketAddr,

    /// Configuration
    config: TransportConfig,

    /// Outbound links by peer
    peers: DashMap<NodeId, PeerLink>,

    /// Subscribers in this process
    local: Arc<LocalBus>,

    /// Open outbound connections
    connections: Arc<AtomicUsize>,

    /// Bound address once started
    local_addr: Mutex<Option<SocketAddr>>,

    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Transport {
    /// Create new transport
    pub fn new(local_node: NodeId, bind_addr: SocketAddr, config: TransportConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            local_node,
            bind_addr,
            config,
            peers: DashMap::new(),
            local: Arc::new(LocalBus::new()),
            connections: Arc::new(AtomicUsize::new(0)),
            local_addr: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Register a peer and the topics it subscribes to. Must be called from
    /// within a tokio runtime.
    pub fn add_peer(&self, node_id: NodeId, addr: SocketAddr, topics: Vec<Topic>) {
        if node_id == self.local_node {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(
            node_id.clone(),
            addr,
            self.config.clone(),
            rx,
            self.shutdown_tx.subscribe(),
            self.connections.clone(),
        ));
        debug!(peer = %node_id, addr = %addr, ?topics, "added peer");
        self.peers.insert(node_id, PeerLink { addr, topics, tx });
    }

    /// Remove a peer; its writer task ends once its queue drains
    pub fn remove_peer(&self, node_id: &NodeId) {
        self.peers.remove(node_id);
    }

    pub fn peer_addr(&self, node_id: &NodeId) -> Option<SocketAddr> {
        self.peers.get(node_id).map(|link| link.addr)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Start the transport (begin accepting connections)
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| ClusterError::Network(format!("failed to bind {}: {}", self.bind_addr, e)))?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);

        info!(node = %self.local_node, addr = %addr, "transport listening");

        let local = self.local.clone();
        let config = self.config.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                debug!(peer = %peer, "accepted connection");
                                let local = local.clone();
                                let config = config.clone();
                                let shutdown = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, local, config, shutdown).await {
                                        debug!(peer = %peer, error = %e, "connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "accept error");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("transport shutting down");
                        break;
                    }
                }
            }
        });

        Ok(addr)
    }

    /// Shutdown the transport
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.peers.clear();
    }
}

impl Bus for Transport {
    fn publish(&self, envelope: Envelope) -> Result<()> {
        let interested: Vec<_> = self
            .peers
            .iter()
            .filter(|link| link.topics.contains(&envelope.topic))
            .map(|link| (link.key().clone(), link.tx.clone()))
            .collect();

        if !interested.is_empty() {
            let frame: Frame = Arc::new(frame_message(&encode_envelope(&envelope)?));
            for (peer, tx) in interested {
                if tx.send(frame.clone()).is_err() {
                    NetworkMetrics::increment_dropped(&peer);
                }
            }
        }
        self.local.publish(envelope)
    }

    fn subscribe(&self, node: &NodeId, topics: &[Topic]) -> Subscription {
        self.local.subscribe(node, topics)
    }
}

async fn connect(addr: SocketAddr, config: &TransportConfig) -> Result<TcpStream> {
    let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ClusterError::Timeout)?
        .map_err(|e| ClusterError::ConnectionFailed(e.to_string()))?;
    if config.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }
    Ok(stream)
}

async fn run_writer(
    peer: NodeId,
    addr: SocketAddr,
    config: TransportConfig,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: broadcast::Receiver<()>,
    connections: Arc<AtomicUsize>,
) {
    let mut stream: Option<TcpStream> = None;
    let mut retry_at: Option<Instant> = None;

    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.recv() => break,
        };

        if stream.is_none() {
            if retry_at.map_or(false, |at| Instant::now() < at) {
                NetworkMetrics::increment_dropped(&peer);
                continue;
            }
            match connect(addr, &config).await {
                Ok(connected) => {
                    debug!(peer = %peer, addr = %addr, "connected to peer");
                    stream = Some(connected);
                    retry_at = None;
                    let open = connections.fetch_add(1, Ordering::Relaxed) + 1;
                    NetworkMetrics::set_active_connections(open);
                }
                Err(e) => {
                    warn!(peer = %peer, addr = %addr, error = %e, "peer unreachable, dropping message");
                    retry_at = Some(Instant::now() + config.reconnect_backoff);
                    NetworkMetrics::increment_dropped(&peer);
                    continue;
                }
            }
        }

        let written = match stream.as_mut() {
            Some(s) => timeout(config.write_timeout, s.write_all(&frame)).await,
            None => continue,
        };
        match written {
            Ok(Ok(())) => NetworkMetrics::add_bytes_sent(frame.len() as u64),
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "write failed, dropping message");
                stream = None;
                let open = connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
                NetworkMetrics::set_active_connections(open);
                NetworkMetrics::increment_dropped(&peer);
            }
            Err(_) => {
                warn!(peer = %peer, "write timed out, dropping message");
                stream = None;
                let open = connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
                NetworkMetrics::set_active_connections(open);
                NetworkMetrics::increment_dropped(&peer);
            }
        }
    }

    if stream.is_some() {
        let open = connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        NetworkMetrics::set_active_connections(open);
    }
    debug!(peer = %peer, "peer writer stopped");
}

/// Read frames from an inbound connection into the local bus
async fn handle_connection(
    mut stream: TcpStream,
    local: Arc<LocalBus>,
    config: TransportConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    if config.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }

    let mut length_buf = [0u8; 4];

    loop {
        tokio::select! {
            read = stream.read_exact(&mut length_buf) => match read {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(ClusterError::Io(e)),
            },
            _ = shutdown.recv() => return Ok(()),
        }

        let length = frame_length(&length_buf);
        if length > MAX_MESSAGE_SIZE {
            return Err(ClusterError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut body = vec![0u8; length];
        timeout(config.read_timeout, stream.read_exact(&mut body))
            .await
            .map_err(|_| ClusterError::Timeout)?
            .map_err(ClusterError::Io)?;
        NetworkMetrics::add_bytes_received((length + 4) as u64);

        match decode_envelope(&body) {
            Ok(envelope) => local.publish(envelope)?,
            Err(e) => warn!(error = %e, "dropping undecodable frame"),
        }
    }
}
