//! Entry node: accepts events, replicates history and dispatches
//!
//! An entry node plays three parts at once:
//!
//! - **owner** of its own segments: events are buffered in the
//!   [`SegmentBuffer`], ordered by the sync nodes and confirmed by the
//!   commit watermark, one segment in flight at a time
//! - **storage replica** for every entry's segments: buffered events arrive
//!   as `KeepAdvanceHistory`, are persisted under their final ids once the
//!   segment is elected, and the last id is voted into the watermark
//! - **event source** candidate: the holder of the event-source lock hands
//!   every committed segment to the local [`Dispatch`]
//!
//! ```text
//!  append ──► KeepAdvanceHistory ──► replicas         GenerateSegment ──► sync
//!  commit ──► GenerateSegment                          ElectSegment ◄──── sync
//!             replica: persist ──► CommitVote ──► sync
//!             CommitSegment ◄── sync ──► owner confirms, holder dispatches
//! ```

use crate::bus::{publish_all, Bus, Subscription};
use crate::config::{ClusterConfig, EntryConfig};
use crate::dispatch::Dispatch;
use crate::election::ElectSegment;
use crate::error::{ClusterError, Result};
use crate::event::{FinalEvent, RouterEvent};
use crate::lock::{EventSourceLock, LockEvent};
use crate::node::{NodeId, NodeRole};
use crate::observability::{ClusterMetrics, SegmentMetrics};
use crate::protocol::{ClusterMessage, Envelope, Outbound, ResolvedId, Topic};
use crate::retained::RetainedChange;
use crate::segment::{final_id, AdvanceId, AdvanceSegment, Appended, CommittedSegment, SegmentBuffer};
use crate::storage::HistoryStore;
use crate::watermark::CommitSegment;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Receipts kept for commits of segments that already completed
const RECENT_RECEIPTS: usize = 256;

/// Evicted segment keys kept to recognise late messages for them
const FORGOTTEN_SEGMENTS: usize = 4096;

/// Segment held by a replica until it can be persisted
#[derive(Debug)]
struct PendingReplica {
    events: BTreeMap<u64, RouterEvent>,
    elect: Option<ElectSegment>,
    elect_sources: HashSet<NodeId>,
    committed: bool,
    touched: Instant,
}

impl PendingReplica {
    fn new(now: Instant) -> Self {
        Self {
            events: BTreeMap::new(),
            elect: None,
            elect_sources: HashSet::new(),
            committed: false,
            touched: now,
        }
    }

    /// Events in offset order once every offset of the elected segment
    /// is present
    fn complete(&self) -> Option<(&ElectSegment, Vec<&RouterEvent>)> {
        let elect = self.elect.as_ref()?;
        let events: Vec<&RouterEvent> = (1..=elect.length)
            .map(|offset| self.events.get(&offset))
            .collect::<Option<_>>()?;
        Some((elect, events))
    }
}

#[derive(Debug)]
struct PersistedSegment {
    events: Vec<FinalEvent>,
    position: String,
    elect_sources: HashSet<NodeId>,
    dispatched: bool,
}

/// Entry node state machine
pub struct EntryNode {
    id: NodeId,
    config: EntryConfig,
    buffer: SegmentBuffer,
    pending: HashMap<AdvanceSegment, PendingReplica>,
    persisted: HashMap<AdvanceSegment, PersistedSegment>,
    persisted_order: VecDeque<AdvanceSegment>,
    /// Segments persisted here whose records were evicted
    forgotten: HashSet<AdvanceSegment>,
    forgotten_order: VecDeque<AdvanceSegment>,
    commit_started: HashMap<AdvanceSegment, Instant>,
    committed: Vec<CommittedSegment>,
    history: Arc<dyn HistoryStore>,
    dispatch: Arc<dyn Dispatch>,
    lock: Option<EventSourceLock>,
}

impl EntryNode {
    pub fn new(
        config: &ClusterConfig,
        history: Arc<dyn HistoryStore>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<Self> {
        if config.role != NodeRole::Entry {
            return Err(ClusterError::WrongRole {
                node: config.node_id.clone(),
                expected: NodeRole::Entry.as_str(),
            });
        }
        config.validate()?;

        // generations of a previous incarnation are all below the current time
        let start_generation = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut buffer = SegmentBuffer::new(
            config.node_id.clone(),
            start_generation,
            config.entry.max_pending_segments,
        );
        let floor = history.scan_max_id()?;
        if let Some(floor) = &floor {
            buffer.observe_floor(floor);
        }

        let lock = config.entry.event_source.then(|| {
            let session = format!("{}/{}", config.node_id, uuid::Uuid::new_v4());
            EventSourceLock::new(config.node_id.clone(), session)
        });

        info!(
            node = %config.node_id,
            start_generation,
            floor = ?floor,
            event_source = lock.is_some(),
            "entry node ready"
        );

        Ok(Self {
            id: config.node_id.clone(),
            config: config.entry.clone(),
            buffer,
            pending: HashMap::new(),
            persisted: HashMap::new(),
            persisted_order: VecDeque::new(),
            forgotten: HashSet::new(),
            forgotten_order: VecDeque::new(),
            commit_started: HashMap::new(),
            committed: Vec::new(),
            history,
            dispatch,
            lock,
        })
    }

    /// Messages to publish once subscribed
    pub fn startup(&mut self) -> Vec<Outbound> {
        match self.lock.as_mut() {
            Some(lock) => vec![Outbound::new(
                Topic::Lock,
                ClusterMessage::EventSourceClaim(lock.acquire()),
            )],
            None => Vec::new(),
        }
    }

    /// Buffer an event in the open segment and replicate it
    pub fn append(&mut self, event: RouterEvent) -> (Appended, Vec<Outbound>) {
        let appended = self.buffer.append_event(event.clone());
        SegmentMetrics::record_appended();

        let mut outbound = Vec::with_capacity(2);
        if appended.opened {
            outbound.push(Outbound::new(
                Topic::Sync,
                ClusterMessage::BeginAdvanceSegment {
                    advance: appended.advance.clone(),
                },
            ));
        }
        outbound.push(Outbound::new(
            Topic::Entry,
            ClusterMessage::KeepAdvanceHistory {
                advance_id: AdvanceId {
                    segment: appended.advance.clone(),
                    offset: appended.offset,
                },
                realm: event.realm,
                uri: event.uri,
                data: event.data,
                opt: event.opt,
                sid: event.sid,
            },
        ));
        (appended, outbound)
    }

    /// Seal `advance` and queue it for ordering
    pub fn commit(&mut self, advance: &AdvanceSegment, now: Instant) -> Result<Vec<Outbound>> {
        let request = match self.buffer.request_commit(advance, now) {
            Ok(request) => request,
            Err(e) => {
                if matches!(e, ClusterError::Backpressure { .. }) {
                    SegmentMetrics::record_backpressure();
                }
                return Err(e);
            }
        };
        self.commit_started.entry(advance.clone()).or_insert(now);
        SegmentMetrics::set_pending_segments(self.buffer.pending_segments());

        Ok(request
            .map(|request| Outbound::new(Topic::Sync, ClusterMessage::GenerateSegment(request)))
            .into_iter()
            .collect())
    }

    pub fn handle(&mut self, envelope: Envelope, now: Instant) -> Result<Vec<Outbound>> {
        let source = envelope.header.source;
        match envelope.message {
            ClusterMessage::KeepAdvanceHistory {
                advance_id,
                realm,
                uri,
                data,
                opt,
                sid,
            } => {
                let event = RouterEvent {
                    realm,
                    uri,
                    data,
                    opt,
                    sid,
                };
                self.on_keep_history(advance_id, event, now)
            }
            ClusterMessage::ElectSegment(elect) => self.on_elect(source, elect, now),
            ClusterMessage::CommitSegment(commit) => Ok(self.on_commit(commit, now)),
            ClusterMessage::EventSourceState(change) => Ok(self.on_lock_change(&change)),
            ClusterMessage::AdvanceSegmentResolved { advance, pkg, .. } => {
                trace!(from = %source, advance = %advance, events = pkg.len(), "replica resolved segment");
                Ok(Vec::new())
            }
            other => {
                trace!(from = %source, kind = other.kind(), "ignoring message");
                Ok(Vec::new())
            }
        }
    }

    fn on_keep_history(
        &mut self,
        advance_id: AdvanceId,
        event: RouterEvent,
        now: Instant,
    ) -> Result<Vec<Outbound>> {
        let AdvanceId { segment, offset } = advance_id;
        if self.persisted.contains_key(&segment) {
            return Ok(Vec::new());
        }
        let Some(replica) = self.replica_mut(&segment, now) else {
            trace!(advance = %segment, offset, "ignoring event of segment persisted earlier");
            return Ok(Vec::new());
        };
        replica.events.insert(offset, event);
        self.try_persist(&segment)
    }

    /// Replica state for `advance`, created on first use. `None` once the
    /// segment was persisted and its record evicted.
    fn replica_mut(&mut self, advance: &AdvanceSegment, now: Instant) -> Option<&mut PendingReplica> {
        if self.forgotten.contains(advance) {
            return None;
        }
        if !self.pending.contains_key(advance) && self.pending.len() >= self.config.replica_history.max(1) {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|(_, replica)| replica.touched)
                .map(|(advance, _)| advance.clone());
            if let Some(oldest) = oldest {
                warn!(advance = %oldest, "too many unpersisted segments, abandoning oldest");
                self.pending.remove(&oldest);
            }
        }
        let replica = self
            .pending
            .entry(advance.clone())
            .or_insert_with(|| PendingReplica::new(now));
        replica.touched = now;
        Some(replica)
    }

    fn on_elect(&mut self, source: NodeId, elect: ElectSegment, now: Instant) -> Result<Vec<Outbound>> {
        let advance = elect.advance.clone();
        let mut outbound = Vec::new();

        if advance.owner == self.id {
            if let Some(final_ids) = self.buffer.on_elect_segment(&advance, &elect.elected) {
                debug!(advance = %advance, elected = %elect.elected, events = final_ids.len(), "segment elected");
            }
            if let Some(committed) = self.buffer.confirm_ready(now) {
                outbound.extend(self.on_confirmed(committed, now));
            }
        }

        if let Some(persisted) = self.persisted.get_mut(&advance) {
            let repeated = !persisted.elect_sources.insert(source);
            let position = persisted.position.clone();
            if repeated {
                // the same sync node answering again means our vote was lost
                debug!(advance = %advance, "repeating commit vote");
                outbound.push(self.commit_vote(&advance, position));
            }
            return Ok(outbound);
        }

        let Some(replica) = self.replica_mut(&advance, now) else {
            debug!(advance = %advance, from = %source, "ignoring election of segment persisted earlier");
            return Ok(outbound);
        };
        replica.elect_sources.insert(source);
        match &replica.elect {
            Some(previous) if previous.elected != elect.elected => {
                warn!(
                    advance = %advance,
                    accepted = %previous.elected,
                    conflicting = %elect.elected,
                    "conflicting election for replicated segment"
                );
            }
            Some(_) => {}
            None => replica.elect = Some(elect),
        }
        outbound.extend(self.try_persist(&advance)?);
        Ok(outbound)
    }

    /// Persist a replicated segment once it is elected and complete
    fn try_persist(&mut self, advance: &AdvanceSegment) -> Result<Vec<Outbound>> {
        let Some(replica) = self.pending.get(advance) else {
            return Ok(Vec::new());
        };
        let Some((elect, events)) = replica.complete() else {
            return Ok(Vec::new());
        };

        let events: Vec<FinalEvent> = events
            .into_iter()
            .zip(1u64..)
            .map(|(event, offset)| FinalEvent {
                id: final_id(&elect.elected, offset),
                event: event.clone(),
            })
            .collect();
        self.history.save_segment(&events)?;

        let Some(replica) = self.pending.remove(advance) else {
            return Ok(Vec::new());
        };
        let position = events.last().map(|e| e.id.clone()).unwrap_or_default();
        self.buffer.observe_floor(&position);
        SegmentMetrics::add_persisted(events.len());
        debug!(advance = %advance, position = %position, events = events.len(), "persisted segment");

        let pkg = events
            .iter()
            .zip(1u64..)
            .map(|(event, offset)| ResolvedId {
                advance_id: AdvanceId {
                    segment: advance.clone(),
                    offset,
                },
                final_id: event.id.clone(),
            })
            .collect();

        self.persisted.insert(
            advance.clone(),
            PersistedSegment {
                events,
                position: position.clone(),
                elect_sources: replica.elect_sources,
                dispatched: false,
            },
        );
        self.persisted_order.push_back(advance.clone());
        while self.persisted_order.len() > self.config.replica_history {
            if let Some(old) = self.persisted_order.pop_front() {
                self.persisted.remove(&old);
                self.forgotten.insert(old.clone());
                self.forgotten_order.push_back(old);
            }
        }
        while self.forgotten_order.len() > FORGOTTEN_SEGMENTS {
            if let Some(old) = self.forgotten_order.pop_front() {
                self.forgotten.remove(&old);
            }
        }

        if replica.committed {
            self.dispatch_segment(advance);
        }

        Ok(vec![
            Outbound::new(
                Topic::Entry,
                ClusterMessage::AdvanceSegmentResolved {
                    advance: advance.clone(),
                    pkg,
                    is_final: true,
                },
            ),
            self.commit_vote(advance, position),
        ])
    }

    fn commit_vote(&self, advance: &AdvanceSegment, position: String) -> Outbound {
        Outbound::new(
            Topic::Sync,
            ClusterMessage::CommitVote {
                advance: advance.clone(),
                voter: self.id.clone(),
                position,
            },
        )
    }

    fn on_commit(&mut self, commit: CommitSegment, now: Instant) -> Vec<Outbound> {
        let CommitSegment { advance, ready_id } = commit;
        let mut outbound = Vec::new();

        if advance.owner == self.id {
            if let Some(committed) = self.buffer.on_commit_watermark(&advance, &ready_id, now) {
                outbound.extend(self.on_confirmed(committed, now));
            }
        }

        if self.persisted.contains_key(&advance) {
            self.dispatch_segment(&advance);
        } else if let Some(replica) = self.pending.get_mut(&advance) {
            replica.committed = true;
        }
        outbound
    }

    /// Own segment confirmed: record it and start the next one
    fn on_confirmed(&mut self, committed: CommittedSegment, now: Instant) -> Vec<Outbound> {
        if let Some(started) = self.commit_started.remove(&committed.advance) {
            SegmentMetrics::record_commit_latency(now.saturating_duration_since(started));
        }
        info!(
            advance = %committed.advance,
            events = committed.events.len(),
            "segment committed"
        );
        SegmentMetrics::set_pending_segments(self.buffer.pending_segments());

        let next = committed
            .next
            .clone()
            .map(|request| Outbound::new(Topic::Sync, ClusterMessage::GenerateSegment(request)));
        self.committed.push(committed);
        next.into_iter().collect()
    }

    /// Hand a committed segment to local subscribers, once, if this node
    /// is the event source
    fn dispatch_segment(&mut self, advance: &AdvanceSegment) {
        if !self.is_event_source() {
            return;
        }
        let Some(persisted) = self.persisted.get_mut(advance) else {
            return;
        };
        if persisted.dispatched {
            return;
        }
        persisted.dispatched = true;
        for event in &persisted.events {
            self.dispatch.publish(&event.event.uri, event.clone());
        }
        trace!(advance = %advance, events = persisted.events.len(), "dispatched segment");
    }

    fn on_lock_change(&mut self, change: &RetainedChange) -> Vec<Outbound> {
        let Some(lock) = self.lock.as_mut() else {
            return Vec::new();
        };
        let update = lock.on_change(change);
        match update.event {
            Some(LockEvent::Acquired) => ClusterMetrics::set_event_source(true),
            Some(LockEvent::Lost) => ClusterMetrics::set_event_source(false),
            Some(LockEvent::HolderChanged(holder)) => {
                debug!(node = %self.id, holder = ?holder, "event source changed")
            }
            None => {}
        }

        let mut outbound = Vec::new();
        if let Some(claim) = update.reclaim {
            outbound.push(Outbound::new(Topic::Lock, ClusterMessage::EventSourceClaim(claim)));
        }
        if let Some(release) = lock.unwanted_grant(change) {
            outbound.push(Outbound::new(
                Topic::Lock,
                ClusterMessage::EventSourceRelease(release),
            ));
        }
        outbound
    }

    /// Watchdog: re-broadcast a stalled segment, abandon replicas of
    /// owners that went quiet and retry the lock
    pub fn tick(&mut self, now: Instant) -> Vec<Outbound> {
        self.abandon_idle_replicas(now);

        let mut outbound = Vec::new();
        if let Some(request) = self.buffer.stalled(now, self.config.stall_timeout) {
            warn!(advance = %request.advance, "segment stalled, re-broadcasting generate request");
            SegmentMetrics::record_stall_rebroadcast();
            outbound.push(Outbound::new(Topic::Sync, ClusterMessage::GenerateSegment(request)));
        }
        if let Some(lock) = self.lock.as_mut() {
            if !lock.is_holder() && lock.holder().is_none() {
                outbound.push(Outbound::new(
                    Topic::Lock,
                    ClusterMessage::EventSourceClaim(lock.acquire()),
                ));
            }
        }
        outbound
    }

    /// Own segments are exempt: the owner holds them until they commit
    fn abandon_idle_replicas(&mut self, now: Instant) {
        let timeout = self.config.replica_timeout;
        let id = &self.id;
        self.pending.retain(|advance, replica| {
            let idle = now.saturating_duration_since(replica.touched);
            if advance.owner == *id || idle < timeout {
                return true;
            }
            warn!(
                advance = %advance,
                events = replica.events.len(),
                elected = replica.elect.is_some(),
                idle = ?idle,
                "abandoning idle replica"
            );
            false
        });
    }

    pub fn heartbeat(&self) -> Outbound {
        Outbound::new(
            Topic::Sync,
            ClusterMessage::Heartbeat {
                node: self.id.clone(),
                role: NodeRole::Entry,
                high: None,
            },
        )
    }

    /// Give up the event-source lock
    pub fn shutdown(&mut self) -> Vec<Outbound> {
        self.lock
            .as_mut()
            .and_then(EventSourceLock::release)
            .map(|release| Outbound::new(Topic::Lock, ClusterMessage::EventSourceRelease(release)))
            .into_iter()
            .collect()
    }

    /// Own segments confirmed since the last call, in commit order
    pub fn drain_committed(&mut self) -> Vec<CommittedSegment> {
        std::mem::take(&mut self.committed)
    }

    pub fn is_event_source(&self) -> bool {
        self.lock.as_ref().map_or(false, EventSourceLock::is_holder)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn buffer(&self) -> &SegmentBuffer {
        &self.buffer
    }

    pub fn status(&self) -> EntryStatus {
        EntryStatus {
            node: self.id.clone(),
            open_segment: self.buffer.open_segment().cloned(),
            in_flight: self.buffer.in_flight().cloned(),
            pending_segments: self.buffer.pending_segments(),
            floor: self.buffer.floor().map(str::to_string),
            event_source: self.is_event_source(),
            lock_holder: self.lock.as_ref().and_then(|l| l.holder().cloned()),
            pending_replicas: self.pending.len(),
            persisted_segments: self.persisted.len(),
        }
    }
}

/// Observable state of an entry node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStatus {
    pub node: NodeId,
    pub open_segment: Option<AdvanceSegment>,
    pub in_flight: Option<AdvanceSegment>,
    pub pending_segments: usize,
    /// Highest final id persisted or confirmed here
    pub floor: Option<String>,
    pub event_source: bool,
    pub lock_holder: Option<NodeId>,
    pub pending_replicas: usize,
    pub persisted_segments: usize,
}

/// Final ids of a committed segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub advance: AdvanceSegment,
    pub final_ids: Vec<String>,
}

impl From<&CommittedSegment> for CommitReceipt {
    fn from(committed: &CommittedSegment) -> Self {
        Self {
            advance: committed.advance.clone(),
            final_ids: committed.final_ids(),
        }
    }
}

enum Command {
    Append {
        event: RouterEvent,
        reply: oneshot::Sender<Appended>,
    },
    Commit {
        advance: AdvanceSegment,
        reply: oneshot::Sender<Result<CommitReceipt>>,
    },
    Status {
        reply: oneshot::Sender<EntryStatus>,
    },
}

/// Client handle to a running entry service
#[derive(Clone)]
pub struct EntryHandle {
    tx: mpsc::Sender<Command>,
}

impl EntryHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| ClusterError::SessionClosed)?;
        rx.await.map_err(|_| ClusterError::ShuttingDown)
    }

    /// Buffer one event
    pub async fn append(&self, event: RouterEvent) -> Result<Appended> {
        self.request(|reply| Command::Append { event, reply }).await
    }

    /// Wait until `advance` is committed cluster-wide
    pub async fn commit(&self, advance: AdvanceSegment) -> Result<CommitReceipt> {
        self.request(|reply| Command::Commit { advance, reply })
            .await?
    }

    /// Buffer one event and wait for the segment holding it to commit
    pub async fn append_and_commit(&self, event: RouterEvent) -> Result<(String, CommitReceipt)> {
        let appended = self.append(event).await?;
        let receipt = self.commit(appended.advance).await?;
        let index = (appended.offset as usize).saturating_sub(1);
        let id = receipt
            .final_ids
            .get(index)
            .cloned()
            .ok_or_else(|| ClusterError::Internal(format!("no final id for offset {}", appended.offset)))?;
        Ok((id, receipt))
    }

    pub async fn status(&self) -> Result<EntryStatus> {
        self.request(|reply| Command::Status { reply }).await
    }
}

/// Actor driving an [`EntryNode`]
pub struct EntryService {
    node: EntryNode,
    bus: Arc<dyn Bus>,
    inbox: Subscription,
    commands: mpsc::Receiver<Command>,
    waiters: HashMap<AdvanceSegment, Vec<oneshot::Sender<Result<CommitReceipt>>>>,
    recent: VecDeque<CommitReceipt>,
    heartbeat_interval: Duration,
    watchdog_interval: Duration,
}

impl EntryService {
    /// Subscribe and run until `shutdown` fires or every handle is dropped
    pub fn spawn(
        node: EntryNode,
        bus: Arc<dyn Bus>,
        heartbeat_interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> (EntryHandle, JoinHandle<()>) {
        let (tx, commands) = mpsc::channel(1024);
        let inbox = bus.subscribe(node.id(), &Topic::subscriptions(NodeRole::Entry, false));
        let watchdog_interval = node.config.watchdog_interval;
        let service = Self {
            node,
            bus,
            inbox,
            commands,
            waiters: HashMap::new(),
            recent: VecDeque::new(),
            heartbeat_interval,
            watchdog_interval,
        };
        let task = tokio::spawn(service.run(shutdown));
        (EntryHandle { tx }, task)
    }

    fn publish(&self, outbound: Vec<Outbound>) {
        publish_all(self.bus.as_ref(), self.node.id(), outbound);
    }

    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let startup = self.node.startup();
        self.publish(startup);

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut watchdog = tokio::time::interval(self.watchdog_interval);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!(node = %self.node.id(), "all handles dropped");
                        break;
                    };
                    self.on_command(command);
                }
                message = self.inbox.recv() => {
                    let Some(envelope) = message else {
                        warn!(node = %self.node.id(), "bus closed");
                        break;
                    };
                    let kind = envelope.message.kind();
                    match self.node.handle(envelope, Instant::now()) {
                        Ok(outbound) => self.publish(outbound),
                        Err(e) if e.is_fatal() => error!(node = %self.node.id(), kind, error = %e, "replica failure"),
                        Err(e) => warn!(node = %self.node.id(), kind, error = %e, "failed to handle message"),
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = self.node.heartbeat();
                    self.publish(vec![beat]);
                }
                _ = watchdog.tick() => {
                    let outbound = self.node.tick(Instant::now());
                    self.publish(outbound);
                }
                _ = shutdown.recv() => {
                    info!(node = %self.node.id(), "entry node shutting down");
                    break;
                }
            }
            self.settle();
        }

        let release = self.node.shutdown();
        self.publish(release);
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(ClusterError::ShuttingDown));
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Append { event, reply } => {
                let (appended, outbound) = self.node.append(event);
                self.publish(outbound);
                let _ = reply.send(appended);
            }
            Command::Commit { advance, reply } => {
                if let Some(receipt) = self.recent.iter().find(|r| r.advance == advance) {
                    let _ = reply.send(Ok(receipt.clone()));
                    return;
                }
                match self.node.commit(&advance, Instant::now()) {
                    Ok(outbound) => {
                        self.publish(outbound);
                        self.waiters.entry(advance).or_default().push(reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Status { reply } => {
                let _ = reply.send(self.node.status());
            }
        }
    }

    /// Answer waiters of newly committed segments
    fn settle(&mut self) {
        for committed in self.node.drain_committed() {
            let receipt = CommitReceipt::from(&committed);
            for waiter in self.waiters.remove(&committed.advance).unwrap_or_default() {
                let _ = waiter.send(Ok(receipt.clone()));
            }
            self.recent.push_back(receipt);
            if self.recent.len() > RECENT_RECEIPTS {
                self.recent.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::dispatch::LocalDispatch;
    use crate::lock::EVENT_SOURCE_KEY;
    use crate::storage::MemoryHistory;
    use std::net::SocketAddr;

    fn config(node: &str) -> ClusterConfig {
        let peer = |id: &str, role, port: u16| {
            PeerConfig::new(id, role).with_addr(SocketAddr::from(([127, 0, 0, 1], port)))
        };
        ClusterConfig::cluster()
            .node_id("s1")
            .role(NodeRole::Sync)
            .cluster_addr(SocketAddr::from(([127, 0, 0, 1], 7001)))
            .peers([
                peer("e1", NodeRole::Entry, 7011),
                peer("e2", NodeRole::Entry, 7012),
            ])
            .build()
            .for_member(node)
            .unwrap()
    }

    struct Fixture {
        node: EntryNode,
        history: Arc<MemoryHistory>,
        dispatch: Arc<LocalDispatch>,
    }

    fn fixture(id: &str) -> Fixture {
        let history = Arc::new(MemoryHistory::new());
        let dispatch = Arc::new(LocalDispatch::new());
        let node = EntryNode::new(&config(id), history.clone(), dispatch.clone()).unwrap();
        Fixture {
            node,
            history,
            dispatch,
        }
    }

    fn event(uri: &str) -> RouterEvent {
        RouterEvent::new("realm1", uri, uri.as_bytes().to_vec())
    }

    fn deliver(node: &mut EntryNode, from: &str, outbound: &[Outbound], now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        for o in outbound.iter().filter(|o| o.topic == Topic::Entry) {
            out.extend(
                node.handle(o.clone().into_envelope(&from.to_string()), now)
                    .unwrap(),
            );
        }
        out
    }

    fn elect(advance: &AdvanceSegment, elected: &str, length: u64) -> Envelope {
        Envelope::new(
            "s1",
            Topic::Entry,
            ClusterMessage::ElectSegment(ElectSegment {
                advance: advance.clone(),
                elected: elected.into(),
                length,
            }),
        )
    }

    fn votes(outbound: &[Outbound]) -> Vec<String> {
        outbound
            .iter()
            .filter_map(|o| match &o.message {
                ClusterMessage::CommitVote { position, .. } => Some(position.clone()),
                _ => None,
            })
            .collect()
    }

    fn keep(advance: &AdvanceSegment, offset: u64) -> Envelope {
        let published = event("a");
        Envelope::new(
            advance.owner.as_str(),
            Topic::Entry,
            ClusterMessage::KeepAdvanceHistory {
                advance_id: AdvanceId {
                    segment: advance.clone(),
                    offset,
                },
                realm: published.realm,
                uri: published.uri,
                data: published.data,
                opt: published.opt,
                sid: published.sid,
            },
        )
    }

    fn grant(node: &mut EntryNode) {
        let session = node.lock.as_ref().unwrap().session().to_string();
        let change = RetainedChange {
            key: EVENT_SOURCE_KEY.into(),
            holder: Some(node.id().clone()),
            session: Some(session),
        };
        let envelope = Envelope::new("s1", Topic::Entry, ClusterMessage::EventSourceState(change));
        node.handle(envelope, Instant::now()).unwrap();
    }

    #[test]
    fn test_rejects_sync_config() {
        let history = Arc::new(MemoryHistory::new());
        let dispatch = Arc::new(LocalDispatch::new());
        assert!(matches!(
            EntryNode::new(&config("s1"), history, dispatch),
            Err(ClusterError::WrongRole { .. })
        ));
    }

    #[test]
    fn test_append_replicates_and_opens_segment() {
        let mut f = fixture("e1");
        let (first, outbound) = f.node.append(event("a"));
        assert!(first.opened);
        assert_eq!(first.offset, 1);
        assert_eq!(outbound.len(), 2);
        assert_eq!(outbound[0].topic, Topic::Sync);
        assert!(matches!(
            &outbound[1].message,
            ClusterMessage::KeepAdvanceHistory { advance_id, .. } if advance_id.offset == 1
        ));

        let (second, outbound) = f.node.append(event("b"));
        assert!(!second.opened);
        assert_eq!(second.advance, first.advance);
        assert_eq!(outbound.len(), 1);
    }

    #[test]
    fn test_owner_commit_flow() {
        let now = Instant::now();
        let mut f = fixture("e1");
        let (appended, a) = f.node.append(event("a"));
        let (_, b) = f.node.append(event("b"));
        let advance = appended.advance;

        let out = f.node.commit(&advance, now).unwrap();
        assert!(matches!(
            &out[..],
            [Outbound { message: ClusterMessage::GenerateSegment(request), .. }] if request.length == 2
        ));

        // the owner replicates its own events
        assert!(deliver(&mut f.node, "e1", &a, now).is_empty());
        assert!(deliver(&mut f.node, "e1", &b, now).is_empty());
        let out = f.node.handle(elect(&advance, "P5", 2), now).unwrap();
        assert_eq!(votes(&out), vec![final_id("P5", 2)]);
        assert!(matches!(
            &out[0].message,
            ClusterMessage::AdvanceSegmentResolved { pkg, is_final: true, .. } if pkg.len() == 2
        ));
        assert_eq!(f.history.len().unwrap(), 2);
        assert!(f.node.drain_committed().is_empty());

        let commit = ClusterMessage::CommitSegment(CommitSegment {
            advance: advance.clone(),
            ready_id: final_id("P5", 2),
        });
        f.node
            .handle(Envelope::new("s1", Topic::Entry, commit), now)
            .unwrap();
        let committed = f.node.drain_committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(
            committed[0].final_ids(),
            vec![final_id("P5", 1), final_id("P5", 2)]
        );
        assert_eq!(f.node.status().floor, Some(final_id("P5", 2)));
        assert_eq!(f.node.status().pending_segments, 0);
    }

    #[test]
    fn test_replica_waits_for_all_events() {
        let now = Instant::now();
        let mut owner = fixture("e1");
        let mut replica = fixture("e2");
        let (appended, a) = owner.node.append(event("a"));
        let (_, b) = owner.node.append(event("b"));

        deliver(&mut replica.node, "e1", &a, now);
        let out = replica.node.handle(elect(&appended.advance, "P5", 2), now).unwrap();
        assert!(out.is_empty());
        assert_eq!(replica.node.status().pending_replicas, 1);

        let out = deliver(&mut replica.node, "e1", &b, now);
        assert_eq!(votes(&out), vec![final_id("P5", 2)]);
        let record = replica.history.get(&final_id("P5", 1)).unwrap().unwrap();
        assert_eq!(record.uri, "a");

        // a repeated election from the same sync node repeats the vote
        let out = replica.node.handle(elect(&appended.advance, "P5", 2), now).unwrap();
        assert_eq!(votes(&out), vec![final_id("P5", 2)]);
    }

    #[tokio::test]
    async fn test_event_source_dispatches_committed_segments() {
        let now = Instant::now();
        let mut owner = fixture("e1");
        let mut holder = fixture("e2");
        let mut sub = holder.dispatch.subscribe("a");

        let claims = holder.node.startup();
        assert!(matches!(&claims[..], [Outbound { topic: Topic::Lock, .. }]));
        grant(&mut holder.node);
        assert!(holder.node.is_event_source());

        let (appended, a) = owner.node.append(event("a"));
        // commit announced before the replica has the events
        let commit = ClusterMessage::CommitSegment(CommitSegment {
            advance: appended.advance.clone(),
            ready_id: final_id("P7", 1),
        });
        holder
            .node
            .handle(elect(&appended.advance, "P7", 1), now)
            .unwrap();
        holder
            .node
            .handle(Envelope::new("s1", Topic::Entry, commit.clone()), now)
            .unwrap();
        assert!(sub.try_recv().is_err());

        deliver(&mut holder.node, "e1", &a, now);
        assert_eq!(sub.recv().await.unwrap().id, final_id("P7", 1));

        holder
            .node
            .handle(Envelope::new("s1", Topic::Entry, commit), now)
            .unwrap();
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn test_watchdog_rebroadcasts_and_reclaims() {
        let start = Instant::now();
        let mut f = fixture("e1");
        f.node.startup();
        let (appended, _) = f.node.append(event("a"));
        f.node.commit(&appended.advance, start).unwrap();

        let out = f.node.tick(start + Duration::from_secs(1));
        // nobody holds the lock yet, so the claim is repeated
        assert!(out.iter().all(|o| o.topic == Topic::Lock));

        let out = f.node.tick(start + Duration::from_secs(6));
        assert!(out.iter().any(|o| matches!(
            &o.message,
            ClusterMessage::GenerateSegment(request) if request.advance == appended.advance
        )));

        grant(&mut f.node);
        let out = f.node.tick(start + Duration::from_secs(7));
        assert!(out.is_empty());
        assert!(matches!(
            &f.node.shutdown()[..],
            [Outbound { message: ClusterMessage::EventSourceRelease(_), .. }]
        ));
    }

    #[test]
    fn test_backpressure() {
        let now = Instant::now();
        let mut config = config("e1");
        config.entry.max_pending_segments = 1;
        let mut node = EntryNode::new(
            &config,
            Arc::new(MemoryHistory::new()),
            Arc::new(LocalDispatch::new()),
        )
        .unwrap();

        let (first, _) = node.append(event("a"));
        node.commit(&first.advance, now).unwrap();
        let (second, _) = node.append(event("b"));
        assert!(matches!(
            node.commit(&second.advance, now),
            Err(ClusterError::Backpressure { pending: 1, max: 1 })
        ));
    }

    #[test]
    fn test_floor_restored_from_history() {
        let history = Arc::new(MemoryHistory::new());
        history
            .save_event_history("P9zz", "realm1", "a", b"", &Default::default())
            .unwrap();
        let node = EntryNode::new(&config("e1"), history, Arc::new(LocalDispatch::new())).unwrap();
        assert_eq!(node.status().floor.as_deref(), Some("P9zz"));
    }

    #[test]
    fn test_replica_bookkeeping_stays_bounded() {
        let start = Instant::now();
        let mut config = config("e2");
        config.entry.replica_history = 1;
        let mut node = EntryNode::new(
            &config,
            Arc::new(MemoryHistory::new()),
            Arc::new(LocalDispatch::new()),
        )
        .unwrap();

        for generation in 1..=3 {
            let advance = AdvanceSegment::new("e1", generation);
            node.handle(keep(&advance, 1), start).unwrap();
            let out = node
                .handle(elect(&advance, &format!("P{generation}"), 1), start)
                .unwrap();
            assert_eq!(votes(&out).len(), 1);
        }
        assert_eq!(node.status().persisted_segments, 1);

        // a slow sync node elects the first segment again after its record left
        let late = Envelope::new(
            "s3",
            Topic::Entry,
            ClusterMessage::ElectSegment(ElectSegment {
                advance: AdvanceSegment::new("e1", 1),
                elected: "P1".into(),
                length: 1,
            }),
        );
        assert!(node.handle(late, start).unwrap().is_empty());
        assert!(node.handle(keep(&AdvanceSegment::new("e1", 1), 1), start).unwrap().is_empty());
        assert_eq!(node.status().pending_replicas, 0);

        // an owner that replicates segments and never commits them
        for generation in 10..20 {
            node.handle(keep(&AdvanceSegment::new("e3", generation), 1), start)
                .unwrap();
        }
        assert_eq!(node.status().pending_replicas, 1);

        node.tick(start + config.entry.replica_timeout + Duration::from_secs(1));
        assert_eq!(node.status().pending_replicas, 0);
    }

    #[test]
    fn test_own_segments_are_not_abandoned() {
        let start = Instant::now();
        let mut f = fixture("e2");
        f.node.handle(keep(&AdvanceSegment::new("e2", 1), 1), start).unwrap();
        f.node.handle(keep(&AdvanceSegment::new("e1", 1), 1), start).unwrap();
        assert_eq!(f.node.status().pending_replicas, 2);

        let timeout = EntryConfig::default().replica_timeout;
        f.node.tick(start + timeout / 2);
        assert_eq!(f.node.status().pending_replicas, 2);

        f.node.tick(start + timeout + Duration::from_secs(1));
        assert_eq!(f.node.status().pending_replicas, 1);
    }

    #[tokio::test]
    async fn test_stopped_service_closes_handles() {
        let (tx, commands) = mpsc::channel(1);
        drop(commands);
        let handle = EntryHandle { tx };
        assert!(matches!(
            handle.append(event("a")).await,
            Err(ClusterError::SessionClosed)
        ));
    }
}
