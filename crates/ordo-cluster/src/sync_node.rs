//! Sync node: segment ordering, commit watermarks and the lock host
//!
//! [`SyncNode`] is a synchronous state machine: every inbound envelope is
//! handled to completion and yields the messages to publish. [`SyncService`]
//! owns one node and drives it from the bus, a heartbeat timer and a
//! shutdown signal.

use crate::bus::{publish_all, Bus, Subscription};
use crate::config::ClusterConfig;
use crate::election::{DraftElection, GenerateOutcome};
use crate::error::{ClusterError, Result};
use crate::id::{ComplexId, MonotonicIdGenerator, PrefixSource};
use crate::lock::{Claim, Release, EVENT_SOURCE_KEY};
use crate::membership::{MemberTracker, MembershipEvent};
use crate::node::{NodeId, NodeInfo, NodeRole};
use crate::observability::ClusterMetrics;
use crate::protocol::{ClusterMessage, Envelope, Outbound, Topic};
use crate::retained::RetainedTable;
use crate::segment::GenerateRequest;
use crate::watermark::CommitWatermark;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Sync node state machine
pub struct SyncNode {
    id: NodeId,
    election: DraftElection,
    watermark: CommitWatermark,
    tracker: MemberTracker,
    retained: Option<RetainedTable>,
    prefix: Arc<dyn PrefixSource>,
    prefix_refresh: Duration,
    last_refresh: Instant,
}

impl SyncNode {
    pub fn new(config: &ClusterConfig, prefix: Arc<dyn PrefixSource>, now: Instant) -> Result<Self> {
        if config.role != NodeRole::Sync {
            return Err(ClusterError::WrongRole {
                node: config.node_id.clone(),
                expected: NodeRole::Sync.as_str(),
            });
        }
        config.validate()?;

        let (lane, lanes) = config.lane();
        let mut election = DraftElection::new(
            config.node_id.clone(),
            MonotonicIdGenerator::from_source(prefix.as_ref()),
            config.election_quorum(),
            config.election.policy,
        )
        .with_lane(lane, lanes)
        .with_prefix_width(config.election.prefix_width)
        .with_history(config.election.elected_history);
        for member in config.sync_members() {
            election.add_member(member);
        }

        let mut watermark =
            CommitWatermark::new(config.commit_quorum()).with_history(config.commit.committed_history);
        for member in config.entry_members() {
            watermark.add_member(member);
        }

        let mut tracker = MemberTracker::new(
            config.node_id.clone(),
            config.heartbeat.suspect_after,
            config.heartbeat.dead_after,
        );
        for peer in &config.peers {
            tracker.add_known(NodeInfo::new(peer.id.clone(), peer.role), now);
        }

        let lock_host = config.lock_host().as_ref() == Some(&config.node_id);
        info!(
            node = %config.node_id,
            lane,
            lanes,
            policy = ?config.election.policy,
            lock_host,
            "sync node ready"
        );

        Ok(Self {
            id: config.node_id.clone(),
            election,
            watermark,
            tracker,
            retained: lock_host.then(RetainedTable::new),
            prefix,
            prefix_refresh: config.election.prefix_refresh,
            last_refresh: now,
        })
    }

    /// Messages to publish once subscribed
    pub fn startup(&self) -> Vec<Outbound> {
        match &self.retained {
            // a restarted lock host has lost its table; make entries claim again
            Some(table) => vec![Outbound::new(
                Topic::Entry,
                ClusterMessage::EventSourceState(table.state(EVENT_SOURCE_KEY)),
            )],
            None => Vec::new(),
        }
    }

    pub fn handle(&mut self, envelope: Envelope, now: Instant) -> Result<Vec<Outbound>> {
        let source = envelope.header.source;
        match envelope.message {
            ClusterMessage::GenerateSegment(request) => self.on_generate(request),
            ClusterMessage::DraftSegment(proposal) => Ok(self
                .election
                .on_draft_proposal(proposal)?
                .into_iter()
                .map(|elect| Outbound::new(Topic::Entry, ClusterMessage::ElectSegment(elect)))
                .collect()),
            ClusterMessage::CommitVote {
                advance,
                voter,
                position,
            } => Ok(self
                .watermark
                .on_commit_vote(voter, advance, position)
                .map(|commit| Outbound::new(Topic::Entry, ClusterMessage::CommitSegment(commit)))
                .into_iter()
                .collect()),
            ClusterMessage::Heartbeat { node, role, high } => self.on_heartbeat(node, role, high, now),
            ClusterMessage::EventSourceClaim(claim) => Ok(self.on_claim(claim)),
            ClusterMessage::EventSourceRelease(release) => Ok(self.on_release(release)),
            ClusterMessage::BeginAdvanceSegment { advance } => {
                debug!(advance = %advance, "entry opened segment");
                Ok(Vec::new())
            }
            other => {
                trace!(from = %source, kind = other.kind(), "ignoring message");
                Ok(Vec::new())
            }
        }
    }

    fn on_generate(&mut self, request: GenerateRequest) -> Result<Vec<Outbound>> {
        let outcome = self.election.on_generate_segment(
            &request.advance,
            request.length,
            request.floor.as_deref(),
        )?;
        let message = match outcome {
            GenerateOutcome::Draft(proposal) => ClusterMessage::DraftSegment(proposal),
            GenerateOutcome::AlreadyElected(elect) => {
                debug!(advance = %elect.advance, "resending election");
                return Ok(vec![Outbound::new(
                    Topic::Entry,
                    ClusterMessage::ElectSegment(elect),
                )]);
            }
            GenerateOutcome::Duplicate => match self.election.proposal(&request.advance) {
                // a repeated request means something was lost; repeat the draft
                Some(proposal) => ClusterMessage::DraftSegment(proposal.clone()),
                None => return Ok(Vec::new()),
            },
            // committed long ago; the owner has moved on
            GenerateOutcome::Stale => return Ok(Vec::new()),
        };
        Ok(vec![Outbound::new(Topic::Sync, message)])
    }

    fn on_heartbeat(
        &mut self,
        node: NodeId,
        role: NodeRole,
        high: Option<String>,
        now: Instant,
    ) -> Result<Vec<Outbound>> {
        if let Some(high) = high {
            match ComplexId::decode(&high, self.election.prefix_width()) {
                Ok(id) => {
                    self.election.observe_peer_high(&id);
                }
                Err(e) => warn!(from = %node, high = %high, error = %e, "ignoring bad heartbeat position"),
            }
        }
        match self.tracker.observe(&node, role, now) {
            Some(event) => self.apply_membership(event),
            None => Ok(Vec::new()),
        }
    }

    fn on_claim(&mut self, claim: Claim) -> Vec<Outbound> {
        let Some(table) = self.retained.as_mut() else {
            trace!(holder = %claim.holder, "not the lock host, ignoring claim");
            return Vec::new();
        };
        let claimed = table.claim(&claim.key, &claim.holder, &claim.session, &claim.opt);
        if claimed.changed {
            info!(key = %claim.key, holder = %claim.holder, "event-source lock granted");
        }
        if claimed.changed || claim.opt.acknowledge {
            vec![Outbound::new(
                Topic::Entry,
                ClusterMessage::EventSourceState(claimed.state),
            )]
        } else {
            Vec::new()
        }
    }

    fn on_release(&mut self, release: Release) -> Vec<Outbound> {
        let Some(table) = self.retained.as_mut() else {
            return Vec::new();
        };
        table
            .release(&release.key, &release.holder)
            .map(|change| {
                info!(key = %release.key, holder = %release.holder, "event-source lock released");
                Outbound::new(Topic::Entry, ClusterMessage::EventSourceState(change))
            })
            .into_iter()
            .collect()
    }

    fn apply_membership(&mut self, event: MembershipEvent) -> Result<Vec<Outbound>> {
        let mut outbound = Vec::new();
        match event {
            MembershipEvent::NodeJoined(info) => {
                let added = match info.role {
                    NodeRole::Sync => self.election.add_member(info.id.clone()),
                    NodeRole::Entry => self.watermark.add_member(info.id.clone()),
                };
                if added {
                    info!(node = %info.id, role = %info.role, "member added to quorums");
                }
            }
            MembershipEvent::NodeFailed(info) => {
                match info.role {
                    NodeRole::Sync => {
                        let elected = self.election.remove_member(&info.id)?;
                        outbound.extend(elected.into_iter().map(|elect| {
                            Outbound::new(Topic::Entry, ClusterMessage::ElectSegment(elect))
                        }));
                    }
                    NodeRole::Entry => {
                        self.watermark.remove_member(&info.id);
                    }
                }
                info!(node = %info.id, role = %info.role, "failed member removed from quorums");

                if let Some(table) = self.retained.as_mut() {
                    for session in table.sessions_of(&info.id) {
                        for change in table.disconnect(&session) {
                            outbound.push(Outbound::new(
                                Topic::Entry,
                                ClusterMessage::EventSourceState(change),
                            ));
                        }
                    }
                }
            }
            MembershipEvent::NodeSuspected(_) | MembershipEvent::NodeRecovered(_) => {}
        }
        ClusterMetrics::set_member_count(NodeRole::Sync.as_str(), self.election.member_count());
        Ok(outbound)
    }

    /// Advance failure detection and follow the wall clock
    pub fn tick(&mut self, now: Instant) -> Result<Vec<Outbound>> {
        if now.saturating_duration_since(self.last_refresh) >= self.prefix_refresh {
            self.election.refresh_prefix(self.prefix.as_ref());
            self.last_refresh = now;
        }
        let mut outbound = Vec::new();
        for event in self.tracker.check(now) {
            outbound.extend(self.apply_membership(event)?);
        }
        Ok(outbound)
    }

    pub fn heartbeat(&self) -> Outbound {
        Outbound::new(
            Topic::Sync,
            ClusterMessage::Heartbeat {
                node: self.id.clone(),
                role: NodeRole::Sync,
                high: Some(self.election.generator().current().encode()),
            },
        )
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            node: self.id.clone(),
            recent_value: self.election.recent_value().map(str::to_string),
            poisoned: self.election.is_poisoned(),
            pending_drafts: self.election.pending_drafts(),
            sync_members: self.election.member_count(),
            lock_holder: self
                .retained
                .as_ref()
                .and_then(|table| table.holder(EVENT_SOURCE_KEY).cloned()),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn election(&self) -> &DraftElection {
        &self.election
    }

    pub fn watermark(&self) -> &CommitWatermark {
        &self.watermark
    }

    pub fn tracker(&self) -> &MemberTracker {
        &self.tracker
    }

    pub fn is_lock_host(&self) -> bool {
        self.retained.is_some()
    }
}

/// Observable state of a sync node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub node: NodeId,
    pub recent_value: Option<String>,
    pub poisoned: bool,
    pub pending_drafts: usize,
    pub sync_members: usize,
    /// Holder of the event-source lock, on the lock host
    pub lock_holder: Option<NodeId>,
}

/// Handle to a running sync service
pub struct SyncHandle {
    status: watch::Receiver<SyncStatus>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Wait until the status satisfies `pred`
    pub async fn wait_for(&mut self, pred: impl FnMut(&SyncStatus) -> bool) -> Result<SyncStatus> {
        let status = self
            .status
            .wait_for(pred)
            .await
            .map_err(|_| ClusterError::ShuttingDown)?;
        Ok((*status).clone())
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Actor driving a [`SyncNode`]
pub struct SyncService {
    node: SyncNode,
    bus: Arc<dyn Bus>,
    inbox: Subscription,
    heartbeat_interval: Duration,
    status_tx: watch::Sender<SyncStatus>,
}

impl SyncService {
    pub fn new(node: SyncNode, bus: Arc<dyn Bus>, heartbeat_interval: Duration) -> (Self, watch::Receiver<SyncStatus>) {
        let topics = Topic::subscriptions(NodeRole::Sync, node.is_lock_host());
        let inbox = bus.subscribe(node.id(), &topics);
        let (status_tx, status_rx) = watch::channel(node.status());
        (
            Self {
                node,
                bus,
                inbox,
                heartbeat_interval,
                status_tx,
            },
            status_rx,
        )
    }

    /// Subscribe and run until `shutdown` fires
    pub fn spawn(
        node: SyncNode,
        bus: Arc<dyn Bus>,
        heartbeat_interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> SyncHandle {
        let (service, status) = Self::new(node, bus, heartbeat_interval);
        let task = tokio::spawn(service.run(shutdown));
        SyncHandle { status, task }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let id = self.node.id().clone();
        publish_all(self.bus.as_ref(), &id, self.node.startup());

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.inbox.recv() => {
                    let Some(envelope) = message else {
                        warn!(node = %id, "bus closed");
                        break;
                    };
                    let kind = envelope.message.kind();
                    match self.node.handle(envelope, Instant::now()) {
                        Ok(outbound) => publish_all(self.bus.as_ref(), &id, outbound),
                        Err(e) if e.is_fatal() => error!(node = %id, kind, error = %e, "ordering failure"),
                        Err(e) => warn!(node = %id, kind, error = %e, "failed to handle message"),
                    }
                }
                _ = heartbeat.tick() => {
                    publish_all(self.bus.as_ref(), &id, vec![self.node.heartbeat()]);
                    match self.node.tick(Instant::now()) {
                        Ok(outbound) => publish_all(self.bus.as_ref(), &id, outbound),
                        Err(e) => error!(node = %id, error = %e, "membership update failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!(node = %id, "sync node shutting down");
                    break;
                }
            }
            self.status_tx.send_if_modified(|status| {
                let current = self.node.status();
                if *status != current {
                    *status = current;
                    true
                } else {
                    false
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::election::{DraftProposal, ElectSegment};
    use crate::event::PublishOptions;
    use crate::id::FixedPrefix;
    use crate::retained::RetainedChange;
    use crate::segment::AdvanceSegment;
    use crate::watermark::CommitSegment;
    use std::net::SocketAddr;

    fn config(node: &str) -> ClusterConfig {
        let peer = |id: &str, role, port: u16| {
            PeerConfig::new(id, role).with_addr(SocketAddr::from(([127, 0, 0, 1], port)))
        };
        let mut config = ClusterConfig::cluster()
            .node_id("s1")
            .role(NodeRole::Sync)
            .cluster_addr(SocketAddr::from(([127, 0, 0, 1], 7001)))
            .peers([
                peer("s2", NodeRole::Sync, 7002),
                peer("s3", NodeRole::Sync, 7003),
                peer("e1", NodeRole::Entry, 7011),
                peer("e2", NodeRole::Entry, 7012),
            ])
            .build();
        config.election.prefix_width = 1;
        config.for_member(node).unwrap()
    }

    fn node(id: &str) -> SyncNode {
        SyncNode::new(&config(id), Arc::new(FixedPrefix("P".into())), Instant::now()).unwrap()
    }

    fn envelope(from: &str, message: ClusterMessage) -> Envelope {
        Envelope::new(from, Topic::Sync, message)
    }

    fn generate(advance: &AdvanceSegment) -> ClusterMessage {
        ClusterMessage::GenerateSegment(GenerateRequest {
            advance: advance.clone(),
            length: 2,
            floor: None,
        })
    }

    fn draft_of(outbound: &[Outbound]) -> DraftProposal {
        match &outbound[0].message {
            ClusterMessage::DraftSegment(proposal) => proposal.clone(),
            other => panic!("expected draft, got {other:?}"),
        }
    }

    fn elects(outbound: &[Outbound]) -> Vec<ElectSegment> {
        outbound
            .iter()
            .filter_map(|o| match &o.message {
                ClusterMessage::ElectSegment(elect) => Some(elect.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_rejects_entry_config() {
        let err = SyncNode::new(&config("e1"), Arc::new(FixedPrefix("P".into())), Instant::now())
            .err()
            .unwrap();
        assert!(matches!(err, ClusterError::WrongRole { .. }));
    }

    #[test]
    fn test_three_nodes_elect_the_same_id() {
        let now = Instant::now();
        let mut nodes = vec![node("s1"), node("s2"), node("s3")];
        let advance = AdvanceSegment::new("e1", 1);

        let drafts: Vec<DraftProposal> = nodes
            .iter_mut()
            .map(|n| draft_of(&n.handle(envelope("e1", generate(&advance)), now).unwrap()))
            .collect();
        // lanes keep the drafts apart
        let counters: Vec<u64> = drafts.iter().map(|d| d.draft_id.counter).collect();
        assert_eq!(counters, vec![3, 1, 2]);

        for n in nodes.iter_mut() {
            let mut elected = Vec::new();
            for d in &drafts {
                let out = n
                    .handle(envelope(&d.draft_owner, ClusterMessage::DraftSegment(d.clone())), now)
                    .unwrap();
                elected.extend(elects(&out));
            }
            assert_eq!(elected.len(), 1);
            assert_eq!(elected[0].elected, ComplexId::new("P", 1).encode());
            assert_eq!(elected[0].length, 2);
        }
    }

    #[test]
    fn test_repeated_generate_repeats_draft_then_election() {
        let now = Instant::now();
        let mut s1 = node("s1");
        let advance = AdvanceSegment::new("e1", 1);

        let first = draft_of(&s1.handle(envelope("e1", generate(&advance)), now).unwrap());
        let again = draft_of(&s1.handle(envelope("e1", generate(&advance)), now).unwrap());
        assert_eq!(first, again);

        for (owner, counter) in [("s1", first.draft_id.counter), ("s2", 1), ("s3", 2)] {
            let proposal = DraftProposal {
                draft_owner: owner.into(),
                draft_id: ComplexId::new("P", counter),
                ..first.clone()
            };
            s1.handle(envelope(owner, ClusterMessage::DraftSegment(proposal)), now)
                .unwrap();
        }

        let out = s1.handle(envelope("e1", generate(&advance)), now).unwrap();
        assert_eq!(out[0].topic, Topic::Entry);
        assert_eq!(elects(&out)[0].elected, ComplexId::new("P", 1).encode());
    }

    #[test]
    fn test_commit_votes_reach_quorum() {
        let now = Instant::now();
        let mut s2 = node("s2");
        let advance = AdvanceSegment::new("e1", 1);
        let vote = |voter: &str, position: &str| {
            envelope(
                voter,
                ClusterMessage::CommitVote {
                    advance: advance.clone(),
                    voter: voter.into(),
                    position: position.into(),
                },
            )
        };

        assert!(s2.handle(vote("e1", "P1112"), now).unwrap().is_empty());
        let out = s2.handle(vote("e2", "P1112"), now).unwrap();
        assert_eq!(
            out,
            vec![Outbound::new(
                Topic::Entry,
                ClusterMessage::CommitSegment(CommitSegment {
                    advance: advance.clone(),
                    ready_id: "P1112".into(),
                })
            )]
        );
    }

    #[test]
    fn test_lock_host_grants_and_clears_on_failure() {
        let start = Instant::now();
        let mut s1 = node("s1");
        assert!(s1.is_lock_host());
        assert!(!node("s2").is_lock_host());
        assert!(matches!(
            &s1.startup()[..],
            [Outbound { message: ClusterMessage::EventSourceState(RetainedChange { holder: None, .. }), .. }]
        ));

        let claim = |holder: &str| {
            envelope(
                holder,
                ClusterMessage::EventSourceClaim(Claim {
                    key: EVENT_SOURCE_KEY.into(),
                    holder: holder.into(),
                    session: format!("{holder}/a"),
                    opt: PublishOptions::retained_watch(),
                }),
            )
        };
        s1.handle(claim("e1"), start).unwrap();
        let out = s1.handle(claim("e2"), start).unwrap();
        match &out[0].message {
            ClusterMessage::EventSourceState(state) => assert_eq!(state.holder.as_deref(), Some("e1")),
            other => panic!("unexpected {other:?}"),
        }

        // everyone but e1 keeps heartbeating
        let later = start + Duration::from_secs(7);
        for (peer, role) in [("s2", NodeRole::Sync), ("s3", NodeRole::Sync), ("e2", NodeRole::Entry)] {
            let hb = ClusterMessage::Heartbeat {
                node: peer.into(),
                role,
                high: None,
            };
            s1.handle(envelope(peer, hb), later).unwrap();
        }
        let out = s1.tick(later).unwrap();
        assert!(out.iter().any(|o| matches!(
            &o.message,
            ClusterMessage::EventSourceState(RetainedChange { holder: None, .. })
        )));
        assert!(!s1.watermark().is_member(&"e1".into()));
        assert_eq!(s1.status().lock_holder, None);

        s1.handle(claim("e2"), later).unwrap();
        assert_eq!(s1.status().lock_holder.as_deref(), Some("e2"));
    }

    #[test]
    fn test_heartbeat_carries_generator_position() {
        let now = Instant::now();
        let mut s2 = node("s2");
        let hb = ClusterMessage::Heartbeat {
            node: "s3".into(),
            role: NodeRole::Sync,
            high: Some(ComplexId::new("P", 40).encode()),
        };
        s2.handle(envelope("s3", hb), now).unwrap();

        let advance = AdvanceSegment::new("e1", 1);
        let draft = draft_of(&s2.handle(envelope("e1", generate(&advance)), now).unwrap());
        // lane 1 of 3 above 40
        assert_eq!(draft.draft_id.counter, 43);

        match s2.heartbeat().message {
            ClusterMessage::Heartbeat { high, .. } => assert_eq!(high, Some(draft.draft_id.encode())),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_service_publishes_heartbeats() {
        let bus = Arc::new(crate::bus::LocalBus::new());
        let mut watcher = bus.subscribe(&"observer".into(), &[Topic::Sync]);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = SyncService::spawn(node("s2"), bus.clone(), Duration::from_millis(20), shutdown_rx);

        let envelope = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.message.kind(), "heartbeat");
        assert_eq!(handle.status().node, "s2");

        shutdown_tx.send(()).unwrap();
        handle.join().await;
    }
}
