//! Draft election: leaderless agreement on segment ids
//!
//! Every sync node answers a generate request with a draft id from its own
//! generator and broadcasts it to all sync nodes, itself included. Drafts are
//! votes in a quorum keyed by advance segment. A segment is elected with the
//! smallest pending draft once that draft may no longer be undercut by a
//! draft still in transit, so elected ids strictly increase at every node.
//!
//! ```text
//!   generate(A) ──► s1: draft 3 ─┐
//!                   s2: draft 4 ─┼─► every sync node: pending {3, 4, 5}
//!                   s3: draft 5 ─┘       quorum(A) reached, 3 is safe
//!                                        ──► ElectSegment(A, 3)
//! ```
//!
//! Two extraction policies decide when the smallest pending draft is safe:
//!
//! - [`ExtractionPolicy::MemberWatermark`] waits until every member's highest
//!   observed draft is at least the candidate. A member's drafts only grow
//!   and arrive in order, so nothing smaller can still arrive. All nodes
//!   elect the same id for a segment: the smallest draft it ever receives.
//! - [`ExtractionPolicy::Counting`] extracts while more drafts are pending
//!   than keys are open. It needs less waiting but can be caught out by
//!   reordering; the ordering guard then poisons the election.

use crate::error::{ClusterError, Result};
use crate::id::{ComplexId, MonotonicIdGenerator, PrefixSource, MINUTE_PREFIX_WIDTH};
use crate::node::NodeId;
use crate::observability::ElectionMetrics;
use crate::quorum::{min_value, QuorumVote};
use crate::segment::AdvanceSegment;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, error, info, warn};

/// Default number of elected segments remembered for late drafts and resends
pub const DEFAULT_ELECTED_HISTORY: usize = 4096;

/// When the smallest pending draft may be finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionPolicy {
    /// Extract while pending drafts outnumber open keys
    Counting,
    /// Extract once every member has drafted at or above the candidate
    #[default]
    MemberWatermark,
}

impl std::str::FromStr for ExtractionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "counting" => Ok(ExtractionPolicy::Counting),
            "member-watermark" => Ok(ExtractionPolicy::MemberWatermark),
            other => Err(format!("unknown extraction policy: {other}")),
        }
    }
}

/// A sync node's candidate id for a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftProposal {
    pub advance: AdvanceSegment,
    pub draft_owner: NodeId,
    pub draft_id: ComplexId,
    pub length: u64,
}

/// Cluster-agreed segment id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectSegment {
    pub advance: AdvanceSegment,
    pub elected: String,
    pub length: u64,
}

/// Outcome of a generate request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    /// A fresh draft to broadcast to all sync nodes
    Draft(DraftProposal),
    /// This node already drafted for the segment
    Duplicate,
    /// The segment is already elected; resend the result
    AlreadyElected(ElectSegment),
    /// The segment was elected here and has since left the history
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PendingDraft {
    value: String,
    advance: AdvanceSegment,
    owner: NodeId,
}

#[derive(Debug)]
struct Ballot {
    owners: HashSet<NodeId>,
    ready: bool,
    length: u64,
}

#[derive(Debug)]
struct Elected {
    elect: ElectSegment,
    owners: HashSet<NodeId>,
}

/// Per sync node draft election
#[derive(Debug)]
pub struct DraftElection {
    node: NodeId,
    generator: MonotonicIdGenerator,
    lane: u32,
    lanes: u32,
    policy: ExtractionPolicy,
    prefix_width: usize,
    proposals: HashMap<AdvanceSegment, DraftProposal>,
    quorum: QuorumVote<NodeId, AdvanceSegment, String>,
    ballots: HashMap<AdvanceSegment, Ballot>,
    pending: BTreeSet<PendingDraft>,
    member_high: HashMap<NodeId, String>,
    elected: HashMap<AdvanceSegment, Elected>,
    elected_order: VecDeque<AdvanceSegment>,
    /// Highest elected generation per advance owner, kept past the history
    owner_generation: HashMap<NodeId, u64>,
    history: usize,
    recent_value: Option<String>,
    poisoned: bool,
}

impl DraftElection {
    pub fn new(
        node: impl Into<NodeId>,
        generator: MonotonicIdGenerator,
        quorum_size: usize,
        policy: ExtractionPolicy,
    ) -> Self {
        Self {
            node: node.into(),
            generator,
            lane: 0,
            lanes: 1,
            policy,
            prefix_width: MINUTE_PREFIX_WIDTH,
            proposals: HashMap::new(),
            quorum: QuorumVote::new(quorum_size, min_value),
            ballots: HashMap::new(),
            pending: BTreeSet::new(),
            member_high: HashMap::new(),
            elected: HashMap::new(),
            elected_order: VecDeque::new(),
            owner_generation: HashMap::new(),
            history: DEFAULT_ELECTED_HISTORY,
            recent_value: None,
            poisoned: false,
        }
    }

    /// Draft in `lane` of `lanes` so drafts of different nodes never collide
    pub fn with_lane(mut self, lane: u32, lanes: u32) -> Self {
        self.lanes = lanes.max(1);
        self.lane = lane % self.lanes;
        self
    }

    pub fn with_prefix_width(mut self, width: usize) -> Self {
        self.prefix_width = width;
        self
    }

    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history.max(1);
        self
    }

    pub fn add_member(&mut self, member: NodeId) -> bool {
        self.quorum.add_member(member)
    }

    /// Remove a crashed member. Its missing drafts no longer hold back
    /// extraction, so this may elect segments.
    pub fn remove_member(&mut self, member: &NodeId) -> Result<Vec<ElectSegment>> {
        self.check_poisoned()?;
        if !self.quorum.remove_member(member) {
            return Ok(Vec::new());
        }
        self.member_high.remove(member);
        self.extract()
    }

    pub fn is_member(&self, member: &NodeId) -> bool {
        self.quorum.is_member(member)
    }

    /// Answer a generate request from an entry node
    pub fn on_generate_segment(
        &mut self,
        advance: &AdvanceSegment,
        length: u64,
        floor: Option<&str>,
    ) -> Result<GenerateOutcome> {
        self.check_poisoned()?;

        if let Some(elected) = self.elected.get(advance) {
            return Ok(GenerateOutcome::AlreadyElected(elected.elect.clone()));
        }
        let drafted = self
            .ballots
            .get(advance)
            .map_or(false, |b| b.owners.contains(&self.node));
        if drafted || self.proposals.contains_key(advance) {
            return Ok(GenerateOutcome::Duplicate);
        }
        if self.is_forgotten(advance) {
            debug!(advance = %advance, "ignoring generate request for evicted segment");
            return Ok(GenerateOutcome::Stale);
        }

        if let Some(floor) = floor {
            match ComplexId::decode_prefix(floor, self.prefix_width) {
                Ok((segment_id, _)) => {
                    self.generator.reconcile_id(&segment_id);
                }
                Err(e) => warn!(advance = %advance, floor = %floor, error = %e, "ignoring bad floor"),
            }
        }

        let draft_id = self.generator.next_in_lane(self.lane, self.lanes);
        let proposal = DraftProposal {
            advance: advance.clone(),
            draft_owner: self.node.clone(),
            draft_id,
            length,
        };
        debug!(advance = %advance, draft = %proposal.draft_id, "drafted segment id");
        ElectionMetrics::record_draft();
        self.proposals.insert(advance.clone(), proposal.clone());
        Ok(GenerateOutcome::Draft(proposal))
    }

    /// Count a draft from any sync node and elect every segment that
    /// became safe, in increasing id order
    pub fn on_draft_proposal(&mut self, proposal: DraftProposal) -> Result<Vec<ElectSegment>> {
        self.check_poisoned()?;

        let DraftProposal {
            advance,
            draft_owner: owner,
            draft_id,
            length,
        } = proposal;
        let value = draft_id.encode();

        self.generator.reconcile_id(&draft_id);
        match self.member_high.get_mut(&owner) {
            Some(high) if *high >= value => {}
            Some(high) => *high = value.clone(),
            None => {
                self.member_high.insert(owner.clone(), value.clone());
            }
        }

        if let Some(elected) = self.elected.get_mut(&advance) {
            if elected.owners.insert(owner.clone()) {
                // keeps the quorum topic collectable
                self.quorum.vote(owner, advance, value);
            }
            return Ok(Vec::new());
        }
        if self.is_stale(&advance, &value) {
            debug!(advance = %advance, owner = %owner, draft = %value, "dropping stale draft");
            return Ok(Vec::new());
        }

        let ballot = self.ballots.entry(advance.clone()).or_insert_with(|| Ballot {
            owners: HashSet::new(),
            ready: false,
            length,
        });
        if !ballot.owners.insert(owner.clone()) {
            debug!(advance = %advance, owner = %owner, "dropping duplicate draft");
            return Ok(Vec::new());
        }
        let tally = self.quorum.vote(owner.clone(), advance.clone(), value.clone());
        if tally.resolved.is_some() {
            ballot.ready = true;
        }
        self.pending.insert(PendingDraft {
            value,
            advance,
            owner,
        });

        let elected = self.extract()?;
        ElectionMetrics::set_pending(self.pending.len());
        Ok(elected)
    }

    /// An owner's generations are elected in increasing order, so one at or
    /// below its highest elected generation that is no longer remembered
    /// was elected and evicted.
    fn is_forgotten(&self, advance: &AdvanceSegment) -> bool {
        !self.elected.contains_key(advance)
            && self
                .owner_generation
                .get(&advance.owner)
                .map_or(false, |high| advance.generation <= *high)
    }

    /// A draft that would open a ballot nothing can ever elect. Under the
    /// member watermark a live draft is always above the last elected id.
    fn is_stale(&self, advance: &AdvanceSegment, value: &str) -> bool {
        if self.ballots.contains_key(advance) {
            return false;
        }
        let below_recent = self.policy == ExtractionPolicy::MemberWatermark
            && self
                .recent_value
                .as_deref()
                .map_or(false, |recent| value <= recent);
        below_recent || self.is_forgotten(advance)
    }

    fn extract(&mut self) -> Result<Vec<ElectSegment>> {
        let mut elected = Vec::new();
        while let Some(head) = self.pending.first().cloned() {
            if !self.gate_open(&head.value) {
                break;
            }
            let ready = self.ballots.get(&head.advance).map_or(false, |b| b.ready);
            if !ready {
                break;
            }
            elected.push(self.finalize(head)?);
        }
        Ok(elected)
    }

    fn gate_open(&self, candidate: &str) -> bool {
        match self.policy {
            ExtractionPolicy::Counting => self.pending.len() > self.open_keys(),
            ExtractionPolicy::MemberWatermark => self.quorum.members().all(|member| {
                self.member_high
                    .get(member)
                    .map_or(false, |high| high.as_str() >= candidate)
            }),
        }
    }

    fn finalize(&mut self, head: PendingDraft) -> Result<ElectSegment> {
        self.set_recent_value(&head.value)?;

        let ballot = self.ballots.remove(&head.advance);
        self.pending.retain(|draft| draft.advance != head.advance);
        let own = self.proposals.remove(&head.advance);
        let length = ballot
            .as_ref()
            .map(|b| b.length)
            .or(own.map(|p| p.length))
            .unwrap_or_default();

        let elect = ElectSegment {
            advance: head.advance.clone(),
            elected: head.value,
            length,
        };
        info!(advance = %elect.advance, elected = %elect.elected, "elected segment");
        ElectionMetrics::record_elected();

        self.elected.insert(
            head.advance.clone(),
            Elected {
                elect: elect.clone(),
                owners: ballot.map(|b| b.owners).unwrap_or_default(),
            },
        );
        let high = self
            .owner_generation
            .entry(head.advance.owner.clone())
            .or_insert(head.advance.generation);
        *high = (*high).max(head.advance.generation);
        self.elected_order.push_back(head.advance);
        while self.elected_order.len() > self.history {
            if let Some(old) = self.elected_order.pop_front() {
                self.elected.remove(&old);
                self.quorum.forget(&old);
            }
        }
        Ok(elect)
    }

    /// Advance the elected-id watermark. It must strictly increase; any
    /// other value is refused and poisons the election.
    fn set_recent_value(&mut self, value: &str) -> Result<()> {
        if let Some(recent) = &self.recent_value {
            if value <= recent.as_str() {
                self.poisoned = true;
                ElectionMetrics::record_order_violation();
                error!(
                    node = %self.node,
                    recent = %recent,
                    attempted = %value,
                    "election order violated, draft election poisoned"
                );
                return Err(ClusterError::ElectionOrder {
                    recent: recent.clone(),
                    attempted: value.to_string(),
                });
            }
        }
        self.recent_value = Some(value.to_string());
        Ok(())
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned {
            Err(ClusterError::ElectionPoisoned)
        } else {
            Ok(())
        }
    }

    /// Absorb a peer's generator position
    pub fn observe_peer_high(&mut self, id: &ComplexId) -> bool {
        self.generator.reconcile_id(id)
    }

    pub fn refresh_prefix(&mut self, source: &dyn PrefixSource) -> bool {
        self.generator.refresh_prefix(source)
    }

    pub fn generator(&self) -> &MonotonicIdGenerator {
        &self.generator
    }

    /// Keys with votes or an own proposal that are not yet elected
    pub fn open_keys(&self) -> usize {
        self.ballots.len()
            + self
                .proposals
                .keys()
                .filter(|advance| !self.ballots.contains_key(*advance))
                .count()
    }

    pub fn pending_drafts(&self) -> usize {
        self.pending.len()
    }

    /// Quorum topics still collecting drafts, elected or not
    pub fn open_votes(&self) -> usize {
        self.quorum.open_count()
    }

    pub fn recent_value(&self) -> Option<&str> {
        self.recent_value.as_deref()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// This node's unelected draft for `advance`
    pub fn proposal(&self, advance: &AdvanceSegment) -> Option<&DraftProposal> {
        self.proposals.get(advance)
    }

    pub fn prefix_width(&self) -> usize {
        self.prefix_width
    }

    pub fn member_count(&self) -> usize {
        self.quorum.member_count()
    }

    pub fn elected(&self, advance: &AdvanceSegment) -> Option<&ElectSegment> {
        self.elected.get(advance).map(|e| &e.elect)
    }

    pub fn policy(&self) -> ExtractionPolicy {
        self.policy
    }
}
