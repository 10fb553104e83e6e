//! Commit watermark
//!
//! Storage replicas vote the highest final id they durably wrote for a
//! segment. Once a quorum has voted, the minimum position is announced to
//! the entry nodes as the segment's ready id.

use crate::node::NodeId;
use crate::observability::SegmentMetrics;
use crate::quorum::{min_value, QuorumVote};
use crate::segment::AdvanceSegment;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Default number of committed segments remembered
pub const DEFAULT_COMMITTED_HISTORY: usize = 4096;

/// Commit watermark notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSegment {
    pub advance: AdvanceSegment,
    pub ready_id: String,
}

#[derive(Debug)]
struct Committed {
    ready_id: String,
    voters: HashSet<NodeId>,
}

/// Per sync node commit watermark
#[derive(Debug)]
pub struct CommitWatermark {
    quorum: QuorumVote<NodeId, AdvanceSegment, String>,
    committed: HashMap<AdvanceSegment, Committed>,
    committed_order: VecDeque<AdvanceSegment>,
    history: usize,
}

impl CommitWatermark {
    pub fn new(quorum_size: usize) -> Self {
        Self {
            quorum: QuorumVote::new(quorum_size, min_value),
            committed: HashMap::new(),
            committed_order: VecDeque::new(),
            history: DEFAULT_COMMITTED_HISTORY,
        }
    }

    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history.max(1);
        self
    }

    pub fn add_member(&mut self, member: NodeId) -> bool {
        self.quorum.add_member(member)
    }

    pub fn remove_member(&mut self, member: &NodeId) -> bool {
        self.quorum.remove_member(member)
    }

    pub fn is_member(&self, member: &NodeId) -> bool {
        self.quorum.is_member(member)
    }

    /// Record a replica's durable position for `advance`.
    ///
    /// A repeated vote from a voter of an already committed segment means
    /// the voter never saw the announcement, so it is announced again. A
    /// first vote arriving after the commit still counts toward the open
    /// topic so it is collected once every member has voted.
    pub fn on_commit_vote(
        &mut self,
        voter: NodeId,
        advance: AdvanceSegment,
        position: String,
    ) -> Option<CommitSegment> {
        if let Some(committed) = self.committed.get_mut(&advance) {
            if committed.voters.insert(voter.clone()) {
                if self.quorum.is_open(&advance) {
                    self.quorum.vote(voter, advance, position);
                }
                return None;
            }
            debug!(advance = %advance, "re-announcing commit watermark");
            return Some(CommitSegment {
                advance,
                ready_id: committed.ready_id.clone(),
            });
        }

        if self.quorum.has_voted(&advance, &voter) {
            debug!(advance = %advance, voter = %voter, "dropping duplicate commit vote");
            return None;
        }

        let mut voters: HashSet<NodeId> = self
            .quorum
            .topic(&advance)
            .map(|topic| topic.voters.iter().cloned().collect())
            .unwrap_or_default();
        voters.insert(voter.clone());

        let tally = self.quorum.vote(voter, advance.clone(), position);
        let ready_id = tally.resolved?;
        self.remember(advance.clone(), ready_id.clone(), voters);
        SegmentMetrics::record_committed();
        debug!(advance = %advance, ready_id = %ready_id, "segment commit watermark reached");
        Some(CommitSegment { advance, ready_id })
    }

    fn remember(&mut self, advance: AdvanceSegment, ready_id: String, voters: HashSet<NodeId>) {
        self.committed
            .insert(advance.clone(), Committed { ready_id, voters });
        self.committed_order.push_back(advance);
        while self.committed_order.len() > self.history {
            if let Some(old) = self.committed_order.pop_front() {
                self.committed.remove(&old);
                // members that never vote would otherwise keep it open
                self.quorum.forget(&old);
            }
        }
    }

    pub fn is_committed(&self, advance: &AdvanceSegment) -> bool {
        self.committed.contains_key(advance)
    }

    pub fn open_votes(&self) -> usize {
        self.quorum.open_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watermark() -> CommitWatermark {
        let mut watermark = CommitWatermark::new(2);
        for member in ["e1", "e2", "e3"] {
            watermark.add_member(member.to_string());
        }
        watermark
    }

    #[test]
    fn test_quorum_minimum_is_announced() {
        let mut watermark = watermark();
        let advance = AdvanceSegment::new("e1", 1);

        assert!(watermark
            .on_commit_vote("e1".into(), advance.clone(), "P1213".into())
            .is_none());
        let commit = watermark
            .on_commit_vote("e2".into(), advance.clone(), "P1212".into())
            .unwrap();
        assert_eq!(commit.ready_id, "P1212");
        assert!(watermark.is_committed(&advance));

        // third replica arrives late
        assert!(watermark
            .on_commit_vote("e3".into(), advance.clone(), "P1213".into())
            .is_none());
    }

    #[test]
    fn test_duplicate_votes_are_ignored() {
        let mut watermark = watermark();
        let advance = AdvanceSegment::new("e1", 1);
        watermark.on_commit_vote("e1".into(), advance.clone(), "P1211".into());
        assert!(watermark
            .on_commit_vote("e1".into(), advance.clone(), "P1211".into())
            .is_none());
        assert_eq!(watermark.open_votes(), 1);
    }

    #[test]
    fn test_repeated_vote_after_commit_reannounces() {
        let mut watermark = watermark();
        let advance = AdvanceSegment::new("e1", 1);
        watermark.on_commit_vote("e1".into(), advance.clone(), "P1211".into());
        watermark.on_commit_vote("e2".into(), advance.clone(), "P1211".into());

        let again = watermark
            .on_commit_vote("e1".into(), advance.clone(), "P1211".into())
            .unwrap();
        assert_eq!(again.ready_id, "P1211");
    }

    #[test]
    fn test_late_votes_collect_committed_topics() {
        let mut watermark = watermark();
        for generation in 1..=100 {
            let advance = AdvanceSegment::new("e1", generation);
            for member in ["e1", "e2", "e3"] {
                watermark.on_commit_vote(member.into(), advance.clone(), format!("P{generation:04}"));
            }
            assert!(watermark.is_committed(&advance));
        }
        assert_eq!(watermark.open_votes(), 0);
    }

    #[test]
    fn test_history_eviction_forgets_open_topic() {
        let mut watermark = watermark().with_history(2);
        for generation in 1..=5 {
            let advance = AdvanceSegment::new("e1", generation);
            watermark.on_commit_vote("e1".into(), advance.clone(), "P1211".into());
            watermark.on_commit_vote("e2".into(), advance, "P1211".into());
        }
        // e3 never votes: only the remembered commits stay open
        assert_eq!(watermark.open_votes(), 2);
        assert!(!watermark.is_committed(&AdvanceSegment::new("e1", 1)));
    }
}
