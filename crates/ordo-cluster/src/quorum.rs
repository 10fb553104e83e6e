//! Generic quorum vote
//!
//! Collects votes keyed by topic, folds their values with a reduce function
//! and resolves each topic at most once, on the vote that first reaches the
//! configured quorum. A topic is dropped as soon as every known member has
//! voted on it, so no topic outlives one full round.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Votes needed to resolve a topic unless configured otherwise
pub const DEFAULT_QUORUM_SIZE: usize = 2;

/// Per-topic vote state
#[derive(Debug, Clone)]
pub struct QuorumTopic<M, V> {
    pub value: V,
    pub voters: Vec<M>,
    pub resolved: bool,
}

/// Outcome of a single vote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally<V> {
    /// Votes recorded for the topic, including this one
    pub votes: usize,
    /// Set exactly once per topic: on the vote that reaches quorum
    pub resolved: Option<V>,
    /// The topic was garbage collected after this vote
    pub collected: bool,
}

/// Reduce function keeping the smaller value
pub fn min_value<V: Ord + Clone>(a: &V, b: &V) -> V {
    if b < a {
        b.clone()
    } else {
        a.clone()
    }
}

/// Quorum vote over members `M`, topics `T` and values `V`
#[derive(Debug)]
pub struct QuorumVote<M, T, V> {
    quorum_size: usize,
    reduce: fn(&V, &V) -> V,
    members: HashSet<M>,
    topics: HashMap<T, QuorumTopic<M, V>>,
}

impl<M, T, V> QuorumVote<M, T, V>
where
    M: Eq + Hash + Clone,
    T: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(quorum_size: usize, reduce: fn(&V, &V) -> V) -> Self {
        Self {
            quorum_size,
            reduce,
            members: HashSet::new(),
            topics: HashMap::new(),
        }
    }

    /// Drop `topic` without resolving it, for callers that stop tracking
    /// a topic whose remaining votes will never come
    pub fn forget(&mut self, topic: &T) -> bool {
        self.topics.remove(topic).is_some()
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    /// Returns false if the member was already known
    pub fn add_member(&mut self, member: M) -> bool {
        self.members.insert(member)
    }

    /// Open topics are left as they are
    pub fn remove_member(&mut self, member: &M) -> bool {
        self.members.remove(member)
    }

    pub fn members(&self) -> impl Iterator<Item = &M> {
        self.members.iter()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, member: &M) -> bool {
        self.members.contains(member)
    }

    /// Record `member`'s vote on `topic`.
    ///
    /// Duplicate votes from one member count again; callers dedupe.
    pub fn vote(&mut self, member: M, topic: T, value: V) -> Tally<V> {
        let reduce = self.reduce;
        let state = self
            .topics
            .entry(topic.clone())
            .and_modify(|state| {
                if !state.resolved {
                    state.value = reduce(&state.value, &value);
                }
            })
            .or_insert_with(|| QuorumTopic {
                value,
                voters: Vec::new(),
                resolved: false,
            });

        state.voters.push(member);
        let votes = state.voters.len();

        let resolved = if votes >= self.quorum_size && !state.resolved {
            state.resolved = true;
            Some(state.value.clone())
        } else {
            None
        };

        let collected = votes >= self.members.len();
        if collected {
            self.topics.remove(&topic);
        }

        Tally {
            votes,
            resolved,
            collected,
        }
    }

    pub fn has_voted(&self, topic: &T, member: &M) -> bool {
        self.topics
            .get(topic)
            .map(|state| state.voters.contains(member))
            .unwrap_or(false)
    }

    pub fn is_open(&self, topic: &T) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn topic(&self, topic: &T) -> Option<&QuorumTopic<M, V>> {
        self.topics.get(topic)
    }

    pub fn open_topics(&self) -> impl Iterator<Item = &T> {
        self.topics.keys()
    }

    pub fn open_count(&self) -> usize {
        self.topics.len()
    }
}

impl<M, T, V> Default for QuorumVote<M, T, V>
where
    M: Eq + Hash + Clone,
    T: Eq + Hash + Clone,
    V: Ord + Clone,
{
    /// Quorum of [`DEFAULT_QUORUM_SIZE`] keeping the smallest value
    fn default() -> Self {
        Self::new(DEFAULT_QUORUM_SIZE, min_value)
    }
}
