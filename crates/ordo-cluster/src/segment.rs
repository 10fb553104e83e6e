//! Advance segments and the entry-side segment buffer
//!
//! An entry node batches accepted events into its open advance segment.
//! Committing a segment seals it and queues it; exactly one segment per
//! entry node is in flight at a time. The in-flight segment is broadcast to
//! the sync nodes as a generate request, receives its elected segment id,
//! and is confirmed once the commit watermark covers its last final id.
//! Only then is the next queued segment started, which keeps the entry
//! node's write order intact end to end.

use crate::error::{ClusterError, Result};
use crate::event::{FinalEvent, RouterEvent};
use crate::id::encode_counter;
use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One entry node's batch of not yet ordered events
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdvanceSegment {
    pub owner: NodeId,
    pub generation: u64,
}

impl AdvanceSegment {
    pub fn new(owner: impl Into<NodeId>, generation: u64) -> Self {
        Self {
            owner: owner.into(),
            generation,
        }
    }
}

impl fmt::Display for AdvanceSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.owner, self.generation)
    }
}

/// Position of one buffered event
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdvanceId {
    pub segment: AdvanceSegment,
    pub offset: u64,
}

impl fmt::Display for AdvanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// Final id of the event at `offset` inside a segment elected as `elected`
pub fn final_id(elected: &str, offset: u64) -> String {
    let mut id = String::with_capacity(elected.len() + 4);
    id.push_str(elected);
    id.push_str(&encode_counter(offset));
    id
}

/// Request sent to the sync nodes to order a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub advance: AdvanceSegment,
    /// Number of events in the segment
    pub length: u64,
    /// Highest final id the requesting entry has persisted
    pub floor: Option<String>,
}

/// Events of one segment held in memory until committed
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub advance: AdvanceSegment,
    pub counter: u64,
    pub content: Vec<RouterEvent>,
}

impl SegmentRecord {
    fn new(advance: AdvanceSegment) -> Self {
        Self {
            advance,
            counter: 0,
            content: Vec::new(),
        }
    }

    fn push(&mut self, event: RouterEvent) -> u64 {
        self.counter += 1;
        self.content.push(event);
        self.counter
    }
}

/// Result of [`SegmentBuffer::append_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    pub advance: AdvanceSegment,
    pub offset: u64,
    /// This event opened a new segment
    pub opened: bool,
}

/// A segment confirmed durable by the commit watermark
#[derive(Debug, Clone)]
pub struct CommittedSegment {
    pub advance: AdvanceSegment,
    pub events: Vec<FinalEvent>,
    /// Generate request for the next queued segment, if one was started
    pub next: Option<GenerateRequest>,
}

impl CommittedSegment {
    pub fn final_ids(&self) -> Vec<String> {
        self.events.iter().map(|e| e.id.clone()).collect()
    }
}

#[derive(Debug)]
struct InFlight {
    record: SegmentRecord,
    last_broadcast: Instant,
    elected: Option<String>,
    final_ids: Vec<String>,
    watermark: Option<String>,
}

impl InFlight {
    fn is_ready(&self) -> bool {
        match (&self.watermark, self.final_ids.last()) {
            (Some(ready), Some(last)) => ready >= last,
            _ => false,
        }
    }
}

/// Entry-side segment buffer with a single in-flight commit
#[derive(Debug)]
pub struct SegmentBuffer {
    owner: NodeId,
    generation: u64,
    open: Option<SegmentRecord>,
    queue: VecDeque<SegmentRecord>,
    in_flight: Option<InFlight>,
    max_pending: usize,
    floor: Option<String>,
}

impl SegmentBuffer {
    /// `start_generation` must exceed every generation a previous
    /// incarnation of this node used.
    pub fn new(owner: impl Into<NodeId>, start_generation: u64, max_pending: usize) -> Self {
        Self {
            owner: owner.into(),
            generation: start_generation,
            open: None,
            queue: VecDeque::new(),
            in_flight: None,
            max_pending: max_pending.max(1),
            floor: None,
        }
    }

    /// Raise the persisted-id floor carried by generate requests
    pub fn observe_floor(&mut self, id: &str) {
        if self.floor.as_deref().map_or(true, |floor| id > floor) {
            self.floor = Some(id.to_string());
        }
    }

    pub fn floor(&self) -> Option<&str> {
        self.floor.as_deref()
    }

    /// Append an event to the open segment, opening one if needed
    pub fn append_event(&mut self, event: RouterEvent) -> Appended {
        let opened = self.open.is_none();
        let record = match self.open {
            Some(ref mut record) => record,
            None => {
                self.generation += 1;
                let advance = AdvanceSegment::new(self.owner.clone(), self.generation);
                debug!(advance = %advance, "opened advance segment");
                self.open.insert(SegmentRecord::new(advance))
            }
        };
        let offset = record.push(event);
        Appended {
            advance: record.advance.clone(),
            offset,
            opened,
        }
    }

    /// Seal and queue `advance`. Returns the generate request to broadcast
    /// when the segment could be started immediately.
    pub fn request_commit(
        &mut self,
        advance: &AdvanceSegment,
        now: Instant,
    ) -> Result<Option<GenerateRequest>> {
        let in_flight = self
            .in_flight
            .as_ref()
            .map_or(false, |f| &f.record.advance == advance);
        if in_flight || self.queue.iter().any(|r| &r.advance == advance) {
            return Ok(None);
        }

        match self.open.take() {
            Some(record) if &record.advance == advance => {
                let pending = self.pending_segments();
                if pending >= self.max_pending {
                    self.open = Some(record);
                    return Err(ClusterError::Backpressure {
                        pending,
                        max: self.max_pending,
                    });
                }
                self.queue.push_back(record);
            }
            other => {
                self.open = other;
                return Err(ClusterError::UnknownSegment(advance.clone()));
            }
        }

        Ok(self.start_next(now))
    }

    fn start_next(&mut self, now: Instant) -> Option<GenerateRequest> {
        if self.in_flight.is_some() {
            return None;
        }
        let record = self.queue.pop_front()?;
        let flight = InFlight {
            record,
            last_broadcast: now,
            elected: None,
            final_ids: Vec::new(),
            watermark: None,
        };
        let request = self.request_for(&flight);
        self.in_flight = Some(flight);
        Some(request)
    }

    fn request_for(&self, flight: &InFlight) -> GenerateRequest {
        GenerateRequest {
            advance: flight.record.advance.clone(),
            length: flight.record.content.len() as u64,
            floor: self.floor.clone(),
        }
    }

    /// Accept the elected id for the in-flight segment. Returns the final
    /// ids in offset order; elections for any other segment are ignored.
    pub fn on_elect_segment(&mut self, advance: &AdvanceSegment, elected: &str) -> Option<Vec<String>> {
        let flight = self.in_flight.as_mut()?;
        if &flight.record.advance != advance {
            debug!(advance = %advance, "ignoring election for segment not in flight");
            return None;
        }
        if let Some(previous) = &flight.elected {
            if previous != elected {
                warn!(
                    advance = %advance,
                    accepted = %previous,
                    conflicting = %elected,
                    "conflicting election for in-flight segment"
                );
            }
            return None;
        }
        flight.final_ids = (1..=flight.record.counter)
            .map(|offset| final_id(elected, offset))
            .collect();
        flight.elected = Some(elected.to_string());
        Some(flight.final_ids.clone())
    }

    /// Record a commit watermark for the in-flight segment and confirm it
    /// if it is covered. A watermark that arrives before the election is
    /// kept until the election lands.
    pub fn on_commit_watermark(
        &mut self,
        advance: &AdvanceSegment,
        ready_id: &str,
        now: Instant,
    ) -> Option<CommittedSegment> {
        let flight = self.in_flight.as_mut()?;
        if &flight.record.advance != advance {
            return None;
        }
        if flight.watermark.as_deref().map_or(true, |w| ready_id > w) {
            flight.watermark = Some(ready_id.to_string());
        }
        self.confirm_ready(now)
    }

    /// Confirm the in-flight segment if it is elected and covered by the
    /// watermark, and start the next queued segment.
    pub fn confirm_ready(&mut self, now: Instant) -> Option<CommittedSegment> {
        if !self.in_flight.as_ref()?.is_ready() {
            return None;
        }
        let flight = self.in_flight.take()?;
        if let Some(last) = flight.final_ids.last() {
            self.observe_floor(last);
        }
        let events = flight
            .final_ids
            .into_iter()
            .zip(flight.record.content)
            .map(|(id, event)| FinalEvent { id, event })
            .collect();
        let next = self.start_next(now);
        Some(CommittedSegment {
            advance: flight.record.advance,
            events,
            next,
        })
    }

    /// Generate request to re-broadcast when the in-flight segment has
    /// waited longer than `timeout` since its last broadcast
    pub fn stalled(&mut self, now: Instant, timeout: Duration) -> Option<GenerateRequest> {
        let flight = self.in_flight.as_ref()?;
        if now.saturating_duration_since(flight.last_broadcast) < timeout {
            return None;
        }
        let request = self.request_for(flight);
        if let Some(flight) = self.in_flight.as_mut() {
            flight.last_broadcast = now;
        }
        Some(request)
    }

    /// Queued plus in-flight segments
    pub fn pending_segments(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    pub fn open_segment(&self) -> Option<&AdvanceSegment> {
        self.open.as_ref().map(|r| &r.advance)
    }

    pub fn in_flight(&self) -> Option<&AdvanceSegment> {
        self.in_flight.as_ref().map(|f| &f.record.advance)
    }

    pub fn is_elected(&self, advance: &AdvanceSegment) -> bool {
        self.in_flight
            .as_ref()
            .map_or(false, |f| &f.record.advance == advance && f.elected.is_some())
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}
