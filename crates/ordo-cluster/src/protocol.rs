//! Wire protocol for cluster communication

use crate::election::{DraftProposal, ElectSegment};
use crate::error::{ClusterError, Result};
use crate::event::PublishOptions;
use crate::lock::{Claim, Release};
use crate::node::{NodeId, NodeRole};
use crate::retained::RetainedChange;
use crate::segment::{AdvanceId, AdvanceSegment, GenerateRequest};
use crate::watermark::CommitSegment;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum protocol version we can interoperate with
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Broadcast groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// All sync nodes
    Sync,
    /// All entry nodes
    Entry,
    /// The sync node hosting the retained table
    Lock,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Topic::Sync => "sync",
            Topic::Entry => "entry",
            Topic::Lock => "lock",
        })
    }
}

impl Topic {
    /// Topics a member subscribes to
    pub fn subscriptions(role: NodeRole, lock_host: bool) -> Vec<Topic> {
        match (role, lock_host) {
            (NodeRole::Sync, true) => vec![Topic::Sync, Topic::Lock],
            (NodeRole::Sync, false) => vec![Topic::Sync],
            (NodeRole::Entry, _) => vec![Topic::Entry],
        }
    }
}

/// Final id assigned to one buffered event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedId {
    pub advance_id: AdvanceId,
    pub final_id: String,
}

/// Messages exchanged between cluster nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterMessage {
    // ==================== Entry -> Sync ====================
    /// An entry node opened a segment (informational)
    BeginAdvanceSegment { advance: AdvanceSegment },

    /// Ask the sync nodes to order a segment
    GenerateSegment(GenerateRequest),

    // ==================== Sync -> Sync ====================
    DraftSegment(DraftProposal),

    // ==================== Sync -> Entry ====================
    ElectSegment(ElectSegment),

    /// Commit watermark reached for a segment
    CommitSegment(CommitSegment),

    // ==================== Entry -> Entry ====================
    /// One buffered event, replicated to every storage replica
    KeepAdvanceHistory {
        advance_id: AdvanceId,
        realm: String,
        uri: String,
        data: Vec<u8>,
        opt: PublishOptions,
        sid: String,
    },

    /// A replica persisted a segment under its final ids
    AdvanceSegmentResolved {
        advance: AdvanceSegment,
        pkg: Vec<ResolvedId>,
        #[serde(rename = "final")]
        is_final: bool,
    },

    // ==================== Entry -> Sync ====================
    /// A replica's durable position for a segment
    CommitVote {
        advance: AdvanceSegment,
        voter: NodeId,
        position: String,
    },

    // ==================== Event-source lock ====================
    EventSourceClaim(Claim),
    EventSourceRelease(Release),
    /// Change of the lock key, sent to watchers
    EventSourceState(RetainedChange),

    // ==================== Membership ====================
    Heartbeat {
        node: NodeId,
        role: NodeRole,
        /// Sender's draft generator position (sync nodes)
        high: Option<String>,
    },
}

impl ClusterMessage {
    /// Short name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterMessage::BeginAdvanceSegment { .. } => "begin_advance_segment",
            ClusterMessage::GenerateSegment(_) => "generate_segment",
            ClusterMessage::DraftSegment(_) => "draft_segment",
            ClusterMessage::ElectSegment(_) => "elect_segment",
            ClusterMessage::CommitSegment(_) => "commit_segment",
            ClusterMessage::KeepAdvanceHistory { .. } => "keep_advance_history",
            ClusterMessage::AdvanceSegmentResolved { .. } => "advance_segment_resolved",
            ClusterMessage::CommitVote { .. } => "commit_vote",
            ClusterMessage::EventSourceClaim(_) => "event_source_claim",
            ClusterMessage::EventSourceRelease(_) => "event_source_release",
            ClusterMessage::EventSourceState(_) => "event_source_state",
            ClusterMessage::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Header carried by every envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub version: u16,
    pub source: NodeId,
}

impl MessageHeader {
    pub fn new(source: NodeId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            source,
        }
    }

    pub fn validate_version(&self) -> Result<()> {
        if self.version < MIN_PROTOCOL_VERSION || self.version > PROTOCOL_VERSION {
            Err(ClusterError::Protocol(format!(
                "unsupported protocol version {}: supported range [{}, {}]",
                self.version, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION
            )))
        } else {
            Ok(())
        }
    }
}

/// A message published to a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: MessageHeader,
    pub topic: Topic,
    pub message: ClusterMessage,
}

impl Envelope {
    pub fn new(source: impl Into<NodeId>, topic: Topic, message: ClusterMessage) -> Self {
        Self {
            header: MessageHeader::new(source.into()),
            topic,
            message,
        }
    }

    pub fn source(&self) -> &NodeId {
        &self.header.source
    }
}

/// A message a node state machine wants published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: Topic,
    pub message: ClusterMessage,
}

impl Outbound {
    pub fn new(topic: Topic, message: ClusterMessage) -> Self {
        Self { topic, message }
    }

    pub fn into_envelope(self, source: &NodeId) -> Envelope {
        Envelope::new(source.clone(), self.topic, self.message)
    }
}

/// Encode an envelope to bytes
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    let bytes =
        postcard::to_allocvec(envelope).map_err(|e| ClusterError::Serialization(e.to_string()))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ClusterError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode an envelope from bytes
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ClusterError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let envelope: Envelope =
        postcard::from_bytes(bytes).map_err(|e| ClusterError::Deserialization(e.to_string()))?;
    envelope.header.validate_version()?;
    Ok(envelope)
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(data: &[u8]) -> Vec<u8> {
    let len = data.len() as u32;
    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(data);
    framed
}

/// Extract message length from frame header
pub fn frame_length(header: &[u8; 4]) -> usize {
    u32::from_be_bytes(*header) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ComplexId;

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope::new(
            "sync-1",
            Topic::Sync,
            ClusterMessage::DraftSegment(DraftProposal {
                advance: AdvanceSegment::new("entry-1", 3),
                draft_owner: "sync-1".into(),
                draft_id: ComplexId::new("202410191530", 7),
                length: 2,
            }),
        );

        let bytes = encode_envelope(&envelope).unwrap();
        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.message.kind(), "draft_segment");
        assert_eq!(decoded.source(), "sync-1");
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut envelope = Envelope::new(
            "entry-1",
            Topic::Sync,
            ClusterMessage::Heartbeat {
                node: "entry-1".into(),
                role: NodeRole::Entry,
                high: None,
            },
        );
        envelope.header.version = PROTOCOL_VERSION + 1;
        let bytes = postcard::to_allocvec(&envelope).unwrap();
        assert!(matches!(
            decode_envelope(&bytes),
            Err(ClusterError::Protocol(_))
        ));
    }

    #[test]
    fn test_framing() {
        let data = b"hello world";
        let framed = frame_message(data);

        assert_eq!(framed.len(), 4 + data.len());

        let mut header = [0u8; 4];
        header.copy_from_slice(&framed[..4]);
        assert_eq!(frame_length(&header), data.len());
    }

    #[test]
    fn test_subscriptions() {
        assert_eq!(
            Topic::subscriptions(NodeRole::Sync, true),
            vec![Topic::Sync, Topic::Lock]
        );
        assert_eq!(Topic::subscriptions(NodeRole::Entry, true), vec![Topic::Entry]);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode_envelope(&[0xff, 0xff, 0xff]).is_err());
    }
}
