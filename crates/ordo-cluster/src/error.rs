//! Cluster error types

use crate::segment::AdvanceSegment;
use thiserror::Error;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster errors
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("node ID conflict: {0} already exists")]
    NodeIdConflict(String),

    // ==================== Membership Errors ====================
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("wrong node role: {node} is not a {expected} node")]
    WrongRole { node: String, expected: &'static str },

    // ==================== Ordering Errors ====================
    /// An election would have moved the elected-id watermark backwards.
    #[error("election order violated: {attempted} does not follow {recent}")]
    ElectionOrder { recent: String, attempted: String },

    /// The draft election refused an earlier ordering violation and is unusable.
    #[error("draft election poisoned by an earlier ordering violation")]
    ElectionPoisoned,

    #[error("unknown advance segment: {0}")]
    UnknownSegment(AdvanceSegment),

    #[error("segment queue full: {pending} segments pending (max {max})")]
    Backpressure { pending: usize, max: usize },

    #[error("entry session closed")]
    SessionClosed,

    // ==================== Id Errors ====================
    #[error("invalid id {id:?}: {reason}")]
    InvalidId { id: String, reason: &'static str },

    // ==================== Protocol Errors ====================
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // ==================== Network Errors ====================
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    // ==================== Storage Errors ====================
    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ==================== Internal Errors ====================
    #[error("internal error: {0}")]
    Internal(String),

    #[error("shutdown in progress")]
    ShuttingDown,
}

impl ClusterError {
    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClusterError::Timeout
                | ClusterError::ConnectionFailed(_)
                | ClusterError::Backpressure { .. }
                | ClusterError::Network(_)
        )
    }

    /// Check if this is a fatal error: a protocol bug or corrupt state
    /// that must abort the affected component
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::ElectionOrder { .. }
                | ClusterError::ElectionPoisoned
                | ClusterError::CorruptData(_)
        )
    }
}

// Conversion from postcard for serialization
impl From<postcard::Error> for ClusterError {
    fn from(e: postcard::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<redb::Error> for ClusterError {
    fn from(e: redb::Error) -> Self {
        ClusterError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        assert!(ClusterError::Timeout.is_retriable());
        assert!(ClusterError::Backpressure { pending: 8, max: 8 }.is_retriable());
        assert!(!ClusterError::ElectionPoisoned.is_retriable());
        assert!(!ClusterError::InvalidConfig("bad".into()).is_retriable());
    }

    #[test]
    fn test_fatal_errors() {
        let err = ClusterError::ElectionOrder {
            recent: "20240101000013".into(),
            attempted: "20240101000012".into(),
        };
        assert!(err.is_fatal());
        assert!(ClusterError::ElectionPoisoned.is_fatal());
        assert!(ClusterError::CorruptData("bad record".into()).is_fatal());
        assert!(!ClusterError::Timeout.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = ClusterError::UnknownSegment(AdvanceSegment::new("entry-1", 4));
        assert_eq!(err.to_string(), "unknown advance segment: entry-1-4");

        let err = ClusterError::InvalidId {
            id: "x".into(),
            reason: "missing counter",
        };
        assert_eq!(err.to_string(), "invalid id \"x\": missing counter");
    }
}
