//! Error types for cluster operations.
//!
//! Variants fall into four groups. Transient errors (`LeaderUnavailable`,
//! `NotLeader`, `Unreachable`, `Timeout`) are retried with backoff. Final
//! errors (`Validation`, `Rejected`) are surfaced to the caller. `Config`
//! is fatal at startup. The rest is plumbing.

use crate::types::{ClusterNodeId, MemberNode};
use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Type alias for OpenRaft Raft errors.
pub type RaftError<E = openraft::error::Infallible> = openraft::error::RaftError<ClusterNodeId, E>;

/// Type alias for OpenRaft RPC errors.
pub type RPCError<E = openraft::error::Infallible> =
    openraft::error::RPCError<ClusterNodeId, MemberNode, RaftError<E>>;

/// Type alias for client write errors.
pub type ClientWriteError = openraft::error::ClientWriteError<ClusterNodeId, MemberNode>;

/// Type alias for initialize errors.
pub type InitializeError = openraft::error::InitializeError<ClusterNodeId, MemberNode>;

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// No leader is currently elected.
    #[error("Leader unavailable")]
    LeaderUnavailable,

    /// Not the leader - includes leader hint if known.
    #[error("Not the leader, leader is node {leader:?}")]
    NotLeader {
        /// The current leader if known.
        leader: Option<ClusterNodeId>,
    },

    /// No peer answered.
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// The operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The command failed structural validation and was never proposed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The state machine refused the command.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Raft consensus error.
    #[error("Raft error: {0}")]
    Raft(String),

    /// Network/RPC error.
    #[error("Network error: {0}")]
    Network(String),

    /// The peer did not present a valid cluster key.
    #[error("Unauthorized")]
    Unauthorized,

    /// An envelope carried a message type outside the allow-list.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Node not found in cluster.
    #[error("Node {0} not found in cluster")]
    NodeNotFound(ClusterNodeId),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::LeaderUnavailable
                | ClusterError::NotLeader { .. }
                | ClusterError::Unreachable(_)
                | ClusterError::Timeout(_)
        )
    }

    /// Short machine-readable kind, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::LeaderUnavailable => "leader_unavailable",
            ClusterError::NotLeader { .. } => "not_leader",
            ClusterError::Unreachable(_) => "unreachable",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::Validation(_) => "validation",
            ClusterError::Rejected(_) => "rejected",
            ClusterError::Raft(_) => "raft",
            ClusterError::Network(_) => "network",
            ClusterError::Unauthorized => "unauthorized",
            ClusterError::UnknownMessageType(_) => "unknown_message_type",
            ClusterError::Serialization(_) => "serialization",
            ClusterError::Storage(_) => "storage",
            ClusterError::NodeNotFound(_) => "node_not_found",
            ClusterError::Config(_) => "config",
            ClusterError::Io(_) => "io",
        }
    }

    /// Rebuild an error from its wire form.
    pub fn from_wire(kind: &str, message: String, leader: Option<ClusterNodeId>) -> Self {
        match kind {
            "leader_unavailable" => ClusterError::LeaderUnavailable,
            "not_leader" => ClusterError::NotLeader { leader },
            "unreachable" => ClusterError::Unreachable(message),
            "timeout" => ClusterError::Timeout(message),
            "validation" => ClusterError::Validation(message),
            "rejected" => ClusterError::Rejected(message),
            "raft" => ClusterError::Raft(message),
            "unauthorized" => ClusterError::Unauthorized,
            "unknown_message_type" => ClusterError::UnknownMessageType(message),
            "serialization" => ClusterError::Serialization(message),
            "storage" => ClusterError::Storage(message),
            "config" => ClusterError::Config(message),
            _ => ClusterError::Network(message),
        }
    }

    /// Leader hint carried by `NotLeader`.
    pub fn leader_hint(&self) -> Option<ClusterNodeId> {
        match self {
            ClusterError::NotLeader { leader } => *leader,
            _ => None,
        }
    }
}

impl<E: std::error::Error> From<RaftError<E>> for ClusterError {
    fn from(e: RaftError<E>) -> Self {
        ClusterError::Raft(e.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClusterError::Timeout(e.to_string())
        } else if e.is_connect() {
            ClusterError::Unreachable(e.to_string())
        } else {
            ClusterError::Network(e.to_string())
        }
    }
}

impl From<vigil_core::CoreError> for ClusterError {
    fn from(e: vigil_core::CoreError) -> Self {
        ClusterError::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ClusterError::LeaderUnavailable.is_transient());
        assert!(ClusterError::NotLeader { leader: Some(2) }.is_transient());
        assert!(ClusterError::Unreachable("x".into()).is_transient());
        assert!(!ClusterError::Validation("x".into()).is_transient());
        assert!(!ClusterError::Config("x".into()).is_transient());
    }

    #[test]
    fn wire_form_preserves_kind_and_leader() {
        let original = ClusterError::NotLeader { leader: Some(3) };
        let rebuilt = ClusterError::from_wire(original.kind(), original.to_string(), Some(3));
        assert_eq!(rebuilt.leader_hint(), Some(3));
        assert!(rebuilt.is_transient());

        let rebuilt = ClusterError::from_wire("validation", "bad".into(), None);
        assert!(matches!(rebuilt, ClusterError::Validation(m) if m == "bad"));
    }
}
