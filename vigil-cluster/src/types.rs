//! Type definitions for OpenRaft integration.
//!
//! OpenRaft requires a type configuration that specifies all the concrete types
//! used in the Raft implementation. This module defines vigil's type configuration.

use crate::command::ClusterRequest;
use crate::state::ClusterResponse;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::io::Cursor;

/// Node ID type for the cluster.
///
/// Each node has a stable 64-bit identifier independent of its endpoint.
pub type ClusterNodeId = u64;

/// Replicated per-member data stored in the membership configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberNode {
    /// Public endpoint of the member (host:port).
    pub addr: String,
    /// Free-form labels used for assignment affinity.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl MemberNode {
    /// Create a member record.
    pub fn new(addr: impl Into<String>, tags: BTreeSet<String>) -> Self {
        Self {
            addr: addr.into(),
            tags,
        }
    }
}

impl fmt::Display for MemberNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tags.is_empty() {
            write!(f, "{}", self.addr)
        } else {
            let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
            write!(f, "{} [{}]", self.addr, tags.join(","))
        }
    }
}

openraft::declare_raft_types!(
    /// OpenRaft type configuration for vigil.
    pub TypeConfig:
        D = ClusterRequest,
        R = ClusterResponse,
        Node = MemberNode,
        SnapshotData = Cursor<Vec<u8>>,
);

/// Type alias for Raft instance.
pub type ClusterRaft = openraft::Raft<TypeConfig>;

/// Type alias for log entry.
pub type ClusterEntry = openraft::Entry<TypeConfig>;

/// Type alias for vote.
pub type ClusterVote = openraft::Vote<ClusterNodeId>;

/// Type alias for log ID.
pub type ClusterLogId = openraft::LogId<ClusterNodeId>;

/// Type alias for stored membership.
pub type ClusterStoredMembership = openraft::StoredMembership<ClusterNodeId, MemberNode>;

/// Type alias for snapshot metadata.
pub type ClusterSnapshotMeta = openraft::SnapshotMeta<ClusterNodeId, MemberNode>;

/// Type alias for snapshot.
pub type ClusterSnapshot = openraft::storage::Snapshot<TypeConfig>;

/// Type alias for log state.
pub type ClusterLogState = openraft::LogState<TypeConfig>;

/// Type alias for storage error.
pub type ClusterStorageError = openraft::StorageError<ClusterNodeId>;

/// Type alias for Raft metrics.
pub type ClusterMetrics = openraft::RaftMetrics<ClusterNodeId, MemberNode>;

/// Type alias for client write error.
pub type ClusterClientWriteError = openraft::error::ClientWriteError<ClusterNodeId, MemberNode>;

/// Type alias for raft error with client write error.
pub type ClusterRaftWriteError = openraft::error::RaftError<ClusterNodeId, ClusterClientWriteError>;

/// Information about the leader to forward requests to.
#[derive(Debug, Clone)]
pub struct LeaderInfo {
    /// The leader's node ID.
    pub leader_id: ClusterNodeId,
    /// The leader's address (may be empty if unknown).
    pub leader_addr: String,
}

/// Extract forward-to-leader info from a client write error.
///
/// Returns `Some(LeaderInfo)` if the error is a ForwardToLeader error with
/// a known leader ID, `None` otherwise.
pub fn extract_forward_to_leader(error: &ClusterRaftWriteError) -> Option<LeaderInfo> {
    use openraft::error::RaftError;

    match error {
        RaftError::APIError(ClusterClientWriteError::ForwardToLeader(forward)) => {
            forward.leader_id.map(|leader_id| LeaderInfo {
                leader_id,
                leader_addr: forward
                    .leader_node
                    .as_ref()
                    .map(|n| n.addr.clone())
                    .unwrap_or_default(),
            })
        }
        _ => None,
    }
}

/// Whether a client write error means "not the leader" without a known leader.
pub fn is_forward_without_leader(error: &ClusterRaftWriteError) -> bool {
    use openraft::error::RaftError;

    matches!(
        error,
        RaftError::APIError(ClusterClientWriteError::ForwardToLeader(forward))
            if forward.leader_id.is_none()
    )
}
