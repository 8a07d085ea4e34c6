//! Raft state machine implementation.
//!
//! The state machine receives committed log entries (commands) and applies
//! them to produce the cluster state. All nodes apply the same commands in
//! the same order, ensuring consistent state.

mod machine;
pub mod snapshot;

pub use machine::{
    ClusterResponse, ClusterStateMachine, ReplicatedState, RequestCache, StateSummary,
    REQUEST_CACHE_CAPACITY,
};
pub use snapshot::{SnapshotBundle, SnapshotProvider};
