//! Raft state machine for vigil cluster state.
//!
//! The state machine is the core of the cluster's replicated state. It:
//! - Receives committed log entries (commands)
//! - Applies them deterministically to produce consistent state
//! - Supports snapshots for log compaction and state transfer
//!
//! ## Module Structure
//!
//! - `types`: Response types and the request cache
//! - `state`: The replicated state and its read accessors
//! - `apply`: Command application logic
//! - `traits`: OpenRaft trait implementations

mod apply;
mod state;
mod traits;
mod types;

pub(crate) use apply::apply_command;
pub use state::{ReplicatedState, StateSummary};
pub use types::{ClusterResponse, RequestCache, StoredSnapshot, REQUEST_CACHE_CAPACITY};

use crate::events::EventBus;
use parking_lot::RwLock;
use std::sync::atomic::AtomicU64;

use super::snapshot::{self, SnapshotBundle};

/// The Raft state machine.
///
/// Holds the replicated state behind a synchronous lock that is never held
/// across an await point, so readers on any task can take cheap snapshots.
#[derive(Debug)]
pub struct ClusterStateMachine {
    /// The replicated state.
    state: RwLock<ReplicatedState>,
    /// Where committed commands are announced.
    events: EventBus,
    /// Snapshot index counter.
    snapshot_idx: AtomicU64,
    /// Current snapshot.
    current_snapshot: tokio::sync::RwLock<Option<StoredSnapshot>>,
}

impl ClusterStateMachine {
    /// Create a new state machine publishing to `events`.
    pub fn new(events: EventBus) -> Self {
        Self {
            state: RwLock::new(ReplicatedState::default()),
            events,
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: tokio::sync::RwLock::new(None),
        }
    }

    /// Run `f` against the local replica.
    ///
    /// Reads are eventually consistent: a follower may lag the leader.
    pub fn read<R>(&self, f: impl FnOnce(&ReplicatedState) -> R) -> R {
        f(&self.state.read())
    }

    /// Clone of the local replica.
    pub fn snapshot_state(&self) -> ReplicatedState {
        self.state.read().clone()
    }

    /// Export the local replica as a snapshot bundle.
    pub fn bundle(&self) -> SnapshotBundle {
        snapshot::build(&self.state.read())
    }

    /// The bus this state machine publishes to.
    pub fn events(&self) -> &EventBus {
        &self.events
    }
}
