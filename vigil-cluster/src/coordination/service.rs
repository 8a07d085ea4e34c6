//! Leader-side assignment recomputation.

use super::debounce::Debouncer;
use super::placement;
use crate::command::Command;
use crate::events::ClusterEvent;
use crate::raft::ClusterNode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vigil_core::Clock;

/// Recomputes task assignments when monitors or membership change.
///
/// Every node listens, but only the leader computes and replicates: the
/// decision is agreed through the log rather than derived independently.
pub struct CoordinationService {
    node: Arc<ClusterNode>,
    clock: Arc<dyn Clock>,
    debouncer: Debouncer,
}

impl CoordinationService {
    /// Create the service for `node`.
    pub fn new(node: Arc<ClusterNode>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let delay = Duration::from_millis(node.config().coordination.debounce_ms);
        Arc::new(Self {
            node,
            clock,
            debouncer: Debouncer::new(delay),
        })
    }

    /// Listen for triggers until `shutdown` flips.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut events = this.node.subscribe();
        tokio::spawn(async move {
            // A leader restarted with existing state has nothing else to
            // trigger its first pass.
            this.schedule();
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => {
                            if this.is_trigger(&event) {
                                this.schedule();
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "coordination lagged behind events");
                            this.schedule();
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            this.debouncer.cancel();
            tracing::debug!(node_id = this.node.node_id(), "coordination stopped");
        })
    }

    fn is_trigger(&self, event: &ClusterEvent) -> bool {
        match event {
            ClusterEvent::CommandCommitted {
                command, changed, ..
            } => *changed && command.affects_assignments(),
            ClusterEvent::MemberJoined { .. }
            | ClusterEvent::MemberLeft { .. }
            | ClusterEvent::MemberAvailabilityChanged { .. }
            | ClusterEvent::SnapshotInstalled { .. } => true,
            ClusterEvent::LeaderChanged { leader, .. } => *leader == Some(self.node.node_id()),
            ClusterEvent::ReplicationCaughtUp => false,
        }
    }

    /// Restart the quiet period; recompute when it elapses.
    pub fn schedule(&self) {
        let node = Arc::clone(&self.node);
        let clock = Arc::clone(&self.clock);
        self.debouncer
            .trigger(move || async move {
                recompute(&node, clock.as_ref()).await;
            });
    }

    /// Whether a recomputation is waiting for its quiet period.
    pub fn is_pending(&self) -> bool {
        self.debouncer.is_pending()
    }
}

/// Compute and replicate the assignments that changed.
///
/// Returns how many monitors were reassigned. Followers do nothing.
pub async fn recompute(node: &ClusterNode, clock: &dyn Clock) -> usize {
    if !node.is_leader() {
        return 0;
    }
    let members = node.members();
    if members.is_empty() {
        return 0;
    }

    let assignments = node.state_machine().read(|state| {
        placement::plan(
            state.monitors(),
            state.assignments(),
            members.as_slice(),
            clock.now_ms(),
        )
    });
    if assignments.is_empty() {
        return 0;
    }

    let count = assignments.len();
    tracing::info!(
        node_id = node.node_id(),
        monitors = count,
        members = members.len(),
        "replicating task assignments"
    );
    if node
        .replicate_and_commit(Command::AssignTasks { assignments })
        .await
    {
        count
    } else {
        0
    }
}
