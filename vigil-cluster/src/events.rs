//! In-process cluster event bus.
//!
//! Subscribers each get their own receiver. Events are delivered
//! best-effort: a slow subscriber sees `RecvError::Lagged` and is expected
//! to resynchronise from replicated state.

use crate::command::Command;
use crate::types::ClusterNodeId;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber.
pub const EVENT_BUFFER: usize = 1024;

/// Something that happened in the cluster.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// The known leader changed.
    LeaderChanged {
        /// New leader, `None` while an election is running.
        leader: Option<ClusterNodeId>,
        /// Term of the change.
        term: u64,
    },
    /// A node entered the membership.
    MemberJoined {
        /// Joining node.
        node_id: ClusterNodeId,
        /// Its advertised address.
        addr: String,
    },
    /// A node left the membership.
    MemberLeft {
        /// Departed node.
        node_id: ClusterNodeId,
    },
    /// A member's liveness changed.
    MemberAvailabilityChanged {
        /// Member concerned.
        node_id: ClusterNodeId,
        /// New liveness.
        available: bool,
    },
    /// This node has applied everything committed when it started.
    ReplicationCaughtUp,
    /// A command was applied to the local state.
    CommandCommitted {
        /// Log index of the command.
        index: u64,
        /// The applied command.
        command: Arc<Command>,
        /// Whether it changed state.
        changed: bool,
    },
    /// Local state was replaced from a snapshot.
    SnapshotInstalled {
        /// Last log index covered by the snapshot.
        last_index: Option<u64>,
    },
}

/// Broadcast channel for [`ClusterEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: ClusterEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn every_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(ClusterEvent::MemberLeft { node_id: 3 });

        assert!(matches!(a.recv().await, Ok(ClusterEvent::MemberLeft { node_id: 3 })));
        assert!(matches!(b.recv().await, Ok(ClusterEvent::MemberLeft { node_id: 3 })));
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(ClusterEvent::ReplicationCaughtUp);
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        EventBus::default().publish(ClusterEvent::ReplicationCaughtUp);
    }
}
