//! Task assignments and worker status reports.

use super::ids::{AssignmentId, MonitorId, NodeId};
use super::status::MonitorStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A replicated decision naming the nodes that check a monitor.
///
/// Decisions for the same monitor are totally ordered by `decided_at_ms`.
/// A later decision supersedes an earlier one; entries are never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// Decision identifier.
    pub id: AssignmentId,
    /// When the leader took the decision (ms since epoch).
    pub decided_at_ms: u64,
    /// Monitor being assigned.
    pub monitor_id: MonitorId,
    /// Monitor version the decision was computed for.
    pub monitor_version: u64,
    /// Nodes that must run the checks. Empty means "nobody" (disabled monitor).
    pub workers: BTreeSet<NodeId>,
}

impl TaskAssignment {
    /// Whether `node` is one of the assigned workers.
    pub fn includes(&self, node: NodeId) -> bool {
        self.workers.contains(&node)
    }

    /// Whether this decision is strictly newer than `other`.
    pub fn is_newer_than(&self, other: &TaskAssignment) -> bool {
        self.decided_at_ms > other.decided_at_ms
    }

    /// Whether this decision is strictly older than `other`.
    pub fn is_older_than(&self, other: &TaskAssignment) -> bool {
        self.decided_at_ms < other.decided_at_ms
    }
}

/// One check outcome reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Monitor that was checked.
    pub monitor_id: MonitorId,
    /// Monitor version the worker ran.
    pub monitor_version: u64,
    /// Assignment under which the check ran.
    pub assignment_id: AssignmentId,
    /// Reporting node.
    pub node_id: NodeId,
    /// The scheduled instant of the check, not the instant confirmation ended.
    pub timestamp_ms: u64,
    /// Confirmed status.
    pub status: MonitorStatus,
    /// Latency of the last attempt, when measured.
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// Attempts made (first check plus confirmations).
    pub attempts: u32,
    /// Failure detail of the last attempt.
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(decided_at_ms: u64) -> TaskAssignment {
        TaskAssignment {
            id: AssignmentId::new(),
            decided_at_ms,
            monitor_id: MonitorId::from_u128(1),
            monitor_version: 1,
            workers: [1, 3].into_iter().collect(),
        }
    }

    #[test]
    fn ordering_by_decision_time() {
        let a = assignment(10);
        let b = assignment(20);
        assert!(b.is_newer_than(&a));
        assert!(a.is_older_than(&b));
        assert!(!a.is_older_than(&a.clone()));
        assert!(a.includes(3));
        assert!(!a.includes(2));
    }
}
