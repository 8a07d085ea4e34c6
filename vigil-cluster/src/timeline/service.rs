//! Status timeline service.
//!
//! Worker reports are folded into a pending buffer and flushed to the log as
//! `RecordStatus` commands on an interval, so one check does not cost one
//! consensus round. The latest reading stays queryable before it is flushed.

use crate::command::Command;
use crate::config::TimelineConfig;
use crate::raft::ClusterNode;
use crate::state::ReplicatedState;
use crate::worker::{ReportVerdict, ResultSink};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vigil_core::{Clock, MonitorId, MonitorStatus, StatusHistoryRecord, StatusReport};

/// Readings not yet replicated.
#[derive(Debug, Default)]
pub struct StatusBuffer {
    pending: BTreeMap<(MonitorId, u64), MonitorStatus>,
    latest: HashMap<MonitorId, (u64, MonitorStatus)>,
}

impl StatusBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a reading in. Returns whether it was queued for replication.
    ///
    /// A reading that repeats the latest status seen for the monitor is not
    /// queued; readings at the same instant keep the most severe status.
    pub fn record(&mut self, monitor_id: MonitorId, at_ms: u64, status: MonitorStatus) -> bool {
        match self.latest.get(&monitor_id).copied() {
            Some((latest_at, latest_status)) if at_ms > latest_at => {
                self.latest.insert(monitor_id, (at_ms, status));
                if latest_status == status {
                    return false;
                }
            }
            Some((latest_at, latest_status)) if at_ms == latest_at => {
                self.latest
                    .insert(monitor_id, (at_ms, latest_status.worst(status)));
            }
            Some(_) => {}
            None => {
                self.latest.insert(monitor_id, (at_ms, status));
            }
        }

        let slot = self.pending.entry((monitor_id, at_ms)).or_insert(status);
        *slot = slot.worst(status);
        true
    }

    /// Latest reading of a monitor.
    pub fn latest(&self, monitor_id: MonitorId) -> Option<(u64, MonitorStatus)> {
        self.latest.get(&monitor_id).copied()
    }

    /// Take every queued reading.
    pub fn drain(&mut self) -> Vec<StatusHistoryRecord> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|((monitor_id, from_ms), status)| StatusHistoryRecord {
                monitor_id,
                from_ms,
                status,
            })
            .collect()
    }

    /// Put back readings whose replication failed.
    pub fn requeue(&mut self, records: Vec<StatusHistoryRecord>) {
        for record in records {
            let slot = self
                .pending
                .entry((record.monitor_id, record.from_ms))
                .or_insert(record.status);
            *slot = slot.worst(record.status);
        }
    }

    /// Drop everything known about a monitor.
    pub fn forget(&mut self, monitor_id: MonitorId) {
        self.latest.remove(&monitor_id);
        self.pending.retain(|(id, _), _| *id != monitor_id);
    }

    /// Number of queued readings.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Whether `report` was produced under the latest assignment of its monitor.
pub fn classify(state: &ReplicatedState, report: &StatusReport) -> ReportVerdict {
    match state.assignment(report.monitor_id) {
        Some(latest)
            if latest.id == report.assignment_id && latest.monitor_version == report.monitor_version =>
        {
            ReportVerdict::Accepted
        }
        _ => ReportVerdict::Stale,
    }
}

/// Buffers worker results and replicates them.
pub struct TimelineService {
    node: Arc<ClusterNode>,
    clock: Arc<dyn Clock>,
    config: TimelineConfig,
    buffer: Mutex<StatusBuffer>,
}

impl TimelineService {
    /// Create the service for `node`.
    pub fn new(node: Arc<ClusterNode>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let config = node.config().timeline.clone();
        Arc::new(Self {
            node,
            clock,
            config,
            buffer: Mutex::new(StatusBuffer::new()),
        })
    }

    /// Accept a worker report, or flag it stale.
    pub fn ingest(&self, report: StatusReport) -> ReportVerdict {
        let verdict = self
            .node
            .state_machine()
            .read(|state| classify(state, &report));
        if verdict == ReportVerdict::Stale {
            tracing::debug!(
                monitor_id = %report.monitor_id,
                assignment_id = %report.assignment_id,
                "dropping report from superseded assignment"
            );
            return verdict;
        }

        self.buffer
            .lock()
            .record(report.monitor_id, report.timestamp_ms, report.status);
        verdict
    }

    /// Status of a monitor now, pending readings included.
    pub fn current_status(&self, monitor_id: MonitorId) -> MonitorStatus {
        let replicated = self.node.state_machine().read(|state| {
            state
                .timeline(monitor_id)
                .and_then(|timeline| timeline.latest())
        });
        let pending = self.buffer.lock().latest(monitor_id);
        match (pending, replicated) {
            (Some((p_at, p_status)), Some((r_at, _))) if p_at >= r_at => p_status,
            (_, Some((_, r_status))) => r_status,
            (Some((_, p_status)), None) => p_status,
            (None, None) => MonitorStatus::Unknown,
        }
    }

    /// Number of readings waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Replicate the pending readings. Returns how many were committed.
    ///
    /// Readings are put back when replication fails, to go out with the
    /// next flush.
    pub async fn flush(&self) -> usize {
        let records = self.buffer.lock().drain();
        if records.is_empty() {
            return 0;
        }

        let count = records.len();
        let command = Command::RecordStatus {
            records: records.clone(),
        };
        if self.node.replicate_and_commit(command).await {
            tracing::debug!(node_id = self.node.node_id(), records = count, "status flushed");
            count
        } else {
            self.buffer.lock().requeue(records);
            0
        }
    }

    /// Prune history older than the retention horizon. Leader only.
    ///
    /// The last record before the horizon is kept so the current status of
    /// every monitor survives.
    pub async fn sweep_retention(&self) -> bool {
        if !self.node.is_leader() {
            return false;
        }
        let now_ms = self.clock.now_ms();
        if now_ms <= self.config.retention_ms {
            return false;
        }
        let before_ms = now_ms - self.config.retention_ms;

        tracing::info!(node_id = self.node.node_id(), before_ms, "retention sweep");
        let status = self
            .node
            .replicate_and_commit(Command::PruneStatusHistory { before_ms })
            .await;
        let notifications = self
            .node
            .replicate_and_commit(Command::PruneNotificationHistory { before_ms })
            .await;
        status && notifications
    }

    /// Drop buffered readings of a deleted monitor.
    pub fn forget(&self, monitor_id: MonitorId) {
        self.buffer.lock().forget(monitor_id);
    }

    /// Run the flush and retention timers until `shutdown` flips.
    ///
    /// Pending readings are flushed one last time on the way out.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut flush =
                tokio::time::interval(Duration::from_millis(this.config.flush_interval_ms));
            flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut sweep = tokio::time::interval(Duration::from_millis(
                this.config.retention_sweep_interval_ms,
            ));
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = flush.tick() => {
                        this.flush().await;
                    }
                    _ = sweep.tick() => {
                        this.sweep_retention().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }

            let left = this.flush().await;
            tracing::debug!(node_id = this.node.node_id(), flushed = left, "timeline stopped");
        })
    }
}

impl ResultSink for TimelineService {
    fn report(&self, report: StatusReport) -> ReportVerdict {
        self.ingest(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use vigil_core::{AssignmentId, Monitor, MonitorKind, TaskAssignment};

    use MonitorStatus::{Available, Degraded, Unavailable};

    #[test]
    fn repeated_status_is_not_queued() {
        let mut buffer = StatusBuffer::new();
        let m = MonitorId::new();

        assert!(buffer.record(m, 100, Available));
        assert!(!buffer.record(m, 200, Available));
        assert!(buffer.record(m, 300, Unavailable));
        assert!(!buffer.record(m, 400, Unavailable));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.latest(m), Some((400, Unavailable)));
    }

    #[test]
    fn colliding_readings_keep_the_worst() {
        let mut buffer = StatusBuffer::new();
        let m = MonitorId::new();

        buffer.record(m, 100, Degraded);
        buffer.record(m, 100, Available);
        buffer.record(m, 100, Unavailable);

        let records = buffer.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Unavailable);
        assert_eq!(buffer.latest(m), Some((100, Unavailable)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn late_reading_is_still_queued() {
        let mut buffer = StatusBuffer::new();
        let m = MonitorId::new();

        buffer.record(m, 200, Available);
        assert!(buffer.record(m, 100, Unavailable));
        assert_eq!(buffer.latest(m), Some((200, Available)));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn requeue_merges_with_new_readings() {
        let mut buffer = StatusBuffer::new();
        let m = MonitorId::new();

        buffer.record(m, 100, Available);
        let taken = buffer.drain();
        buffer.record(m, 200, Unavailable);
        buffer.requeue(taken);

        let records = buffer.drain();
        assert_eq!(
            records.iter().map(|r| r.from_ms).collect::<Vec<_>>(),
            vec![100, 200]
        );
    }

    #[test]
    fn forget_drops_monitor() {
        let mut buffer = StatusBuffer::new();
        let (a, b) = (MonitorId::new(), MonitorId::new());
        buffer.record(a, 1, Available);
        buffer.record(b, 1, Available);

        buffer.forget(a);
        assert_eq!(buffer.len(), 1);
        assert!(buffer.latest(a).is_none());
    }

    #[test]
    fn reports_from_older_assignments_are_stale() {
        let mut state = ReplicatedState::default();
        let monitor = Monitor::new(
            "api",
            MonitorKind::Tcp {
                host: "localhost".into(),
                port: 80,
                degraded_after_ms: None,
            },
        );
        state.apply(Command::CreateMonitor {
            monitor: monitor.clone(),
        });

        let old = TaskAssignment {
            id: AssignmentId::new(),
            decided_at_ms: 10,
            monitor_id: monitor.id,
            monitor_version: 1,
            workers: BTreeSet::from([1]),
        };
        let new = TaskAssignment {
            id: AssignmentId::new(),
            decided_at_ms: 20,
            workers: BTreeSet::from([2]),
            ..old.clone()
        };
        state.apply(Command::AssignTasks {
            assignments: vec![old.clone()],
        });

        let report = |assignment: &TaskAssignment| StatusReport {
            monitor_id: monitor.id,
            monitor_version: 1,
            assignment_id: assignment.id,
            node_id: 1,
            timestamp_ms: 60_000,
            status: Available,
            latency_ms: Some(3),
            attempts: 1,
            message: None,
        };

        assert_eq!(classify(&state, &report(&old)), ReportVerdict::Accepted);

        state.apply(Command::AssignTasks {
            assignments: vec![new.clone()],
        });
        assert_eq!(classify(&state, &report(&old)), ReportVerdict::Stale);
        assert_eq!(classify(&state, &report(&new)), ReportVerdict::Accepted);

        state.apply(Command::DeleteMonitor {
            monitor_id: monitor.id,
        });
        assert_eq!(classify(&state, &report(&new)), ReportVerdict::Stale);
    }
}
