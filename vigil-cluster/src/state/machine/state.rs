//! The replicated cluster state.

use crate::command::Command;
use crate::types::{ClusterLogId, ClusterStoredMembership};
use std::collections::{BTreeMap, BTreeSet};
use vigil_core::{
    Incident, IncidentId, Monitor, MonitorId, MonitorStatus, NotificationHistoryRecord,
    NotificationProvider, ProviderId, StatusHistoryRecord, StatusPage, StatusPageId,
    StatusTimeline, TaskAssignment,
};

use super::apply::apply_command;
use super::types::{ClusterResponse, RequestCache};

/// State every node derives by applying the same committed commands.
///
/// All collections are ordered maps so iteration (and therefore snapshot
/// output and placement input) is identical on every node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicatedState {
    pub(crate) monitors: BTreeMap<MonitorId, Monitor>,
    pub(crate) incidents: BTreeMap<IncidentId, Incident>,
    pub(crate) status_pages: BTreeMap<StatusPageId, StatusPage>,
    pub(crate) providers: BTreeMap<ProviderId, NotificationProvider>,
    /// Latest assignment per monitor.
    pub(crate) assignments: BTreeMap<MonitorId, TaskAssignment>,
    pub(crate) timelines: BTreeMap<MonitorId, StatusTimeline>,
    pub(crate) notifications: BTreeSet<NotificationHistoryRecord>,
    pub(crate) requests: RequestCache,
    pub(crate) last_applied_log: Option<ClusterLogId>,
    pub(crate) last_membership: ClusterStoredMembership,
}

impl ReplicatedState {
    /// Apply one command. Deterministic in (state, command).
    pub fn apply(&mut self, command: Command) -> ClusterResponse {
        apply_command(self, command)
    }

    /// All monitors by id.
    pub fn monitors(&self) -> &BTreeMap<MonitorId, Monitor> {
        &self.monitors
    }

    /// A single monitor.
    pub fn monitor(&self, id: MonitorId) -> Option<&Monitor> {
        self.monitors.get(&id)
    }

    /// All incidents by id.
    pub fn incidents(&self) -> &BTreeMap<IncidentId, Incident> {
        &self.incidents
    }

    /// All status pages by id.
    pub fn status_pages(&self) -> &BTreeMap<StatusPageId, StatusPage> {
        &self.status_pages
    }

    /// All notification providers by id.
    pub fn providers(&self) -> &BTreeMap<ProviderId, NotificationProvider> {
        &self.providers
    }

    /// Latest assignment per monitor.
    pub fn assignments(&self) -> &BTreeMap<MonitorId, TaskAssignment> {
        &self.assignments
    }

    /// Latest assignment for one monitor.
    pub fn assignment(&self, monitor_id: MonitorId) -> Option<&TaskAssignment> {
        self.assignments.get(&monitor_id)
    }

    /// Canonical status timeline of a monitor.
    pub fn timeline(&self, monitor_id: MonitorId) -> Option<&StatusTimeline> {
        self.timelines.get(&monitor_id)
    }

    /// All timelines by monitor.
    pub fn timelines(&self) -> &BTreeMap<MonitorId, StatusTimeline> {
        &self.timelines
    }

    /// Status history rows of a monitor in start order.
    pub fn status_history(&self, monitor_id: MonitorId) -> Vec<StatusHistoryRecord> {
        self.timelines
            .get(&monitor_id)
            .map(|t| t.records(monitor_id))
            .unwrap_or_default()
    }

    /// Replicated status of a monitor at `at_ms`.
    pub fn status_at(&self, monitor_id: MonitorId, at_ms: u64) -> MonitorStatus {
        self.timelines
            .get(&monitor_id)
            .map(|t| t.status_at(at_ms))
            .unwrap_or_default()
    }

    /// Dispatched notification markers.
    pub fn notifications(&self) -> &BTreeSet<NotificationHistoryRecord> {
        &self.notifications
    }

    /// Start of the most recent notified transition of a monitor.
    pub fn last_notified(&self, monitor_id: MonitorId) -> Option<u64> {
        self.notifications
            .iter()
            .filter(|r| r.monitor_id == monitor_id)
            .map(|r| r.status_from_ms)
            .max()
    }

    /// Whether a marker falls in `[from_ms, until_ms)` for the monitor.
    pub fn notified_between(&self, monitor_id: MonitorId, from_ms: u64, until_ms: u64) -> bool {
        if from_ms >= until_ms {
            return false;
        }
        let low = NotificationHistoryRecord {
            monitor_id,
            status_from_ms: from_ms,
        };
        let high = NotificationHistoryRecord {
            monitor_id,
            status_from_ms: until_ms,
        };
        self.notifications.range(low..high).next().is_some()
    }

    /// Last log id applied to this state.
    pub fn last_applied_log(&self) -> Option<ClusterLogId> {
        self.last_applied_log
    }

    /// Membership as of the last applied membership entry.
    pub fn last_membership(&self) -> &ClusterStoredMembership {
        &self.last_membership
    }

    /// Entity counts, for status output.
    pub fn summary(&self) -> StateSummary {
        StateSummary {
            monitors: self.monitors.len(),
            incidents: self.incidents.len(),
            status_pages: self.status_pages.len(),
            providers: self.providers.len(),
            assignments: self.assignments.len(),
            history_records: self.timelines.values().map(StatusTimeline::len).sum(),
        }
    }
}

/// Entity counts of a replicated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StateSummary {
    /// Number of monitors.
    pub monitors: usize,
    /// Number of incidents.
    pub incidents: usize,
    /// Number of status pages.
    pub status_pages: usize,
    /// Number of notification providers.
    pub providers: usize,
    /// Number of monitors with an assignment.
    pub assignments: usize,
    /// Total status history records.
    pub history_records: usize,
}
