//! Command application logic.
//!
//! Every function here is a deterministic function of (state, command) and
//! either mutates nothing or completes its mutation. Versioned upserts apply
//! only when strictly newer; deleting an absent entity is a successful no-op.

use crate::command::Command;
use crate::state::snapshot;
use std::collections::BTreeMap;
use vigil_core::{
    MonitorId, NotificationHistoryRecord, StatusHistoryRecord, StatusTimeline, TaskAssignment,
    Versioned,
};

use super::state::ReplicatedState;
use super::types::ClusterResponse;

/// Apply a command to the replicated state.
pub fn apply_command(state: &mut ReplicatedState, cmd: Command) -> ClusterResponse {
    match cmd {
        Command::CreateMonitor { monitor } => upsert(&mut state.monitors, monitor),
        Command::UpdateMonitor { monitor } => update(&mut state.monitors, monitor, "Monitor"),
        Command::DeleteMonitor { monitor_id } => apply_delete_monitor(state, monitor_id),

        Command::CreateIncident { incident } => upsert(&mut state.incidents, incident),
        Command::UpdateIncident { incident } => update(&mut state.incidents, incident, "Incident"),
        Command::DeleteIncident { incident_id } => {
            ClusterResponse::ok_if(state.incidents.remove(&incident_id).is_some())
        }

        Command::UpsertStatusPage { page } => upsert(&mut state.status_pages, page),
        Command::DeleteStatusPage { page_id } => {
            ClusterResponse::ok_if(state.status_pages.remove(&page_id).is_some())
        }

        Command::UpsertNotificationProvider { provider } => upsert(&mut state.providers, provider),
        Command::DeleteNotificationProvider { provider_id } => {
            ClusterResponse::ok_if(state.providers.remove(&provider_id).is_some())
        }

        Command::AssignTasks { assignments } => apply_assign_tasks(state, assignments),
        Command::RecordStatus { records } => apply_record_status(state, records),
        Command::PruneStatusHistory { before_ms } => apply_prune_status(state, before_ms),
        Command::RecordNotification { record } => apply_record_notification(state, record),
        Command::PruneNotificationHistory { before_ms } => {
            apply_prune_notifications(state, before_ms)
        }

        Command::RestoreSnapshot { bundle } => match snapshot::restore(state, &bundle) {
            Ok(restored) => {
                *state = restored;
                ClusterResponse::ok()
            }
            Err(e) => ClusterResponse::err(e),
        },
    }
}

fn upsert<T>(map: &mut BTreeMap<T::Id, T>, item: T) -> ClusterResponse
where
    T: Versioned,
{
    if let Some(current) = map.get(&item.id()) {
        if !item.supersedes(current) {
            return ClusterResponse::unchanged();
        }
    }
    map.insert(item.id(), item);
    ClusterResponse::ok()
}

fn update<T>(map: &mut BTreeMap<T::Id, T>, item: T, kind: &str) -> ClusterResponse
where
    T: Versioned,
{
    if !map.contains_key(&item.id()) {
        return ClusterResponse::err(format!("{} {} not found", kind, item.id()));
    }
    upsert(map, item)
}

fn apply_delete_monitor(state: &mut ReplicatedState, monitor_id: MonitorId) -> ClusterResponse {
    if state.monitors.remove(&monitor_id).is_none() {
        return ClusterResponse::unchanged();
    }
    state.assignments.remove(&monitor_id);
    state.timelines.remove(&monitor_id);
    state.notifications.retain(|r| r.monitor_id != monitor_id);
    ClusterResponse::ok()
}

fn apply_assign_tasks(
    state: &mut ReplicatedState,
    assignments: Vec<TaskAssignment>,
) -> ClusterResponse {
    let mut changed = false;
    for assignment in assignments {
        if !state.monitors.contains_key(&assignment.monitor_id) {
            continue;
        }
        if let Some(current) = state.assignments.get(&assignment.monitor_id) {
            if assignment.is_older_than(current) || *current == assignment {
                continue;
            }
        }
        state.assignments.insert(assignment.monitor_id, assignment);
        changed = true;
    }
    ClusterResponse::ok_if(changed)
}

fn apply_record_status(
    state: &mut ReplicatedState,
    records: Vec<StatusHistoryRecord>,
) -> ClusterResponse {
    let mut changed = false;
    for record in records {
        if !state.monitors.contains_key(&record.monitor_id) {
            continue;
        }
        let timeline = state
            .timelines
            .entry(record.monitor_id)
            .or_insert_with(StatusTimeline::new);
        changed |= timeline.insert(record.from_ms, record.status);
    }
    state.timelines.retain(|_, t| !t.is_empty());
    ClusterResponse::ok_if(changed)
}

fn apply_prune_status(state: &mut ReplicatedState, before_ms: u64) -> ClusterResponse {
    let removed: usize = state
        .timelines
        .values_mut()
        .map(|t| t.prune_before(before_ms))
        .sum();
    ClusterResponse::ok_if(removed > 0)
}

fn apply_record_notification(
    state: &mut ReplicatedState,
    record: NotificationHistoryRecord,
) -> ClusterResponse {
    if !state.monitors.contains_key(&record.monitor_id) {
        return ClusterResponse::unchanged();
    }
    ClusterResponse::ok_if(state.notifications.insert(record))
}

fn apply_prune_notifications(state: &mut ReplicatedState, before_ms: u64) -> ClusterResponse {
    // The newest marker per monitor always survives, and so does every
    // marker of a status segment the timeline still holds.
    let mut newest: BTreeMap<MonitorId, u64> = BTreeMap::new();
    for record in &state.notifications {
        let slot = newest.entry(record.monitor_id).or_insert(record.status_from_ms);
        *slot = (*slot).max(record.status_from_ms);
    }
    let timelines = &state.timelines;
    let floor = |monitor_id: &MonitorId| {
        timelines
            .get(monitor_id)
            .and_then(|t| t.iter().next())
            .map_or(before_ms, |(first, _)| first.min(before_ms))
    };
    let before = state.notifications.len();
    state.notifications.retain(|r| {
        r.status_from_ms >= floor(&r.monitor_id)
            || newest.get(&r.monitor_id) == Some(&r.status_from_ms)
    });
    ClusterResponse::ok_if(state.notifications.len() != before)
}
