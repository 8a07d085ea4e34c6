//! Snapshot bundles for bootstrap and log compaction.
//!
//! A bundle maps each provider name to the commands that rebuild that
//! provider's slice of state from empty. Restoring is authoritative: every
//! provider first drops local entities the bundle does not name, then the
//! bundled commands are applied. Providers run in priority order so that
//! dependents (assignments, history) see their monitors already in place.
//! The whole restore runs on a copy that only replaces the live state when
//! every command succeeded.

use crate::command::Command;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use vigil_core::{IncidentId, MonitorId, ProviderId, StatusPageId};

use super::machine::{apply_command, ReplicatedState};

/// Ordered map from provider name to reconstruction commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotBundle {
    sections: BTreeMap<String, Vec<Command>>,
}

impl SnapshotBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the commands of one provider.
    pub fn insert(&mut self, provider: impl Into<String>, commands: Vec<Command>) {
        self.sections.insert(provider.into(), commands);
    }

    /// Commands of one provider.
    pub fn get(&self, provider: &str) -> Option<&[Command]> {
        self.sections.get(provider).map(Vec::as_slice)
    }

    /// Provider names in the bundle.
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// Total number of commands.
    pub fn command_count(&self) -> usize {
        self.sections.values().map(Vec::len).sum()
    }
}

/// One slice of replicated state that can be exported and reconciled.
pub trait SnapshotProvider: Send + Sync {
    /// Section name in the bundle.
    fn name(&self) -> &'static str;

    /// Lower runs first on restore.
    fn priority(&self) -> u8;

    /// Commands that rebuild this slice from empty.
    fn export(&self, state: &ReplicatedState) -> Vec<Command>;

    /// Drop local entities that `commands` does not name.
    fn reconcile(&self, state: &mut ReplicatedState, commands: &[Command]);
}

struct MonitorSection;
struct IncidentSection;
struct StatusPageSection;
struct NotifierSection;
struct AssignmentSection;
struct StatusHistorySection;
struct NotificationHistorySection;

impl SnapshotProvider for MonitorSection {
    fn name(&self) -> &'static str {
        "monitors"
    }

    fn priority(&self) -> u8 {
        0
    }

    fn export(&self, state: &ReplicatedState) -> Vec<Command> {
        state
            .monitors
            .values()
            .map(|monitor| Command::CreateMonitor {
                monitor: monitor.clone(),
            })
            .collect()
    }

    fn reconcile(&self, state: &mut ReplicatedState, commands: &[Command]) {
        let keep: BTreeSet<MonitorId> = commands
            .iter()
            .filter_map(|c| match c {
                Command::CreateMonitor { monitor } | Command::UpdateMonitor { monitor } => {
                    Some(monitor.id)
                }
                _ => None,
            })
            .collect();
        state.monitors.retain(|id, _| keep.contains(id));
    }
}

impl SnapshotProvider for IncidentSection {
    fn name(&self) -> &'static str {
        "incidents"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn export(&self, state: &ReplicatedState) -> Vec<Command> {
        state
            .incidents
            .values()
            .map(|incident| Command::CreateIncident {
                incident: incident.clone(),
            })
            .collect()
    }

    fn reconcile(&self, state: &mut ReplicatedState, commands: &[Command]) {
        let keep: BTreeSet<IncidentId> = commands
            .iter()
            .filter_map(|c| match c {
                Command::CreateIncident { incident } | Command::UpdateIncident { incident } => {
                    Some(incident.id)
                }
                _ => None,
            })
            .collect();
        state.incidents.retain(|id, _| keep.contains(id));
    }
}

impl SnapshotProvider for StatusPageSection {
    fn name(&self) -> &'static str {
        "status_pages"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn export(&self, state: &ReplicatedState) -> Vec<Command> {
        state
            .status_pages
            .values()
            .map(|page| Command::UpsertStatusPage { page: page.clone() })
            .collect()
    }

    fn reconcile(&self, state: &mut ReplicatedState, commands: &[Command]) {
        let keep: BTreeSet<StatusPageId> = commands
            .iter()
            .filter_map(|c| match c {
                Command::UpsertStatusPage { page } => Some(page.id),
                _ => None,
            })
            .collect();
        state.status_pages.retain(|id, _| keep.contains(id));
    }
}

impl SnapshotProvider for NotifierSection {
    fn name(&self) -> &'static str {
        "notification_providers"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn export(&self, state: &ReplicatedState) -> Vec<Command> {
        state
            .providers
            .values()
            .map(|provider| Command::UpsertNotificationProvider {
                provider: provider.clone(),
            })
            .collect()
    }

    fn reconcile(&self, state: &mut ReplicatedState, commands: &[Command]) {
        let keep: BTreeSet<ProviderId> = commands
            .iter()
            .filter_map(|c| match c {
                Command::UpsertNotificationProvider { provider } => Some(provider.id),
                _ => None,
            })
            .collect();
        state.providers.retain(|id, _| keep.contains(id));
    }
}

impl SnapshotProvider for AssignmentSection {
    fn name(&self) -> &'static str {
        "assignments"
    }

    fn priority(&self) -> u8 {
        2
    }

    fn export(&self, state: &ReplicatedState) -> Vec<Command> {
        if state.assignments.is_empty() {
            return Vec::new();
        }
        vec![Command::AssignTasks {
            assignments: state.assignments.values().cloned().collect(),
        }]
    }

    fn reconcile(&self, state: &mut ReplicatedState, _commands: &[Command]) {
        state.assignments.clear();
    }
}

impl SnapshotProvider for StatusHistorySection {
    fn name(&self) -> &'static str {
        "status_history"
    }

    fn priority(&self) -> u8 {
        3
    }

    fn export(&self, state: &ReplicatedState) -> Vec<Command> {
        state
            .timelines
            .iter()
            .map(|(monitor_id, timeline)| Command::RecordStatus {
                records: timeline.records(*monitor_id),
            })
            .collect()
    }

    fn reconcile(&self, state: &mut ReplicatedState, _commands: &[Command]) {
        state.timelines.clear();
    }
}

impl SnapshotProvider for NotificationHistorySection {
    fn name(&self) -> &'static str {
        "notification_history"
    }

    fn priority(&self) -> u8 {
        3
    }

    fn export(&self, state: &ReplicatedState) -> Vec<Command> {
        state
            .notifications
            .iter()
            .map(|record| Command::RecordNotification { record: *record })
            .collect()
    }

    fn reconcile(&self, state: &mut ReplicatedState, _commands: &[Command]) {
        state.notifications.clear();
    }
}

static PROVIDERS: [&dyn SnapshotProvider; 7] = [
    &MonitorSection,
    &IncidentSection,
    &StatusPageSection,
    &NotifierSection,
    &AssignmentSection,
    &StatusHistorySection,
    &NotificationHistorySection,
];

/// Registered providers in restore order.
pub fn providers() -> Vec<&'static dyn SnapshotProvider> {
    let mut ordered: Vec<&'static dyn SnapshotProvider> = PROVIDERS.to_vec();
    ordered.sort_by_key(|p| p.priority());
    ordered
}

/// Export the full replicated state as a bundle.
pub fn build(state: &ReplicatedState) -> SnapshotBundle {
    let mut bundle = SnapshotBundle::new();
    for provider in providers() {
        bundle.insert(provider.name(), provider.export(state));
    }
    bundle
}

/// Reconcile `state` against `bundle` and return the resulting state.
///
/// `state` itself is untouched; on error the caller keeps it as it was.
pub fn restore(state: &ReplicatedState, bundle: &SnapshotBundle) -> Result<ReplicatedState, String> {
    let registered = providers();
    if let Some(unknown) = bundle
        .providers()
        .find(|name| !registered.iter().any(|p| p.name() == *name))
    {
        return Err(format!("snapshot section '{}' is not recognised", unknown));
    }

    let mut next = state.clone();
    for provider in registered {
        let commands = bundle.get(provider.name()).unwrap_or(&[]);
        provider.reconcile(&mut next, commands);
        for command in commands {
            if matches!(command, Command::RestoreSnapshot { .. }) {
                return Err("nested snapshot restore".to_string());
            }
            let response = apply_command(&mut next, command.clone());
            if !response.success {
                return Err(format!(
                    "{} in section '{}' failed: {}",
                    command.name(),
                    provider.name(),
                    response.error.unwrap_or_default()
                ));
            }
        }
    }

    tracing::debug!(commands = bundle.command_count(), "snapshot bundle reconciled");
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{
        AssignmentId, Monitor, MonitorKind, MonitorStatus, StatusHistoryRecord, TaskAssignment,
    };

    fn monitor(name: &str) -> Monitor {
        Monitor::new(
            name,
            MonitorKind::Tcp {
                host: "127.0.0.1".to_string(),
                port: 22,
                degraded_after_ms: None,
            },
        )
    }

    fn populated() -> (ReplicatedState, Monitor) {
        let mut state = ReplicatedState::default();
        let m = monitor("ssh");
        state.apply(Command::CreateMonitor { monitor: m.clone() });
        state.apply(Command::AssignTasks {
            assignments: vec![TaskAssignment {
                id: AssignmentId::new(),
                decided_at_ms: 10,
                monitor_id: m.id,
                monitor_version: 1,
                workers: [1].into_iter().collect(),
            }],
        });
        state.apply(Command::RecordStatus {
            records: vec![StatusHistoryRecord {
                monitor_id: m.id,
                from_ms: 100,
                status: MonitorStatus::Available,
            }],
        });
        (state, m)
    }

    #[test]
    fn bundle_rebuilds_state_from_empty() {
        let (source, _) = populated();
        let bundle = build(&source);
        let rebuilt = restore(&ReplicatedState::default(), &bundle).unwrap();

        assert_eq!(rebuilt.monitors(), source.monitors());
        assert_eq!(rebuilt.assignments(), source.assignments());
        assert_eq!(rebuilt.timelines(), source.timelines());
    }

    #[test]
    fn entity_missing_from_bundle_is_deleted() {
        let (source, _) = populated();
        let bundle = build(&source);

        let mut local = source.clone();
        let stray = monitor("stray");
        local.apply(Command::CreateMonitor {
            monitor: stray.clone(),
        });

        let restored = restore(&local, &bundle).unwrap();
        assert!(restored.monitor(stray.id).is_none());
    }

    #[test]
    fn higher_version_in_bundle_overwrites_lower_locally() {
        let (mut source, m) = populated();
        let mut newer = m.clone();
        newer.version = 5;
        newer.interval_secs = 15;
        source.apply(Command::UpdateMonitor { monitor: newer });
        let bundle = build(&source);

        let mut local = ReplicatedState::default();
        local.apply(Command::CreateMonitor { monitor: m.clone() });
        let restored = restore(&local, &bundle).unwrap();
        assert_eq!(restored.monitor(m.id).map(|m| m.version), Some(5));
    }

    #[test]
    fn equal_or_lower_version_in_bundle_is_noop() {
        let (source, m) = populated();
        let bundle = build(&source);

        let mut local = ReplicatedState::default();
        let mut ahead = m.clone();
        ahead.version = 9;
        ahead.name = "ssh-local".to_string();
        local.apply(Command::CreateMonitor { monitor: ahead });

        let restored = restore(&local, &bundle).unwrap();
        let kept = restored.monitor(m.id).unwrap();
        assert_eq!(kept.version, 9);
        assert_eq!(kept.name, "ssh-local");
    }

    #[test]
    fn failing_bundle_leaves_state_untouched() {
        let (local, _) = populated();
        let mut bundle = build(&local);
        bundle.insert(
            "monitors",
            vec![Command::UpdateMonitor {
                monitor: monitor("never-created"),
            }],
        );

        let mut live = local.clone();
        let resp = live.apply(Command::RestoreSnapshot { bundle });
        assert!(!resp.success);
        assert_eq!(live, local);
    }

    #[test]
    fn unknown_section_is_rejected() {
        let mut bundle = SnapshotBundle::new();
        bundle.insert("pipelines", vec![]);
        assert!(restore(&ReplicatedState::default(), &bundle).is_err());
    }

    #[test]
    fn providers_run_dependencies_first() {
        let order: Vec<u8> = providers().iter().map(|p| p.priority()).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
        assert_eq!(providers()[0].name(), "monitors");
    }
}
