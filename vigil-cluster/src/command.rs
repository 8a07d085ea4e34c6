//! Cluster commands - operations that go through Raft consensus.
//!
//! These commands represent all state mutations that need to be replicated
//! across the cluster. Each command is serialized into the Raft log and
//! applied to all nodes' state machines in the same order.

use crate::state::{ReplicatedState, SnapshotBundle};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_core::{
    CoreError, Incident, IncidentId, Monitor, MonitorId, NotificationHistoryRecord,
    NotificationProvider, ProviderId, StatusHistoryRecord, StatusPage, StatusPageId,
    TaskAssignment,
};

/// Commands that are replicated through Raft consensus.
///
/// Every state mutation in the cluster goes through this enum. The set is
/// closed: the wire decoder rejects anything it does not name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Command {
    // ==================== Monitors ====================
    /// Register a new monitor.
    CreateMonitor {
        /// Monitor definition.
        monitor: Monitor,
    },

    /// Replace a monitor with a newer version.
    UpdateMonitor {
        /// Monitor definition; `version` must exceed the stored one.
        monitor: Monitor,
    },

    /// Remove a monitor and everything derived from it.
    DeleteMonitor {
        /// Monitor to remove.
        monitor_id: MonitorId,
    },

    // ==================== Incidents ====================
    /// Open an incident.
    CreateIncident {
        /// Incident definition.
        incident: Incident,
    },

    /// Replace an incident with a newer version.
    UpdateIncident {
        /// Incident definition.
        incident: Incident,
    },

    /// Remove an incident.
    DeleteIncident {
        /// Incident to remove.
        incident_id: IncidentId,
    },

    // ==================== Pages & providers ====================
    /// Create or update a status page.
    UpsertStatusPage {
        /// Page definition.
        page: StatusPage,
    },

    /// Remove a status page.
    DeleteStatusPage {
        /// Page to remove.
        page_id: StatusPageId,
    },

    /// Create or update a notification provider.
    UpsertNotificationProvider {
        /// Provider definition.
        provider: NotificationProvider,
    },

    /// Remove a notification provider.
    DeleteNotificationProvider {
        /// Provider to remove.
        provider_id: ProviderId,
    },

    // ==================== Coordination ====================
    /// Record assignment decisions taken by the leader.
    AssignTasks {
        /// One decision per monitor.
        assignments: Vec<TaskAssignment>,
    },

    // ==================== History ====================
    /// Fold flushed status readings into the history.
    RecordStatus {
        /// Readings to fold in.
        records: Vec<StatusHistoryRecord>,
    },

    /// Drop status history older than a horizon.
    PruneStatusHistory {
        /// Horizon (ms since epoch).
        before_ms: u64,
    },

    /// Mark a status transition as notified.
    RecordNotification {
        /// Transition that was notified.
        record: NotificationHistoryRecord,
    },

    /// Drop notification history older than a horizon.
    PruneNotificationHistory {
        /// Horizon (ms since epoch).
        before_ms: u64,
    },

    // ==================== Bootstrap ====================
    /// Replace local state with an authoritative bundle.
    RestoreSnapshot {
        /// Per-provider reconstruction commands.
        bundle: SnapshotBundle,
    },
}

impl Command {
    /// Get a human-readable name for this command type.
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateMonitor { .. } => "CreateMonitor",
            Command::UpdateMonitor { .. } => "UpdateMonitor",
            Command::DeleteMonitor { .. } => "DeleteMonitor",
            Command::CreateIncident { .. } => "CreateIncident",
            Command::UpdateIncident { .. } => "UpdateIncident",
            Command::DeleteIncident { .. } => "DeleteIncident",
            Command::UpsertStatusPage { .. } => "UpsertStatusPage",
            Command::DeleteStatusPage { .. } => "DeleteStatusPage",
            Command::UpsertNotificationProvider { .. } => "UpsertNotificationProvider",
            Command::DeleteNotificationProvider { .. } => "DeleteNotificationProvider",
            Command::AssignTasks { .. } => "AssignTasks",
            Command::RecordStatus { .. } => "RecordStatus",
            Command::PruneStatusHistory { .. } => "PruneStatusHistory",
            Command::RecordNotification { .. } => "RecordNotification",
            Command::PruneNotificationHistory { .. } => "PruneNotificationHistory",
            Command::RestoreSnapshot { .. } => "RestoreSnapshot",
        }
    }

    /// Get the monitor ID if this command targets a single monitor.
    pub fn monitor_id(&self) -> Option<MonitorId> {
        match self {
            Command::CreateMonitor { monitor } | Command::UpdateMonitor { monitor } => {
                Some(monitor.id)
            }
            Command::DeleteMonitor { monitor_id } => Some(*monitor_id),
            _ => None,
        }
    }

    /// Whether applying this command can change which monitors need workers.
    pub fn affects_assignments(&self) -> bool {
        matches!(
            self,
            Command::CreateMonitor { .. }
                | Command::UpdateMonitor { .. }
                | Command::DeleteMonitor { .. }
                | Command::RestoreSnapshot { .. }
        )
    }

    /// Structural validation against the current state.
    ///
    /// Runs before proposal; a command that fails here never enters the log.
    pub fn validate(&self, state: &ReplicatedState) -> Result<(), CoreError> {
        match self {
            Command::CreateMonitor { monitor } | Command::UpdateMonitor { monitor } => {
                monitor.validate()?;
                let clash = state
                    .monitors()
                    .values()
                    .any(|m| m.id != monitor.id && m.name.eq_ignore_ascii_case(&monitor.name));
                if clash {
                    return Err(CoreError::Duplicate {
                        entity: "monitor",
                        name: monitor.name.clone(),
                    });
                }
                Ok(())
            }
            Command::CreateIncident { incident } | Command::UpdateIncident { incident } => {
                incident.validate()
            }
            Command::UpsertStatusPage { page } => {
                page.validate()?;
                let clash = state
                    .status_pages()
                    .values()
                    .any(|p| p.id != page.id && p.slug == page.slug);
                if clash {
                    return Err(CoreError::Duplicate {
                        entity: "status_page",
                        name: page.slug.clone(),
                    });
                }
                Ok(())
            }
            Command::UpsertNotificationProvider { provider } => provider.validate(),
            Command::AssignTasks { assignments } => {
                if assignments.is_empty() {
                    return Err(CoreError::missing("assign_tasks", "assignments"));
                }
                Ok(())
            }
            Command::RecordStatus { records } => {
                if records.is_empty() {
                    return Err(CoreError::missing("record_status", "records"));
                }
                Ok(())
            }
            Command::DeleteMonitor { .. }
            | Command::DeleteIncident { .. }
            | Command::DeleteStatusPage { .. }
            | Command::DeleteNotificationProvider { .. }
            | Command::PruneStatusHistory { .. }
            | Command::RecordNotification { .. }
            | Command::PruneNotificationHistory { .. }
            | Command::RestoreSnapshot { .. } => Ok(()),
        }
    }
}

/// A command as it is stored in the Raft log.
///
/// `request_id` makes a proposal idempotent across retries: the state machine
/// answers a replayed id from its cache instead of applying it twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRequest {
    /// Caller-supplied idempotency key.
    #[serde(default)]
    pub request_id: Option<Uuid>,
    /// The command to apply.
    pub command: Command,
}

impl ClusterRequest {
    /// Wrap a command without an idempotency key.
    pub fn new(command: Command) -> Self {
        Self {
            request_id: None,
            command,
        }
    }

    /// Wrap a command with an idempotency key.
    pub fn idempotent(request_id: Uuid, command: Command) -> Self {
        Self {
            request_id: Some(request_id),
            command,
        }
    }
}

impl std::fmt::Display for ClusterRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.request_id {
            Some(id) => write!(f, "{}({})", self.command.name(), id),
            None => write!(f, "{}", self.command.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::MonitorKind;

    fn tcp(name: &str) -> Monitor {
        Monitor::new(
            name,
            MonitorKind::Tcp {
                host: "127.0.0.1".to_string(),
                port: 80,
                degraded_after_ms: None,
            },
        )
    }

    #[test]
    fn duplicate_monitor_name_is_rejected() {
        let mut state = ReplicatedState::default();
        let existing = tcp("api");
        state.apply(Command::CreateMonitor {
            monitor: existing.clone(),
        });

        let err = Command::CreateMonitor { monitor: tcp("API") }
            .validate(&state)
            .unwrap_err();
        assert!(matches!(err, CoreError::Duplicate { entity: "monitor", .. }));

        // Updating the same monitor keeps its own name.
        let mut updated = existing;
        updated.version += 1;
        assert!(Command::UpdateMonitor { monitor: updated }
            .validate(&state)
            .is_ok());
    }

    #[test]
    fn zero_interval_fails_before_proposal() {
        let mut monitor = tcp("db");
        monitor.interval_secs = 0;
        assert!(Command::CreateMonitor { monitor }
            .validate(&ReplicatedState::default())
            .is_err());
    }

    #[test]
    fn wire_form_is_type_tagged() {
        let cmd = Command::PruneStatusHistory { before_ms: 42 };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "PruneStatusHistory");
        assert_eq!(json["value"]["before_ms"], 42);

        let unknown = serde_json::json!({"type": "DropDatabase", "value": {}});
        assert!(serde_json::from_value::<Command>(unknown).is_err());
    }
}
