//! Core domain types for vigil.

mod assignment;
mod entities;
mod history;
mod ids;
mod monitor;
mod status;

pub use assignment::{StatusReport, TaskAssignment};
pub use entities::{
    Incident, IncidentStatus, NotificationProvider, ProviderKind, StatusPage,
};
pub use history::{NotificationHistoryRecord, StatusHistoryRecord};
pub use ids::{AssignmentId, IncidentId, MonitorId, NodeId, ProviderId, StatusPageId};
pub use monitor::{Monitor, MonitorKind};
pub use status::MonitorStatus;

/// Entities replicated with a monotonically increasing version.
///
/// Upserts only take effect when the incoming version is strictly newer than
/// the stored one, which makes replays and snapshot reconciliation idempotent.
pub trait Versioned {
    /// Identifier type of the entity.
    type Id: Copy + Ord + std::fmt::Display;

    /// The entity's identifier.
    fn id(&self) -> Self::Id;

    /// The entity's version.
    fn version(&self) -> u64;

    /// Whether `self` should replace `current`.
    fn supersedes(&self, current: &Self) -> bool {
        self.version() > current.version()
    }
}
