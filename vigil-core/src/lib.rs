//! Vigil Core Library
//!
//! Foundational types for the vigil uptime-monitoring cluster.
//!
//! # Overview
//!
//! Vigil is a horizontally replicated status-page and uptime-monitoring
//! platform. A cluster of equal peers shares one replicated configuration
//! (monitors, incidents, status pages, notification providers) and splits
//! the work of checking every monitored service between themselves.
//!
//! This crate holds everything that does not need a network or a consensus
//! log:
//!
//! - **Types**: identifiers, monitor definitions, incidents, status pages,
//!   notification providers, task assignments and status reports
//! - **Timeline**: the segment math that turns status history records into
//!   continuous availability intervals
//! - **Clock**: wall-clock abstraction so schedulers can be tested with
//!   paused time
//! - **Auth**: shared cluster-key hashing and verification
//!
//! # Example
//!
//! ```
//! use vigil_core::timeline::StatusTimeline;
//! use vigil_core::MonitorStatus;
//!
//! let mut timeline = StatusTimeline::new();
//! timeline.insert(1_000, MonitorStatus::Available);
//! timeline.insert(2_000, MonitorStatus::Degraded);
//! timeline.insert(3_000, MonitorStatus::Available);
//!
//! assert_eq!(timeline.status_at(2_500), MonitorStatus::Degraded);
//! assert_eq!(timeline.status_at(9_000), MonitorStatus::Available);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod clock;
pub mod error;
pub mod timeline;
pub mod types;

pub use auth::ClusterKey;
pub use clock::{Clock, OffsetClock, SystemClock};
pub use error::{CoreError, Result};
pub use timeline::{StatusSegment, StatusTimeline};
pub use types::{
    AssignmentId, Incident, IncidentId, IncidentStatus, Monitor, MonitorId, MonitorKind,
    MonitorStatus, NodeId, NotificationHistoryRecord, NotificationProvider, ProviderId,
    ProviderKind, StatusHistoryRecord, StatusPage, StatusPageId, StatusReport, TaskAssignment,
    Versioned,
};
