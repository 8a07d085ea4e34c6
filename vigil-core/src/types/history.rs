//! History records persisted by the status timeline.

use super::ids::MonitorId;
use super::status::MonitorStatus;
use serde::{Deserialize, Serialize};

/// The status that began holding for a monitor at `from_ms`.
///
/// The record's end is implicit: the `from_ms` of the next record, or "now"
/// when there is none. At most one record exists per `(monitor_id, from_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryRecord {
    /// Monitor the record belongs to.
    pub monitor_id: MonitorId,
    /// Start of the status interval (ms since epoch).
    pub from_ms: u64,
    /// Status in effect from `from_ms`.
    pub status: MonitorStatus,
}

/// Marks that the notification for a status transition was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationHistoryRecord {
    /// Monitor the transition belongs to.
    pub monitor_id: MonitorId,
    /// `from_ms` of the status record that triggered the notification.
    pub status_from_ms: u64,
}
