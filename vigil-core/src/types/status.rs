//! Monitor status values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Observed status of a monitored service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MonitorStatus {
    /// No reading yet, or the reading could not be interpreted.
    #[default]
    Unknown,
    /// The service answered within its rules.
    Available,
    /// The service answered but outside its performance rules.
    Degraded,
    /// The service did not answer, or answered with a failure.
    Unavailable,
}

impl MonitorStatus {
    /// Relative severity used to merge colliding readings.
    ///
    /// `Unavailable > Degraded > Available > Unknown`.
    pub fn severity(self) -> u8 {
        match self {
            MonitorStatus::Unknown => 0,
            MonitorStatus::Available => 1,
            MonitorStatus::Degraded => 2,
            MonitorStatus::Unavailable => 3,
        }
    }

    /// The more severe of two statuses.
    pub fn worst(self, other: MonitorStatus) -> MonitorStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Whether the service is considered up (`Available` or `Degraded`).
    pub fn is_up(self) -> bool {
        matches!(self, MonitorStatus::Available | MonitorStatus::Degraded)
    }
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorStatus::Unknown => "unknown",
            MonitorStatus::Available => "available",
            MonitorStatus::Degraded => "degraded",
            MonitorStatus::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_prefers_unavailable() {
        assert_eq!(
            MonitorStatus::Available.worst(MonitorStatus::Unavailable),
            MonitorStatus::Unavailable
        );
        assert_eq!(
            MonitorStatus::Degraded.worst(MonitorStatus::Available),
            MonitorStatus::Degraded
        );
        assert_eq!(
            MonitorStatus::Unknown.worst(MonitorStatus::Available),
            MonitorStatus::Available
        );
    }
}
