//! Monitor definitions.

use super::ids::MonitorId;
use super::Versioned;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Upper bound on confirmation retries per check.
pub const MAX_RETRIES: u32 = 10;

/// A monitored service and the rules used to check it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Monitor {
    /// Monitor identifier.
    pub id: MonitorId,
    /// Human-readable unique name.
    pub name: String,
    /// Configuration version; bumped on every update.
    pub version: u64,
    /// Disabled monitors are never assigned to workers.
    pub enabled: bool,
    /// Seconds between scheduled checks.
    pub interval_secs: u32,
    /// Per-attempt timeout in seconds.
    pub timeout_secs: u32,
    /// Additional confirmation attempts before reporting a downgrade.
    pub retries: u32,
    /// Seconds to wait between confirmation attempts.
    pub retry_interval_secs: u32,
    /// Number of distinct nodes that should check this monitor.
    pub worker_count: u32,
    /// Node tags this monitor prefers to run on.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Check-specific rules.
    pub kind: MonitorKind,
}

/// Check-specific rules, one variant per monitor family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorKind {
    /// HTTP(S) request check.
    Http {
        /// Target URL.
        url: String,
        /// Request method (GET, HEAD, POST...).
        #[serde(default = "default_method")]
        method: String,
        /// Accepted status codes; empty means any 2xx.
        #[serde(default)]
        expected_status: Vec<u16>,
        /// Body must contain this text when set.
        #[serde(default)]
        body_contains: Option<String>,
        /// Responses slower than this are reported as degraded.
        #[serde(default)]
        degraded_after_ms: Option<u64>,
    },
    /// TCP connect check.
    Tcp {
        /// Target host name or address.
        host: String,
        /// Target port.
        port: u16,
        /// Connects slower than this are reported as degraded.
        #[serde(default)]
        degraded_after_ms: Option<u64>,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

impl MonitorKind {
    /// Short name of the check family, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            MonitorKind::Http { .. } => "http",
            MonitorKind::Tcp { .. } => "tcp",
        }
    }

    /// Latency threshold above which a successful check is degraded.
    pub fn degraded_after(&self) -> Option<Duration> {
        match self {
            MonitorKind::Http {
                degraded_after_ms, ..
            }
            | MonitorKind::Tcp {
                degraded_after_ms, ..
            } => degraded_after_ms.map(Duration::from_millis),
        }
    }
}

impl Monitor {
    /// Create an enabled monitor with default cadence (60s, 1 retry, 1 worker).
    pub fn new(name: impl Into<String>, kind: MonitorKind) -> Self {
        Self {
            id: MonitorId::new(),
            name: name.into(),
            version: 1,
            enabled: true,
            interval_secs: 60,
            timeout_secs: 10,
            retries: 1,
            retry_interval_secs: 10,
            worker_count: 1,
            tags: BTreeSet::new(),
            kind,
        }
    }

    /// Interval between scheduled checks.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_secs))
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_secs.max(1)))
    }

    /// Delay between confirmation attempts.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.retry_interval_secs))
    }

    /// Structural validation, independent of other entities.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::missing("monitor", "name"));
        }
        if self.interval_secs == 0 {
            return Err(CoreError::out_of_range(
                "monitor",
                "interval_secs",
                "must be at least 1 second",
            ));
        }
        if self.worker_count == 0 {
            return Err(CoreError::out_of_range(
                "monitor",
                "worker_count",
                "must be at least 1",
            ));
        }
        if self.retries > MAX_RETRIES {
            return Err(CoreError::out_of_range(
                "monitor",
                "retries",
                format!("must be at most {}", MAX_RETRIES),
            ));
        }
        match &self.kind {
            MonitorKind::Http { url, .. } => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(CoreError::out_of_range(
                        "monitor",
                        "url",
                        format!("'{}' must start with http:// or https://", url),
                    ));
                }
            }
            MonitorKind::Tcp { host, port, .. } => {
                if host.trim().is_empty() {
                    return Err(CoreError::missing("monitor", "host"));
                }
                if *port == 0 {
                    return Err(CoreError::out_of_range("monitor", "port", "must be non-zero"));
                }
            }
        }
        Ok(())
    }
}

impl Versioned for Monitor {
    type Id = MonitorId;

    fn id(&self) -> MonitorId {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
