//! Incidents, status pages and notification providers.
//!
//! These are plain replicated configuration; the coordination core only
//! needs to version, snapshot and reconcile them.

use super::ids::{IncidentId, MonitorId, ProviderId, StatusPageId};
use super::Versioned;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentStatus {
    /// Impact known, cause unknown.
    Investigating,
    /// Cause identified.
    Identified,
    /// Fix deployed, watching.
    Monitoring,
    /// Closed.
    Resolved,
}

/// A published incident affecting one or more monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    /// Incident identifier.
    pub id: IncidentId,
    /// Short title.
    pub title: String,
    /// Free-form description.
    #[serde(default)]
    pub body: String,
    /// Current lifecycle state.
    pub status: IncidentStatus,
    /// Monitors affected by the incident.
    #[serde(default)]
    pub monitor_ids: BTreeSet<MonitorId>,
    /// Configuration version.
    pub version: u64,
    /// When the incident started (ms since epoch).
    pub started_at_ms: u64,
    /// When it was resolved, if it was.
    #[serde(default)]
    pub resolved_at_ms: Option<u64>,
}

impl Incident {
    /// Structural validation.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(CoreError::missing("incident", "title"));
        }
        if let Some(resolved) = self.resolved_at_ms {
            if resolved < self.started_at_ms {
                return Err(CoreError::out_of_range(
                    "incident",
                    "resolved_at_ms",
                    "must not precede started_at_ms",
                ));
            }
        }
        Ok(())
    }
}

impl Versioned for Incident {
    type Id = IncidentId;

    fn id(&self) -> IncidentId {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// A public status page listing a set of monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPage {
    /// Page identifier.
    pub id: StatusPageId,
    /// URL slug; unique across pages.
    pub slug: String,
    /// Display title.
    pub title: String,
    /// Monitors shown on the page, in display order.
    #[serde(default)]
    pub monitor_ids: Vec<MonitorId>,
    /// Configuration version.
    pub version: u64,
}

impl StatusPage {
    /// Structural validation.
    pub fn validate(&self) -> Result<()> {
        if self.slug.trim().is_empty() {
            return Err(CoreError::missing("status_page", "slug"));
        }
        if !self
            .slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::out_of_range(
                "status_page",
                "slug",
                "only ASCII letters, digits, '-' and '_' are allowed",
            ));
        }
        if self.title.trim().is_empty() {
            return Err(CoreError::missing("status_page", "title"));
        }
        Ok(())
    }
}

impl Versioned for StatusPage {
    type Id = StatusPageId;

    fn id(&self) -> StatusPageId {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Delivery channel of a notification provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderKind {
    /// JSON POST to a URL.
    Webhook {
        /// Target URL.
        url: String,
    },
    /// E-mail to an address.
    Email {
        /// Recipient address.
        address: String,
    },
}

/// A configured notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationProvider {
    /// Provider identifier.
    pub id: ProviderId,
    /// Display name.
    pub name: String,
    /// Disabled providers are skipped.
    pub enabled: bool,
    /// Delivery channel.
    pub kind: ProviderKind,
    /// Monitors this provider is subscribed to; empty means every monitor.
    #[serde(default)]
    pub monitor_ids: BTreeSet<MonitorId>,
    /// Configuration version.
    pub version: u64,
}

impl NotificationProvider {
    /// Whether this provider should be notified about `monitor_id`.
    pub fn covers(&self, monitor_id: MonitorId) -> bool {
        self.enabled && (self.monitor_ids.is_empty() || self.monitor_ids.contains(&monitor_id))
    }

    /// Structural validation.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::missing("notification_provider", "name"));
        }
        match &self.kind {
            ProviderKind::Webhook { url } if url.trim().is_empty() => {
                Err(CoreError::missing("notification_provider", "url"))
            }
            ProviderKind::Email { address } if !address.contains('@') => Err(
                CoreError::out_of_range("notification_provider", "address", "not an e-mail address"),
            ),
            _ => Ok(()),
        }
    }
}

impl Versioned for NotificationProvider {
    type Id = ProviderId;

    fn id(&self) -> ProviderId {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_with_empty_subscription_covers_everything() {
        let provider = NotificationProvider {
            id: ProviderId::new(),
            name: "ops".to_string(),
            enabled: true,
            kind: ProviderKind::Webhook {
                url: "https://hooks.example.com/ops".to_string(),
            },
            monitor_ids: BTreeSet::new(),
            version: 1,
        };
        assert!(provider.covers(MonitorId::new()));

        let disabled = NotificationProvider {
            enabled: false,
            ..provider
        };
        assert!(!disabled.covers(MonitorId::new()));
    }

    #[test]
    fn status_page_slug_rules() {
        let mut page = StatusPage {
            id: StatusPageId::new(),
            slug: "public-api".to_string(),
            title: "Public API".to_string(),
            monitor_ids: vec![],
            version: 1,
        };
        assert!(page.validate().is_ok());

        page.slug = "has space".to_string();
        assert!(page.validate().is_err());
    }

    #[test]
    fn incident_cannot_resolve_before_start() {
        let incident = Incident {
            id: IncidentId::new(),
            title: "Elevated errors".to_string(),
            body: String::new(),
            status: IncidentStatus::Resolved,
            monitor_ids: BTreeSet::new(),
            version: 1,
            started_at_ms: 2_000,
            resolved_at_ms: Some(1_000),
        };
        assert!(incident.validate().is_err());
    }
}
