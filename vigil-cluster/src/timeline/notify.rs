//! Notification dispatch.
//!
//! The leader walks each monitor's status transitions that have no marker
//! yet, hands them to a [`Notifier`] for every subscribed provider, and
//! replicates a `RecordNotification` marker. The marker is
//! what keeps a new leader from sending the same alert again after a
//! failover.

use crate::command::Command;
use crate::events::ClusterEvent;
use crate::raft::ClusterNode;
use crate::state::ReplicatedState;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use vigil_core::{
    MonitorId, MonitorStatus, NotificationHistoryRecord, NotificationProvider, ProviderKind,
};

/// Future returned by [`Notifier::notify`].
pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;

/// Notification failures.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The provider did not accept the notification.
    #[error("delivery to {provider} failed: {message}")]
    Delivery {
        /// Provider name.
        provider: String,
        /// Failure detail.
        message: String,
    },

    /// The dispatch marker could not be replicated.
    #[error("notification marker for {0} not committed")]
    NotRecorded(MonitorId),
}

/// A status transition worth telling someone about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    /// Monitor concerned.
    pub monitor_id: MonitorId,
    /// Its display name.
    pub monitor_name: String,
    /// Status before the transition.
    pub previous: MonitorStatus,
    /// Status after the transition.
    pub status: MonitorStatus,
    /// Start of the new status (ms since epoch).
    pub at_ms: u64,
}

/// Delivers notifications to external providers.
pub trait Notifier: Send + Sync {
    /// Whether this notifier can deliver through `provider`.
    fn supports(&self, _provider: &NotificationProvider) -> bool {
        true
    }

    /// Deliver one change through one provider.
    fn notify<'a>(
        &'a self,
        provider: &'a NotificationProvider,
        change: &'a StatusChange,
    ) -> NotifyFuture<'a>;
}

/// Posts changes as JSON to webhook providers.
#[derive(Debug, Clone, Default)]
pub struct WebhookNotifier {
    http: reqwest::Client,
}

impl WebhookNotifier {
    /// Create a notifier with its own connection pool.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Notifier for WebhookNotifier {
    fn supports(&self, provider: &NotificationProvider) -> bool {
        matches!(provider.kind, ProviderKind::Webhook { .. })
    }

    fn notify<'a>(
        &'a self,
        provider: &'a NotificationProvider,
        change: &'a StatusChange,
    ) -> NotifyFuture<'a> {
        Box::pin(async move {
            let ProviderKind::Webhook { url } = &provider.kind else {
                return Ok(());
            };
            let failed = |message: String| NotifyError::Delivery {
                provider: provider.name.clone(),
                message,
            };
            let response = self
                .http
                .post(url)
                .timeout(Duration::from_secs(10))
                .json(change)
                .send()
                .await
                .map_err(|e| failed(e.to_string()))?;
            if !response.status().is_success() {
                return Err(failed(format!("status {}", response.status())));
            }
            Ok(())
        })
    }
}

/// Transitions not yet notified, oldest first.
///
/// Every status segment is notified at most once: a transition is pending
/// while no marker falls inside its segment. A record that arrives late and
/// lands before already-notified transitions is therefore still reported,
/// unless it only moves the start of a segment that was already notified.
/// A first reading is only reported when it is bad news.
pub fn pending_changes(state: &ReplicatedState) -> Vec<StatusChange> {
    let mut changes = Vec::new();
    for (monitor_id, timeline) in state.timelines() {
        let Some(monitor) = state.monitor(*monitor_id) else {
            continue;
        };

        let transitions = timeline.transitions();
        let mut previous = MonitorStatus::Unknown;
        for (i, &(at_ms, status)) in transitions.iter().enumerate() {
            let until_ms = transitions.get(i + 1).map_or(u64::MAX, |(next, _)| *next);
            let notified = state.notified_between(*monitor_id, at_ms, until_ms);
            let worth_it = previous != MonitorStatus::Unknown || !status.is_up();
            if !notified && worth_it && status != MonitorStatus::Unknown {
                changes.push(StatusChange {
                    monitor_id: *monitor_id,
                    monitor_name: monitor.name.clone(),
                    previous,
                    status,
                    at_ms,
                });
            }
            previous = status;
        }
    }
    changes.sort_by_key(|c| c.at_ms);
    changes
}

/// Leader-side notification loop.
pub struct NotificationDispatcher {
    node: Arc<ClusterNode>,
    notifier: Arc<dyn Notifier>,
    retry: Duration,
}

impl NotificationDispatcher {
    /// Create a dispatcher for `node`.
    pub fn new(node: Arc<ClusterNode>, notifier: Arc<dyn Notifier>) -> Arc<Self> {
        let retry = Duration::from_millis(node.config().timeline.notification_retry_ms);
        Arc::new(Self {
            node,
            notifier,
            retry,
        })
    }

    /// Notify every pending change. Followers do nothing.
    ///
    /// Stops at the first failure; changes already marked are not resent.
    pub async fn run_pass(&self) -> Result<usize, NotifyError> {
        if !self.node.is_leader() {
            return Ok(0);
        }
        let (changes, providers) = self.node.state_machine().read(|state| {
            (
                pending_changes(state),
                state.providers().values().cloned().collect::<Vec<_>>(),
            )
        });

        let mut sent = 0;
        for change in changes {
            for provider in providers.iter().filter(|p| p.covers(change.monitor_id)) {
                if !self.notifier.supports(provider) {
                    tracing::debug!(provider = %provider.name, "no delivery channel for provider");
                    continue;
                }
                self.notifier.notify(provider, &change).await?;
                sent += 1;
            }

            let record = NotificationHistoryRecord {
                monitor_id: change.monitor_id,
                status_from_ms: change.at_ms,
            };
            if !self
                .node
                .replicate_and_commit(Command::RecordNotification { record })
                .await
            {
                return Err(NotifyError::NotRecorded(change.monitor_id));
            }
            tracing::info!(
                monitor_id = %change.monitor_id,
                status = %change.status,
                previous = %change.previous,
                "status change notified"
            );
        }
        Ok(sent)
    }

    /// Run passes on new status records and leadership, until `shutdown`.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut events = this.node.subscribe();
        let node_id = this.node.node_id();
        tokio::spawn(async move {
            let mut retry_at: Option<Instant> = None;
            loop {
                let deadline = retry_at;
                let retry = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ClusterEvent::CommandCommitted { command, changed: true, .. })
                            if matches!(command.as_ref(), Command::RecordStatus { .. }) => {}
                        Ok(ClusterEvent::LeaderChanged { leader: Some(leader), .. })
                            if leader == node_id => {}
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                    _ = retry => retry_at = None,
                    _ = shutdown.changed() => break,
                }
                if retry_at.is_some() {
                    continue;
                }

                if let Err(e) = this.run_pass().await {
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = this.retry.as_millis() as u64,
                        "notification pass aborted"
                    );
                    retry_at = Some(Instant::now() + this.retry);
                }
            }
            tracing::debug!(node_id, "notification dispatcher stopped");
        })
    }
}
