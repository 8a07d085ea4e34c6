//! Cluster membership view and liveness probing.
//!
//! The replicated part of a member (id, endpoint, tags) lives in the Raft
//! membership configuration. Everything else on [`Member`] is local: each
//! node probes its peers and derives availability and load itself.
//!
//! Readers get an `Arc<Vec<Member>>` that is replaced wholesale on every
//! change, so a caller iterating members never observes a half-updated list.

use crate::config::MembershipConfig;
use crate::events::ClusterEvent;
use crate::network::{MessageType, ProbeReply, ProbeRequest, RPC_PATH};
use crate::raft::ClusterNode;
use crate::types::{ClusterMetrics, ClusterNodeId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vigil_core::Clock;

/// A cluster member as seen from the local node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Stable node id.
    pub node_id: ClusterNodeId,
    /// Public endpoint.
    pub addr: String,
    /// Assignment affinity labels.
    pub tags: BTreeSet<String>,
    /// Whether recent probes succeeded.
    pub available: bool,
    /// Last reported load average.
    pub load: f64,
    /// Whether this member is the current leader.
    pub is_leader: bool,
    /// Whether this member is the local node.
    pub is_local: bool,
    /// Whether this member votes.
    pub voter: bool,
}

#[derive(Debug, Clone, Copy)]
struct Liveness {
    failures: u32,
    load: f64,
    available: bool,
    /// Last successful probe, ms since epoch.
    last_seen_ms: u64,
}

/// Changes found by [`MembershipView::refresh`].
#[derive(Debug, Default, PartialEq)]
pub struct MembershipDelta {
    /// Members that appeared, with their endpoints.
    pub joined: Vec<(ClusterNodeId, String)>,
    /// Members that disappeared.
    pub left: Vec<ClusterNodeId>,
}

impl MembershipDelta {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Local, copy-on-write view of the membership.
#[derive(Debug)]
pub struct MembershipView {
    local_id: ClusterNodeId,
    members: RwLock<Arc<Vec<Member>>>,
    liveness: Mutex<HashMap<ClusterNodeId, Liveness>>,
    operational: AtomicBool,
    joining: AtomicBool,
    catch_up_target: Mutex<Option<u64>>,
}

impl MembershipView {
    /// Empty view for the local node.
    pub fn new(local_id: ClusterNodeId) -> Self {
        Self {
            local_id,
            members: RwLock::new(Arc::new(Vec::new())),
            liveness: Mutex::new(HashMap::new()),
            operational: AtomicBool::new(false),
            joining: AtomicBool::new(false),
            catch_up_target: Mutex::new(None),
        }
    }

    /// Current members, ordered by id.
    pub fn members(&self) -> Arc<Vec<Member>> {
        Arc::clone(&self.members.read())
    }

    /// One member.
    pub fn member(&self, node_id: ClusterNodeId) -> Option<Member> {
        self.members
            .read()
            .iter()
            .find(|m| m.node_id == node_id)
            .cloned()
    }

    /// Endpoint of a member.
    pub fn addr_of(&self, node_id: ClusterNodeId) -> Option<String> {
        self.member(node_id)
            .map(|m| m.addr)
            .filter(|addr| !addr.is_empty())
    }

    /// Rebuild the view from Raft metrics and report who came and went.
    pub fn refresh(&self, metrics: &ClusterMetrics) -> MembershipDelta {
        let leader = metrics.current_leader;
        let membership = metrics.membership_config.membership();
        let voters: BTreeSet<ClusterNodeId> = membership.voter_ids().collect();

        let liveness = self.liveness.lock();
        let next: Vec<Member> = membership
            .nodes()
            .map(|(id, node)| {
                let is_local = *id == self.local_id;
                let live = liveness.get(id);
                Member {
                    node_id: *id,
                    addr: node.addr.clone(),
                    tags: node.tags.clone(),
                    available: is_local || live.map_or(true, |l| l.available),
                    load: if is_local {
                        local_load()
                    } else {
                        live.map_or(0.0, |l| l.load)
                    },
                    is_leader: leader == Some(*id),
                    is_local,
                    voter: voters.contains(id),
                }
            })
            .collect();
        drop(liveness);

        let mut current = self.members.write();
        let before: BTreeSet<ClusterNodeId> = current.iter().map(|m| m.node_id).collect();
        let after: BTreeSet<ClusterNodeId> = next.iter().map(|m| m.node_id).collect();
        let delta = MembershipDelta {
            joined: next
                .iter()
                .filter(|m| !before.contains(&m.node_id))
                .map(|m| (m.node_id, m.addr.clone()))
                .collect(),
            left: before.difference(&after).copied().collect(),
        };

        if delta.is_empty() && **current == next {
            return delta;
        }
        *current = Arc::new(next);
        drop(current);

        if !delta.left.is_empty() {
            let mut liveness = self.liveness.lock();
            for id in &delta.left {
                liveness.remove(id);
            }
        }
        delta
    }

    /// Fold a probe outcome in. Returns the new availability when it flipped.
    pub fn record_probe(
        &self,
        node_id: ClusterNodeId,
        outcome: Option<f64>,
        now_ms: u64,
        failures_before_unavailable: u32,
    ) -> Option<bool> {
        let flipped = {
            let mut liveness = self.liveness.lock();
            let entry = liveness.entry(node_id).or_insert(Liveness {
                failures: 0,
                load: 0.0,
                available: true,
                last_seen_ms: now_ms,
            });
            let was = entry.available;
            match outcome {
                Some(load) => {
                    entry.failures = 0;
                    entry.load = load;
                    entry.available = true;
                    entry.last_seen_ms = now_ms;
                }
                None => {
                    entry.failures = entry.failures.saturating_add(1);
                    if entry.failures >= failures_before_unavailable {
                        entry.available = false;
                    }
                }
            }
            (was != entry.available).then_some(entry.available)
        };

        let mut current = self.members.write();
        if current.iter().any(|m| m.node_id == node_id) {
            let mut next = (**current).clone();
            for member in next.iter_mut().filter(|m| m.node_id == node_id) {
                if let Some(load) = outcome {
                    member.load = load;
                }
                if let Some(available) = flipped {
                    member.available = available;
                }
            }
            *current = Arc::new(next);
        }
        flipped
    }

    /// How long a member has gone without answering a probe.
    pub fn unreachable_for(&self, node_id: ClusterNodeId, now_ms: u64) -> Option<Duration> {
        self.liveness
            .lock()
            .get(&node_id)
            .filter(|l| !l.available)
            .map(|l| Duration::from_millis(now_ms.saturating_sub(l.last_seen_ms)))
    }

    /// Whether the local node has caught up and may run work.
    pub fn is_operational(&self) -> bool {
        self.operational.load(Ordering::Acquire)
    }

    /// Hold back the operational flag while a join is in flight.
    pub fn begin_join(&self) {
        self.joining.store(true, Ordering::Release);
    }

    /// The join finished; the local node is caught up once it has applied
    /// `target`.
    pub fn finish_join(&self, target: Option<u64>) {
        *self.catch_up_target.lock() = target;
        self.joining.store(false, Ordering::Release);
    }

    /// A join attempt failed.
    pub fn abort_join(&self) {
        self.joining.store(false, Ordering::Release);
    }

    /// Re-evaluate the operational flag. Returns `true` on the transition.
    ///
    /// The local node is operational once a leader is known, it belongs to
    /// the membership, and it has applied everything it was told to catch up
    /// to (or its whole local log when restarting).
    pub fn evaluate(&self, metrics: &ClusterMetrics) -> bool {
        if self.is_operational() || self.joining.load(Ordering::Acquire) {
            return false;
        }
        if metrics.current_leader.is_none() {
            return false;
        }
        let is_member = metrics
            .membership_config
            .membership()
            .nodes()
            .any(|(id, _)| *id == self.local_id);
        if !is_member {
            return false;
        }

        let applied = metrics.last_applied.map(|id| id.index);
        let target = (*self.catch_up_target.lock()).or(metrics.last_log_index);
        let caught_up = match target {
            Some(target) => applied.is_some_and(|a| a >= target),
            None => true,
        };
        if !caught_up {
            return false;
        }
        !self.operational.swap(true, Ordering::AcqRel)
    }
}

/// One-minute load average of this host, `0.0` where it cannot be read.
pub fn local_load() -> f64 {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse().ok()))
        .unwrap_or(0.0)
}

/// Periodically probe every other member.
///
/// Marks members unavailable after the configured number of consecutive
/// failures and, on the leader, evicts members unreachable for longer than
/// `prune_after_ms`.
pub fn spawn_liveness_prober(
    node: Arc<ClusterNode>,
    config: MembershipConfig,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(config.probe_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => probe_round(&node, &config, clock.as_ref()).await,
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!(node_id = node.node_id(), "liveness prober stopped");
    })
}

async fn probe_round(node: &ClusterNode, config: &MembershipConfig, clock: &dyn Clock) {
    let view = node.membership();
    let peers: Vec<Member> = view.members().iter().filter(|m| !m.is_local).cloned().collect();
    let request = ProbeRequest {
        from: node.node_id(),
    };

    for peer in peers {
        let outcome: Option<f64> = match node
            .client()
            .send::<_, ProbeReply>(&peer.addr, RPC_PATH, MessageType::Probe, &request)
            .await
        {
            Ok(reply) => Some(reply.load),
            Err(e) => {
                tracing::debug!(peer = peer.node_id, error = %e, "probe failed");
                None
            }
        };

        let now = clock.now_ms();
        if let Some(available) =
            view.record_probe(peer.node_id, outcome, now, config.failures_before_unavailable)
        {
            tracing::info!(peer = peer.node_id, available, "member availability changed");
            node.events().publish(ClusterEvent::MemberAvailabilityChanged {
                node_id: peer.node_id,
                available,
            });
        }

        if let (Some(prune_after), true) = (config.prune_after_ms, node.is_leader()) {
            let gone_for = view.unreachable_for(peer.node_id, now);
            if gone_for.is_some_and(|d| d >= Duration::from_millis(prune_after)) {
                tracing::warn!(peer = peer.node_id, "evicting unreachable member");
                if let Err(e) = node.remove_member(peer.node_id).await {
                    tracing::warn!(peer = peer.node_id, error = %e, "eviction failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_flips_after_threshold_and_recovers() {
        let view = MembershipView::new(1);
        assert_eq!(view.record_probe(2, None, 1_000, 3), None);
        assert_eq!(view.record_probe(2, None, 2_000, 3), None);
        assert_eq!(view.record_probe(2, None, 3_000, 3), Some(false));
        assert_eq!(view.record_probe(2, None, 4_000, 3), None);
        assert_eq!(
            view.unreachable_for(2, 4_000),
            Some(Duration::from_millis(3_000))
        );

        assert_eq!(view.record_probe(2, Some(0.5), 5_000, 3), Some(true));
        assert_eq!(view.unreachable_for(2, 6_000), None);
    }

    #[test]
    fn fresh_view_is_not_operational() {
        let view = MembershipView::new(1);
        assert!(!view.is_operational());
        assert!(view.members().is_empty());
        assert_eq!(view.addr_of(1), None);
    }

    #[test]
    fn load_average_is_never_negative() {
        assert!(local_load() >= 0.0);
    }
}
