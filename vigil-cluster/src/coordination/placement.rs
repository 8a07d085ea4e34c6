//! Worker placement.
//!
//! A pure function from (monitors, current assignments, members) to the
//! assignments that must be replicated. Keeping it free of I/O makes the
//! decision reproducible in tests; agreement between nodes comes from the
//! log, not from every node computing the same plan.

use crate::membership::Member;
use crate::types::ClusterNodeId;
use std::collections::{BTreeMap, BTreeSet};
use vigil_core::{AssignmentId, Monitor, MonitorId, TaskAssignment};

/// Compute the assignments that differ from `current`.
///
/// For each monitor:
/// - disabled monitors get an empty worker set;
/// - candidates are available members carrying all of the monitor's tags,
///   falling back to any available member, then to every member;
/// - current workers that are still candidates are kept;
/// - remaining slots go to the least loaded candidates, counting the
///   assignments handed out in this plan.
///
/// Only monitors whose version or worker set changed are returned. The
/// decision time is `now_ms`, bumped past the previous decision so the order
/// stays strict even when clocks disagree.
pub fn plan(
    monitors: &BTreeMap<MonitorId, Monitor>,
    current: &BTreeMap<MonitorId, TaskAssignment>,
    members: &[Member],
    now_ms: u64,
) -> Vec<TaskAssignment> {
    let mut per_node: BTreeMap<ClusterNodeId, usize> =
        members.iter().map(|m| (m.node_id, 0)).collect();
    for assignment in current.values() {
        if !monitors.contains_key(&assignment.monitor_id) {
            continue;
        }
        for worker in &assignment.workers {
            if let Some(count) = per_node.get_mut(worker) {
                *count += 1;
            }
        }
    }

    let mut decisions = Vec::new();
    for monitor in monitors.values() {
        let previous = current.get(&monitor.id);
        let workers = if monitor.enabled && !members.is_empty() {
            if let Some(prev) = previous {
                for worker in &prev.workers {
                    if let Some(count) = per_node.get_mut(worker) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
            let chosen = choose_workers(monitor, previous, members, &per_node);
            for worker in &chosen {
                if let Some(count) = per_node.get_mut(worker) {
                    *count += 1;
                }
            }
            chosen
        } else {
            BTreeSet::new()
        };

        let unchanged = previous.is_some_and(|prev| {
            prev.monitor_version == monitor.version && prev.workers == workers
        });
        if unchanged {
            continue;
        }

        let decided_at_ms = previous.map_or(now_ms, |prev| now_ms.max(prev.decided_at_ms + 1));
        decisions.push(TaskAssignment {
            id: AssignmentId::new(),
            decided_at_ms,
            monitor_id: monitor.id,
            monitor_version: monitor.version,
            workers,
        });
    }
    decisions
}

fn choose_workers(
    monitor: &Monitor,
    previous: Option<&TaskAssignment>,
    members: &[Member],
    per_node: &BTreeMap<ClusterNodeId, usize>,
) -> BTreeSet<ClusterNodeId> {
    let candidates = candidates(monitor, members);
    let wanted = (monitor.worker_count as usize).min(candidates.len());

    let mut chosen: BTreeSet<ClusterNodeId> = previous
        .map(|prev| {
            candidates
                .iter()
                .map(|m| m.node_id)
                .filter(|id| prev.workers.contains(id))
                .take(wanted)
                .collect()
        })
        .unwrap_or_default();

    let mut ranked: Vec<&Member> = candidates
        .iter()
        .copied()
        .filter(|m| !chosen.contains(&m.node_id))
        .collect();
    ranked.sort_by_key(|m| {
        (
            per_node.get(&m.node_id).copied().unwrap_or(0),
            load_millis(m.load),
            m.node_id,
        )
    });

    for member in ranked {
        if chosen.len() >= wanted {
            break;
        }
        chosen.insert(member.node_id);
    }
    chosen
}

fn candidates<'a>(monitor: &Monitor, members: &'a [Member]) -> Vec<&'a Member> {
    let available: Vec<&Member> = members.iter().filter(|m| m.available).collect();
    let tagged: Vec<&Member> = available
        .iter()
        .copied()
        .filter(|m| monitor.tags.is_subset(&m.tags))
        .collect();

    if !tagged.is_empty() {
        tagged
    } else if !available.is_empty() {
        available
    } else {
        members.iter().collect()
    }
}

fn load_millis(load: f64) -> u64 {
    if load.is_finite() && load > 0.0 {
        (load * 1_000.0) as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::MonitorKind;

    fn member(node_id: ClusterNodeId, tags: &[&str]) -> Member {
        Member {
            node_id,
            addr: format!("127.0.0.1:{}", 7000 + node_id),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            available: true,
            load: 0.0,
            is_leader: node_id == 1,
            is_local: node_id == 1,
            voter: true,
        }
    }

    fn monitor(name: &str, worker_count: u32) -> Monitor {
        let mut m = Monitor::new(
            name,
            MonitorKind::Tcp {
                host: "localhost".into(),
                port: 80,
                degraded_after_ms: None,
            },
        );
        m.worker_count = worker_count;
        m
    }

    fn monitors(list: &[Monitor]) -> BTreeMap<MonitorId, Monitor> {
        list.iter().map(|m| (m.id, m.clone())).collect()
    }

    fn applied(decisions: Vec<TaskAssignment>) -> BTreeMap<MonitorId, TaskAssignment> {
        decisions.into_iter().map(|a| (a.monitor_id, a)).collect()
    }

    #[test]
    fn worker_count_is_bounded_by_cluster_size() {
        let m = monitor("api", 5);
        let members = vec![member(1, &[]), member(2, &[])];

        let plan = plan(&monitors(&[m.clone()]), &BTreeMap::new(), &members, 1_000);

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].workers.len(), 2);
        assert_eq!(plan[0].monitor_version, m.version);
        assert_eq!(plan[0].decided_at_ms, 1_000);
    }

    #[test]
    fn stable_inputs_produce_no_decisions() {
        let all = monitors(&[monitor("a", 1), monitor("b", 2)]);
        let members = vec![member(1, &[]), member(2, &[]), member(3, &[])];

        let current = applied(plan(&all, &BTreeMap::new(), &members, 1_000));
        assert_eq!(current.len(), 2);

        assert!(plan(&all, &current, &members, 2_000).is_empty());
    }

    #[test]
    fn single_worker_monitors_spread_across_nodes() {
        let list: Vec<Monitor> = (0..6).map(|i| monitor(&format!("m{}", i), 1)).collect();
        let members = vec![member(1, &[]), member(2, &[]), member(3, &[])];

        let current = applied(plan(&monitors(&list), &BTreeMap::new(), &members, 1));

        let mut per_node: BTreeMap<ClusterNodeId, usize> = BTreeMap::new();
        for a in current.values() {
            for w in &a.workers {
                *per_node.entry(*w).or_default() += 1;
            }
        }
        assert_eq!(per_node.values().copied().collect::<Vec<_>>(), vec![2, 2, 2]);
    }

    #[test]
    fn tags_restrict_candidates() {
        let mut m = monitor("eu-api", 2);
        m.tags.insert("eu".to_string());
        let members = vec![member(1, &["us"]), member(2, &["eu"]), member(3, &["eu", "ssd"])];

        let plan = plan(&monitors(&[m]), &BTreeMap::new(), &members, 1);
        assert_eq!(plan[0].workers, [2, 3].into_iter().collect());
    }

    #[test]
    fn unmatched_tags_fall_back_to_available_members() {
        let mut m = monitor("apac", 1);
        m.tags.insert("apac".to_string());
        let mut down = member(2, &[]);
        down.available = false;
        let members = vec![member(1, &["us"]), down];

        let plan = plan(&monitors(&[m]), &BTreeMap::new(), &members, 1);
        assert_eq!(plan[0].workers, [1].into_iter().collect());
    }

    #[test]
    fn unavailable_worker_is_replaced() {
        let m = monitor("api", 1);
        let all = monitors(&[m.clone()]);
        let mut members = vec![member(1, &[]), member(2, &[]), member(3, &[])];

        let current = applied(plan(&all, &BTreeMap::new(), &members, 10));
        let first = *current[&m.id].workers.iter().next().unwrap();

        members
            .iter_mut()
            .filter(|mem| mem.node_id == first)
            .for_each(|mem| mem.available = false);
        let next = plan(&all, &current, &members, 5);

        assert_eq!(next.len(), 1);
        assert!(!next[0].workers.contains(&first));
        assert_eq!(next[0].workers.len(), 1);
        // Decision time stays strictly increasing even with a clock behind.
        assert_eq!(next[0].decided_at_ms, 11);
        assert!(next[0].is_newer_than(&current[&m.id]));
    }

    #[test]
    fn existing_workers_are_kept() {
        let m = monitor("api", 1);
        let all = monitors(&[m.clone()]);
        let members = vec![member(1, &[]), member(2, &[])];

        let mut current = applied(plan(&all, &BTreeMap::new(), &members, 10));
        current.get_mut(&m.id).unwrap().workers = [2].into_iter().collect();

        let mut loaded = members.clone();
        loaded[1].load = 8.0;
        assert!(plan(&all, &current, &loaded, 20).is_empty());
    }

    #[test]
    fn version_bump_produces_new_decision() {
        let mut m = monitor("api", 1);
        let members = vec![member(1, &[])];
        let current = applied(plan(&monitors(&[m.clone()]), &BTreeMap::new(), &members, 10));

        m.version += 1;
        let next = plan(&monitors(&[m.clone()]), &current, &members, 20);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].monitor_version, 2);
        assert_eq!(next[0].workers, current[&m.id].workers);
    }

    #[test]
    fn disabled_monitor_is_unassigned() {
        let mut m = monitor("api", 1);
        let members = vec![member(1, &[])];
        let current = applied(plan(&monitors(&[m.clone()]), &BTreeMap::new(), &members, 10));

        m.enabled = false;
        m.version += 1;
        let next = plan(&monitors(&[m]), &current, &members, 20);
        assert_eq!(next.len(), 1);
        assert!(next[0].workers.is_empty());
    }
}
