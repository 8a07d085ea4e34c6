//! Multi-node cluster tests.
//!
//! Tests membership, replication and work redistribution across nodes.

mod common;

use common::{wait_until, TestCluster};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use vigil_cluster::Command;
use vigil_core::{Clock, Monitor, MonitorId, MonitorKind, MonitorStatus, SystemClock};

fn tcp_monitor(name: &str, port: u16) -> Monitor {
    let mut monitor = Monitor::new(
        name,
        MonitorKind::Tcp {
            host: "127.0.0.1".into(),
            port,
            degraded_after_ms: None,
        },
    );
    monitor.interval_secs = 1;
    monitor.timeout_secs = 1;
    monitor.retries = 0;
    monitor
}

async fn tcp_target() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let accept = tokio::spawn(async move {
        while listener.accept().await.is_ok() {}
    });
    (port, accept)
}

/// Ids of the running nodes that have a live task for `monitor_id`.
fn nodes_running(cluster: &TestCluster, monitor_id: MonitorId) -> Vec<u64> {
    cluster
        .running()
        .filter(|n| n.engine().has_task(monitor_id))
        .map(|n| n.node().node_id())
        .collect()
}

/// Sample the running set for `duration_ms` (several check intervals) and
/// require it to hold `expected` tasks at every sample.
async fn assert_steady(
    cluster: &TestCluster,
    monitor_id: MonitorId,
    expected: usize,
    duration_ms: u64,
) -> Vec<u64> {
    let mut seen = Vec::new();
    let samples = duration_ms / 100;
    for _ in 0..samples {
        let running = nodes_running(cluster, monitor_id);
        assert_eq!(
            running.len(),
            expected,
            "expected {} nodes running the monitor, found {:?}",
            expected,
            running
        );
        for id in running {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    seen
}

/// Test that joining nodes end up in every member's view.
#[tokio::test]
async fn test_multi_node_join() {
    let mut cluster = TestCluster::new(3).await;
    assert!(cluster.wait_operational(10_000).await, "all nodes should catch up");

    let converged = wait_until(5_000, || {
        cluster.running().all(|n| n.node().members().len() == 3)
    })
    .await;
    assert!(converged, "every node should see 3 members");

    for (i, runtime) in cluster.running().enumerate() {
        let voters = runtime
            .node()
            .metrics()
            .membership_config
            .membership()
            .voter_ids()
            .count();
        assert_eq!(voters, 3, "Node {} should see 3 voters", i + 1);
        assert_eq!(runtime.node().leader(), Some(1));
    }

    cluster.shutdown().await;
}

/// Test that commands sent to a follower are forwarded and replicated.
#[tokio::test]
async fn test_multi_node_forwarding_and_replication() {
    let mut cluster = TestCluster::new(3).await;
    assert!(cluster.wait_operational(10_000).await);

    let monitor = tcp_monitor("forwarded", 1);
    let follower = cluster.node(2).node();
    assert!(!follower.is_leader());
    let response = follower
        .execute(Command::CreateMonitor {
            monitor: monitor.clone(),
        })
        .await
        .expect("forwarded create");
    assert!(response.success);

    let replicated = wait_until(5_000, || {
        cluster
            .running()
            .all(|n| n.node().state_machine().read(|s| s.monitor(monitor.id).is_some()))
    })
    .await;
    assert!(replicated, "monitor should reach every replica");

    cluster.shutdown().await;
}

/// Test that a leaving node is removed from the membership.
#[tokio::test]
async fn test_multi_node_leave() {
    let mut cluster = TestCluster::new(3).await;
    assert!(cluster.wait_operational(10_000).await);

    let leaving = cluster.nodes[2].take().expect("node 3 running");
    leaving.leave().await.expect("leave");

    let shrunk = wait_until(5_000, || {
        cluster.running().all(|n| n.node().members().len() == 2)
    })
    .await;
    assert!(shrunk, "remaining nodes should see 2 members");

    cluster.shutdown().await;
}

/// Test that a restarted follower catches up on what it missed.
#[tokio::test]
async fn test_multi_node_follower_restart_catches_up() {
    let mut cluster = TestCluster::new(3).await;
    assert!(cluster.wait_operational(10_000).await);

    cluster.stop(2).await;
    let monitor = tcp_monitor("missed", 1);
    cluster
        .node(0)
        .node()
        .execute(Command::CreateMonitor {
            monitor: monitor.clone(),
        })
        .await
        .expect("create while node 3 is down");

    cluster.restart(2).await;
    let caught_up = wait_until(10_000, || {
        let node = cluster.node(2).node();
        node.is_operational() && node.state_machine().read(|s| s.monitor(monitor.id).is_some())
    })
    .await;
    assert!(caught_up, "restarted node should replay the missed monitor");

    cluster.shutdown().await;
}

/// Test that each monitor is checked by exactly `worker_count` nodes.
#[tokio::test]
async fn test_multi_node_spreads_workers() {
    let (port, accept) = tcp_target().await;
    let mut cluster = TestCluster::new(3).await;
    assert!(cluster.wait_operational(10_000).await);

    let mut monitor = tcp_monitor("spread", port);
    monitor.worker_count = 2;
    cluster
        .node(0)
        .node()
        .execute(Command::CreateMonitor {
            monitor: monitor.clone(),
        })
        .await
        .expect("create");

    let spread = wait_until(10_000, || nodes_running(&cluster, monitor.id).len() == 2).await;
    assert!(spread, "exactly two nodes should run the monitor");

    // Stays at two across several check intervals.
    let seen = assert_steady(&cluster, monitor.id, 2, 3_000).await;
    assert_eq!(seen.len(), 2, "the same two nodes keep the monitor");

    accept.abort();
    cluster.shutdown().await;
}

/// A single-worker monitor moves to a survivor when its worker dies.
#[tokio::test]
async fn test_multi_node_failover_reassigns_monitor() {
    let (port, accept) = tcp_target().await;
    let mut cluster = TestCluster::new(3).await;
    assert!(cluster.wait_operational(10_000).await);

    let monitor = tcp_monitor("failover", port);
    cluster
        .node(0)
        .node()
        .execute(Command::CreateMonitor {
            monitor: monitor.clone(),
        })
        .await
        .expect("create");

    let assigned = wait_until(10_000, || {
        cluster.running().any(|n| n.engine().has_task(monitor.id))
    })
    .await;
    assert!(assigned);
    let worker = cluster
        .running()
        .find(|n| n.engine().has_task(monitor.id))
        .map(|n| n.node().node_id())
        .expect("one worker");

    cluster.stop(worker as usize - 1).await;
    let stopped_at = SystemClock.now_ms();
    cluster
        .wait_for_leader(10_000)
        .await
        .expect("survivors keep a leader");

    let moved = wait_until(15_000, || {
        cluster.running().any(|n| {
            n.node().state_machine().read(|s| {
                s.assignment(monitor.id)
                    .is_some_and(|a| a.workers.len() == 1 && !a.workers.contains(&worker))
            })
        })
    })
    .await;
    assert!(moved, "assignment should move off the stopped node");

    let running = wait_until(10_000, || !nodes_running(&cluster, monitor.id).is_empty()).await;
    assert!(running, "a survivor should start the task");

    // Exactly one survivor runs it, and it stays that way.
    let seen = assert_steady(&cluster, monitor.id, 1, 3_000).await;
    assert_eq!(seen.len(), 1, "the monitor should not hop between survivors");
    assert_ne!(seen[0], worker, "the stopped node cannot be the new worker");

    // Only transitions are recorded, so take the target down to observe the
    // new worker reporting.
    accept.abort();
    let reported = wait_until(15_000, || {
        cluster.running().any(|n| {
            n.node().state_machine().read(|s| {
                s.timeline(monitor.id)
                    .and_then(|t| t.latest())
                    .is_some_and(|(at, status)| {
                        at > stopped_at && status == MonitorStatus::Unavailable
                    })
            })
        })
    })
    .await;
    assert!(reported, "the new worker should report the outage");

    cluster.shutdown().await;
}
