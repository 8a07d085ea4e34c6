//! Common test utilities for vigil-cluster tests.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use vigil_cluster::{ClusterConfig, NodeRuntime};

/// Atomic counter for allocating unique ports.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(17000);

/// Shared key of every test cluster.
pub const TEST_KEY: &str = "test-cluster-key";

/// Get a unique port for testing.
pub fn get_test_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Configuration with timings short enough for tests.
pub fn test_config(node_id: u64, addr: &str, data_dir: &std::path::Path) -> ClusterConfig {
    let mut config = ClusterConfig::builder()
        .node_id(node_id)
        .listen_addr(addr)
        .cluster_key(TEST_KEY)
        .data_dir(data_dir)
        .election_timeout_ms(300, 600)
        .heartbeat_interval_ms(50)
        .probe_interval_ms(200)
        .failures_before_unavailable(2)
        .debounce_ms(100)
        .flush_interval_ms(200)
        .request_timeout_ms(2_000)
        .build()
        .expect("Invalid config");
    config.rpc.retry_backoff_ms = 50;
    config
}

/// Poll `check` until it holds or `timeout_ms` passes.
pub async fn wait_until(timeout_ms: u64, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Test context that holds temp directories and nodes.
#[allow(dead_code)]
pub struct TestCluster {
    /// Temp directories for each node (kept alive for the test duration).
    _temp_dirs: Vec<TempDir>,
    /// Node configurations, by position.
    pub configs: Vec<ClusterConfig>,
    /// Running nodes; `None` once stopped.
    pub nodes: Vec<Option<NodeRuntime>>,
    /// Node addresses.
    pub addresses: Vec<String>,
}

#[allow(dead_code)]
impl TestCluster {
    /// Start `node_count` nodes. The first one bootstraps, the others join it.
    pub async fn new(node_count: usize) -> Self {
        Self::with_config(node_count, |_, _| {}).await
    }

    /// Like [`new`](Self::new), with a hook to adjust each node's config.
    pub async fn with_config(
        node_count: usize,
        adjust: impl Fn(usize, &mut ClusterConfig),
    ) -> Self {
        let mut temp_dirs = Vec::with_capacity(node_count);
        let mut configs = Vec::with_capacity(node_count);
        let mut addresses: Vec<String> = Vec::with_capacity(node_count);

        for i in 0..node_count {
            let addr = format!("127.0.0.1:{}", get_test_port());
            let temp_dir = TempDir::new().expect("Failed to create temp dir");
            let mut config = test_config(i as u64 + 1, &addr, temp_dir.path());
            if i == 0 {
                config.bootstrap = true;
            } else {
                config.peers = vec![addresses[0].clone()];
            }
            adjust(i, &mut config);

            addresses.push(addr);
            temp_dirs.push(temp_dir);
            configs.push(config);
        }

        let mut cluster = Self {
            _temp_dirs: temp_dirs,
            configs,
            nodes: Vec::with_capacity(node_count),
            addresses,
        };
        for i in 0..node_count {
            let runtime = NodeRuntime::start(cluster.configs[i].clone())
                .await
                .expect("Failed to start node");
            cluster.nodes.push(Some(runtime));
            if i == 0 {
                cluster
                    .wait_for_leader(5_000)
                    .await
                    .expect("bootstrap node should lead");
            }
        }
        cluster
    }

    /// Running node at position `i`.
    pub fn node(&self, i: usize) -> &NodeRuntime {
        self.nodes[i].as_ref().expect("node is stopped")
    }

    /// Running nodes.
    pub fn running(&self) -> impl Iterator<Item = &NodeRuntime> {
        self.nodes.iter().flatten()
    }

    /// The runtime that currently leads, if any.
    pub fn leader(&self) -> Option<&NodeRuntime> {
        self.running().find(|n| n.node().is_leader())
    }

    /// Wait for a leader to be elected.
    pub async fn wait_for_leader(&self, timeout_ms: u64) -> Option<u64> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while Instant::now() < deadline {
            if let Some(leader) = self.leader() {
                return Some(leader.node().node_id());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    /// Wait until every running node is operational.
    pub async fn wait_operational(&self, timeout_ms: u64) -> bool {
        wait_until(timeout_ms, || {
            self.running().all(|n| n.node().is_operational())
        })
        .await
    }

    /// Stop the node at position `i` without leaving the cluster.
    pub async fn stop(&mut self, i: usize) {
        if let Some(runtime) = self.nodes[i].take() {
            runtime.shutdown().await;
        }
    }

    /// Start the node at position `i` again from its data directory.
    pub async fn restart(&mut self, i: usize) {
        self.stop(i).await;
        let runtime = NodeRuntime::start(self.configs[i].clone())
            .await
            .expect("Failed to restart node");
        self.nodes[i] = Some(runtime);
    }

    /// Shutdown all nodes.
    pub async fn shutdown(&mut self) {
        for i in 0..self.nodes.len() {
            self.stop(i).await;
        }
    }
}
