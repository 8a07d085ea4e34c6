//! Cluster configuration.

use crate::error::{ClusterError, ClusterResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a cluster node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// This node's stable ID in the cluster (1-based).
    pub node_id: u64,

    /// Address this node listens on for cluster RPC (e.g., "0.0.0.0:7400").
    pub listen_addr: String,

    /// Public endpoint advertised to other nodes. Falls back to listen_addr.
    pub advertise_addr: Option<String>,

    /// Pre-shared key every inter-node request must carry.
    pub cluster_key: String,

    /// Endpoints contacted on cold start to join an existing cluster.
    pub peers: Vec<String>,

    /// Free-form labels used for assignment affinity.
    pub tags: BTreeSet<String>,

    /// Initialise a fresh single-member cluster when no peer answers.
    pub bootstrap: bool,

    /// Directory for Raft log storage.
    pub data_dir: PathBuf,

    /// Raft timing configuration.
    pub raft: RaftConfig,

    /// Snapshot configuration.
    pub snapshot: SnapshotConfig,

    /// Transport timeouts and proposal retries.
    pub rpc: RpcConfig,

    /// Liveness probing.
    pub membership: MembershipConfig,

    /// Assignment recomputation.
    pub coordination: CoordinationConfig,

    /// Status flushing, retention and notifications.
    pub timeline: TimelineConfig,
}

/// Raft timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Election timeout range (min, max) in milliseconds.
    /// Should be >> heartbeat_interval to avoid spurious elections.
    pub election_timeout_ms: (u64, u64),

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: u64,
}

/// Snapshot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Create snapshot after this many log entries.
    pub snapshot_threshold: u64,

    /// Maximum number of log entries to keep after snapshot.
    pub max_log_entries: u64,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Whole-request timeout in milliseconds.
    pub request_timeout_ms: u64,

    /// How long a proposal may wait for commit, in milliseconds.
    pub proposal_timeout_ms: u64,

    /// Attempts made by `propose_with_retry` for transient failures.
    pub retry_attempts: u32,

    /// Base delay of the exponential backoff, in milliseconds.
    pub retry_backoff_ms: u64,
}

/// Liveness probing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Interval between liveness probes, in milliseconds.
    pub probe_interval_ms: u64,

    /// Consecutive failed probes before a member is marked unavailable.
    pub failures_before_unavailable: u32,

    /// The leader evicts members unreachable for longer than this.
    pub prune_after_ms: Option<u64>,
}

/// Task coordination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Quiet period before assignments are recomputed, in milliseconds.
    pub debounce_ms: u64,
}

/// Status timeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Interval between flushes of buffered results, in milliseconds.
    pub flush_interval_ms: u64,

    /// History older than this is pruned, in milliseconds.
    pub retention_ms: u64,

    /// Interval between retention sweeps, in milliseconds.
    pub retention_sweep_interval_ms: u64,

    /// Delay before a failed notification pass is retried, in milliseconds.
    pub notification_retry_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: "127.0.0.1:7400".to_string(),
            advertise_addr: None,
            cluster_key: String::new(),
            peers: Vec::new(),
            tags: BTreeSet::new(),
            bootstrap: false,
            data_dir: PathBuf::from("./vigil-data"),
            raft: RaftConfig::default(),
            snapshot: SnapshotConfig::default(),
            rpc: RpcConfig::default(),
            membership: MembershipConfig::default(),
            coordination: CoordinationConfig::default(),
            timeline: TimelineConfig::default(),
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: (150, 300),
            heartbeat_interval_ms: 50,
            max_entries_per_append: 100,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_threshold: 5_000,
            max_log_entries: 1_000,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2_000,
            request_timeout_ms: 5_000,
            proposal_timeout_ms: 10_000,
            retry_attempts: 5,
            retry_backoff_ms: 100,
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 2_000,
            failures_before_unavailable: 3,
            prune_after_ms: None,
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self { debounce_ms: 1_000 }
    }
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5_000,
            retention_ms: 90 * 24 * 3_600_000,
            retention_sweep_interval_ms: 3_600_000,
            notification_retry_ms: 30_000,
        }
    }
}

impl ClusterConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Get the advertised address (falls back to listen_addr).
    pub fn advertise_addr(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.listen_addr)
    }

    /// Get the election timeout as a Duration range.
    pub fn election_timeout(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.raft.election_timeout_ms.0),
            Duration::from_millis(self.raft.election_timeout_ms.1),
        )
    }

    /// Get the heartbeat interval as a Duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.raft.heartbeat_interval_ms)
    }

    /// Validate the configuration.
    ///
    /// Failures are fatal: a node must not start half-configured.
    pub fn validate(&self) -> ClusterResult<()> {
        if self.node_id == 0 {
            return Err(ClusterError::Config("node_id must be > 0".to_string()));
        }

        if self.cluster_key.trim().is_empty() {
            return Err(ClusterError::Config("cluster_key is required".to_string()));
        }

        self.listen_addr.parse::<SocketAddr>().map_err(|e| {
            ClusterError::Config(format!("invalid listen_addr '{}': {}", self.listen_addr, e))
        })?;

        if self.advertise_addr().trim().is_empty() {
            return Err(ClusterError::Config("advertise_addr is empty".to_string()));
        }

        let (min_election, max_election) = self.raft.election_timeout_ms;
        if min_election >= max_election {
            return Err(ClusterError::Config(format!(
                "election_timeout_ms range ({}, {}) is empty",
                min_election, max_election
            )));
        }
        if self.raft.heartbeat_interval_ms >= min_election / 2 {
            return Err(ClusterError::Config(format!(
                "heartbeat_interval_ms ({}) should be << election_timeout_ms ({})",
                self.raft.heartbeat_interval_ms, min_election
            )));
        }

        if self.rpc.retry_attempts == 0 {
            return Err(ClusterError::Config("rpc.retry_attempts must be > 0".to_string()));
        }
        if self.membership.failures_before_unavailable == 0 {
            return Err(ClusterError::Config(
                "membership.failures_before_unavailable must be > 0".to_string(),
            ));
        }
        if self.timeline.flush_interval_ms == 0 {
            return Err(ClusterError::Config(
                "timeline.flush_interval_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for ClusterConfig.
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    /// Set the node ID.
    pub fn node_id(mut self, id: u64) -> Self {
        self.config.node_id = id;
        self
    }

    /// Set the listen address.
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the advertise address.
    pub fn advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.advertise_addr = Some(addr.into());
        self
    }

    /// Set the shared cluster key.
    pub fn cluster_key(mut self, key: impl Into<String>) -> Self {
        self.config.cluster_key = key.into();
        self
    }

    /// Add a peer endpoint.
    pub fn peer(mut self, addr: impl Into<String>) -> Self {
        self.config.peers.push(addr.into());
        self
    }

    /// Set all peers at once.
    pub fn peers(mut self, peers: impl IntoIterator<Item = String>) -> Self {
        self.config.peers = peers.into_iter().collect();
        self
    }

    /// Add a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.config.tags.insert(tag.into());
        self
    }

    /// Bootstrap a new cluster when no peer answers.
    pub fn bootstrap(mut self, bootstrap: bool) -> Self {
        self.config.bootstrap = bootstrap;
        self
    }

    /// Set the data directory.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set election timeout range in milliseconds.
    pub fn election_timeout_ms(mut self, min: u64, max: u64) -> Self {
        self.config.raft.election_timeout_ms = (min, max);
        self
    }

    /// Set heartbeat interval in milliseconds.
    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.config.raft.heartbeat_interval_ms = ms;
        self
    }

    /// Set snapshot threshold.
    pub fn snapshot_threshold(mut self, entries: u64) -> Self {
        self.config.snapshot.snapshot_threshold = entries;
        self
    }

    /// Set the liveness probe interval in milliseconds.
    pub fn probe_interval_ms(mut self, ms: u64) -> Self {
        self.config.membership.probe_interval_ms = ms;
        self
    }

    /// Set failed probes before a member is unavailable.
    pub fn failures_before_unavailable(mut self, count: u32) -> Self {
        self.config.membership.failures_before_unavailable = count;
        self
    }

    /// Evict members unreachable for longer than `ms`.
    pub fn prune_after_ms(mut self, ms: u64) -> Self {
        self.config.membership.prune_after_ms = Some(ms);
        self
    }

    /// Set the coordination debounce window in milliseconds.
    pub fn debounce_ms(mut self, ms: u64) -> Self {
        self.config.coordination.debounce_ms = ms;
        self
    }

    /// Set the timeline flush interval in milliseconds.
    pub fn flush_interval_ms(mut self, ms: u64) -> Self {
        self.config.timeline.flush_interval_ms = ms;
        self
    }

    /// Set the history retention horizon in milliseconds.
    pub fn retention_ms(mut self, ms: u64) -> Self {
        self.config.timeline.retention_ms = ms;
        self
    }

    /// Set the RPC request timeout in milliseconds.
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.rpc.request_timeout_ms = ms;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ClusterResult<ClusterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
