//! ClusterNode - the main entry point for cluster operations.

use crate::command::{ClusterRequest, Command};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::events::{ClusterEvent, EventBus};
use crate::membership::{local_load, Member, MembershipView};
use crate::network::{
    JoinReply, JoinRequest, LeaveRequest, MessageType, NetworkFactory, PeerClient, ProbeReply,
    LEADER_RPC_PATH, RPC_PATH,
};
use crate::raft::storage::LogStore;
use crate::state::{ClusterResponse, ClusterStateMachine, SnapshotBundle, StateSummary};
use crate::types::{
    extract_forward_to_leader, is_forward_without_leader, ClusterMetrics, ClusterNodeId,
    ClusterRaft, ClusterRaftWriteError, MemberNode,
};
use crate::worker::ActiveTask;
use openraft::{ChangeMembers, Config, Raft, ServerState};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;
use vigil_core::ClusterKey;

/// Upper bound of the proposal retry backoff.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// A node's view of itself and the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    /// This node.
    pub node_id: ClusterNodeId,
    /// Its public endpoint.
    pub addr: String,
    /// Raft role.
    pub state: String,
    /// Known leader.
    pub leader: Option<ClusterNodeId>,
    /// Current term.
    pub term: u64,
    /// Last applied log index.
    pub last_applied: Option<u64>,
    /// Whether the node has caught up and runs work.
    pub operational: bool,
    /// Members with locally derived liveness.
    pub members: Vec<Member>,
    /// Entity counts of the local replica.
    pub summary: StateSummary,
    /// Monitor tasks running on this node.
    #[serde(default)]
    pub active_tasks: Vec<ActiveTask>,
}

/// A node in the vigil cluster.
///
/// Owns the Raft instance and the state machine, and provides the
/// consensus-level operations: proposing commands (forwarded to the leader
/// when needed), membership changes and status queries. The RPC server and
/// the background services are wired around it by the runtime.
pub struct ClusterNode {
    /// This node's ID.
    node_id: ClusterNodeId,
    /// Public endpoint and tags, as replicated in the membership.
    member: MemberNode,
    /// Node configuration.
    config: ClusterConfig,
    /// The Raft instance.
    raft: Arc<ClusterRaft>,
    /// The state machine (for read-only queries).
    state_machine: Arc<ClusterStateMachine>,
    /// Outbound RPC.
    client: PeerClient,
    /// Local event bus.
    events: EventBus,
    /// Membership with local liveness.
    membership: Arc<MembershipView>,
    /// Translates Raft metrics into cluster events.
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterNode {
    /// Start a new cluster node.
    ///
    /// Opens the log under `<data_dir>/raft` and creates the Raft instance.
    /// The node does not serve RPC or join anything until told to.
    pub async fn start(config: ClusterConfig) -> ClusterResult<Arc<Self>> {
        config.validate()?;

        let node_id = config.node_id;
        let member = MemberNode::new(config.advertise_addr(), config.tags.clone());

        // Create storage
        let log_store = LogStore::open(config.data_dir.join("raft"))?;

        // Create state machine
        let events = EventBus::default();
        let state_machine = Arc::new(ClusterStateMachine::new(events.clone()));

        // Create network client
        let client = PeerClient::new(ClusterKey::new(config.cluster_key.clone()), &config.rpc)?;
        let network = NetworkFactory::new(client.clone());

        let raft_config = Config {
            cluster_name: "vigil-cluster".to_string(),
            election_timeout_min: config.raft.election_timeout_ms.0,
            election_timeout_max: config.raft.election_timeout_ms.1,
            heartbeat_interval: config.raft.heartbeat_interval_ms,
            max_payload_entries: config.raft.max_entries_per_append,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(
                config.snapshot.snapshot_threshold,
            ),
            max_in_snapshot_log_to_keep: config.snapshot.max_log_entries,
            ..Default::default()
        };

        let raft_config = Arc::new(
            raft_config
                .validate()
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        );

        // Create Raft instance
        let raft = Raft::new(
            node_id,
            raft_config,
            network,
            log_store,
            Arc::clone(&state_machine),
        )
        .await
        .map_err(|e| ClusterError::Storage(format!("Failed to create Raft: {}", e)))?;
        let raft = Arc::new(raft);

        let membership = Arc::new(MembershipView::new(node_id));
        let watcher = spawn_metrics_watcher(
            node_id,
            raft.metrics(),
            Arc::clone(&membership),
            events.clone(),
        );

        tracing::info!(node_id, addr = %member.addr, "Cluster node started");

        Ok(Arc::new(Self {
            node_id,
            member,
            config,
            raft,
            state_machine,
            client,
            events,
            membership,
            watcher: Mutex::new(Some(watcher)),
        }))
    }

    /// Initialize a new cluster with this node as its only member.
    ///
    /// Calling it on a node that already has a membership is a no-op.
    pub async fn initialize(&self) -> ClusterResult<()> {
        let mut members = BTreeMap::new();
        members.insert(self.node_id, self.member.clone());

        match self.raft.initialize(members).await {
            Ok(()) => {
                tracing::info!(node_id = self.node_id, "Cluster initialized");
                Ok(())
            }
            Err(openraft::error::RaftError::APIError(
                openraft::error::InitializeError::NotAllowed(_),
            )) => {
                tracing::debug!(node_id = self.node_id, "cluster already initialized");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether this node has persisted Raft state from an earlier run.
    pub fn has_state(&self) -> bool {
        let metrics = self.metrics();
        metrics.last_log_index.is_some()
            || metrics.membership_config.membership().nodes().next().is_some()
    }

    /// Ask one of `peers` to admit this node.
    ///
    /// Followers forward the request to the leader. The node becomes
    /// operational once it has applied everything the leader had applied
    /// when it admitted us.
    pub async fn join(&self, peers: &[String]) -> ClusterResult<()> {
        let request = JoinRequest {
            node_id: self.node_id,
            addr: self.member.addr.clone(),
            tags: self.member.tags.clone(),
        };

        self.membership.begin_join();
        match self
            .client
            .send_any::<_, JoinReply>(peers, LEADER_RPC_PATH, MessageType::Join, &request)
            .await
        {
            Ok(reply) => {
                tracing::info!(
                    node_id = self.node_id,
                    leader = reply.leader,
                    catch_up_index = ?reply.catch_up_index,
                    "joined cluster"
                );
                self.membership.finish_join(reply.catch_up_index);
                self.evaluate_operational();
                Ok(())
            }
            Err(e) => {
                self.membership.abort_join();
                Err(e)
            }
        }
    }

    /// Ask the leader to remove this node from the membership.
    pub async fn leave(&self) -> ClusterResult<()> {
        let request = LeaveRequest {
            node_id: self.node_id,
        };
        self.handle_leave(request, true).await
    }

    /// Admit a node. Leader only.
    ///
    /// The node is added as a learner, which blocks until it has caught up
    /// with the log, then promoted to voter. Admitting a known id is a no-op.
    pub async fn add_member(
        &self,
        node_id: ClusterNodeId,
        addr: impl Into<String>,
        tags: BTreeSet<String>,
    ) -> ClusterResult<JoinReply> {
        self.ensure_leader()?;
        let addr = addr.into();

        let metrics = self.metrics();
        let membership = metrics.membership_config.membership();
        let known = membership.nodes().any(|(id, _)| *id == node_id);
        let is_voter = membership.voter_ids().any(|id| id == node_id);
        if known && is_voter {
            tracing::debug!(node_id, %addr, "member already known");
            return Ok(self.join_reply());
        }

        if !known {
            self.raft
                .add_learner(node_id, MemberNode::new(addr.clone(), tags), true)
                .await
                .map_err(map_write_error)?;
        }

        let mut voters: BTreeSet<ClusterNodeId> = self
            .metrics()
            .membership_config
            .membership()
            .voter_ids()
            .collect();
        voters.insert(node_id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(map_write_error)?;

        tracing::info!(node_id, %addr, "member added");
        Ok(self.join_reply())
    }

    /// Remove a node from the membership. Leader only.
    ///
    /// Removing an id that is not a member succeeds without change.
    pub async fn remove_member(&self, node_id: ClusterNodeId) -> ClusterResult<()> {
        self.ensure_leader()?;

        let metrics = self.metrics();
        let membership = metrics.membership_config.membership();
        if !membership.nodes().any(|(id, _)| *id == node_id) {
            return Ok(());
        }

        let mut voters: BTreeSet<ClusterNodeId> = membership.voter_ids().collect();
        if voters.remove(&node_id) {
            if voters.is_empty() {
                return Err(ClusterError::Validation(
                    "cannot remove the last voting member".to_string(),
                ));
            }
            self.raft
                .change_membership(voters, false)
                .await
                .map_err(map_write_error)?;
        } else {
            let learners: BTreeSet<ClusterNodeId> = [node_id].into_iter().collect();
            self.raft
                .change_membership(ChangeMembers::RemoveNodes(learners), false)
                .await
                .map_err(map_write_error)?;
        }

        tracing::info!(node_id, "member removed");
        Ok(())
    }

    /// Current members with local liveness.
    pub fn members(&self) -> Arc<Vec<Member>> {
        self.membership.members()
    }

    /// Check if this node is the leader.
    pub fn is_leader(&self) -> bool {
        self.leader() == Some(self.node_id)
    }

    /// Get the current leader's node ID.
    pub fn leader(&self) -> Option<ClusterNodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Validate and propose a command, waiting for it to be applied.
    ///
    /// Validation failures never reach the log. A command the state machine
    /// refuses comes back as [`ClusterError::Rejected`].
    pub async fn execute(&self, command: Command) -> ClusterResult<ClusterResponse> {
        self.execute_request(ClusterRequest::new(command)).await
    }

    /// Like [`execute`](Self::execute), keyed so a replay is applied once.
    pub async fn execute_idempotent(
        &self,
        request_id: Uuid,
        command: Command,
    ) -> ClusterResult<ClusterResponse> {
        self.execute_request(ClusterRequest::idempotent(request_id, command))
            .await
    }

    async fn execute_request(&self, request: ClusterRequest) -> ClusterResult<ClusterResponse> {
        self.state_machine
            .read(|state| request.command.validate(state))?;

        let response = self.submit(request).await?;
        if !response.success {
            return Err(ClusterError::Rejected(
                response.error.unwrap_or_else(|| "rejected".to_string()),
            ));
        }
        Ok(response)
    }

    /// Propose with retries on transient failures, then report whether the
    /// command committed.
    pub async fn replicate_and_commit(&self, command: Command) -> bool {
        let name = command.name();
        match self.propose_with_retry(command).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(command = name, error = %e, "command not committed");
                false
            }
        }
    }

    /// Propose under one idempotency key, retrying transient failures with
    /// exponential backoff.
    pub async fn propose_with_retry(&self, command: Command) -> ClusterResult<ClusterResponse> {
        let request_id = Uuid::new_v4();
        let attempts = self.config.rpc.retry_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.rpc.retry_backoff_ms);
        let mut attempt = 1;

        loop {
            match self.execute_idempotent(request_id, command.clone()).await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::debug!(
                        command = command.name(),
                        attempt,
                        error = %e,
                        "transient proposal failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_BACKOFF);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Replace replicated state with an authoritative bundle.
    pub async fn restore_bundle(&self, bundle: SnapshotBundle) -> ClusterResult<ClusterResponse> {
        self.execute(Command::RestoreSnapshot { bundle }).await
    }

    /// Propose locally, forwarding once to the leader if this node is not it.
    pub async fn submit(&self, request: ClusterRequest) -> ClusterResult<ClusterResponse> {
        match self.propose_local(request.clone()).await {
            Err(ClusterError::NotLeader {
                leader: Some(leader),
            }) if leader != self.node_id => {
                let addr = self.leader_addr(leader)?;
                tracing::debug!(leader, %addr, %request, "forwarding proposal to leader");
                self.client
                    .send(&addr, RPC_PATH, MessageType::Propose, &request)
                    .await
            }
            other => other,
        }
    }

    /// Propose on this node only.
    pub async fn propose_local(&self, request: ClusterRequest) -> ClusterResult<ClusterResponse> {
        let timeout = Duration::from_millis(self.config.rpc.proposal_timeout_ms);
        match tokio::time::timeout(timeout, self.raft.client_write(request)).await {
            Ok(Ok(resp)) => Ok(resp.data),
            Ok(Err(e)) => Err(map_write_error(e)),
            Err(_) => Err(ClusterError::Timeout(format!(
                "proposal not committed within {:?}",
                timeout
            ))),
        }
    }

    /// Serve a join request, forwarding to the leader when asked to.
    pub async fn handle_join(
        &self,
        request: JoinRequest,
        forward: bool,
    ) -> ClusterResult<JoinReply> {
        if self.is_leader() {
            return self
                .add_member(request.node_id, request.addr, request.tags)
                .await;
        }
        if !forward {
            return Err(ClusterError::NotLeader {
                leader: self.leader(),
            });
        }
        self.forward_to_leader(MessageType::Join, &request).await
    }

    /// Serve a leave request, forwarding to the leader when asked to.
    pub async fn handle_leave(&self, request: LeaveRequest, forward: bool) -> ClusterResult<()> {
        if self.is_leader() {
            return self.remove_member(request.node_id).await;
        }
        if !forward {
            return Err(ClusterError::NotLeader {
                leader: self.leader(),
            });
        }
        self.forward_to_leader(MessageType::Leave, &request).await
    }

    async fn forward_to_leader<T, R>(&self, kind: MessageType, payload: &T) -> ClusterResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let leader = self.leader().ok_or(ClusterError::LeaderUnavailable)?;
        let addr = self.leader_addr(leader)?;
        tracing::debug!(leader, %addr, %kind, "forwarding to leader");
        self.client.send(&addr, RPC_PATH, kind, payload).await
    }

    /// Answer a liveness probe.
    pub fn probe_reply(&self) -> ProbeReply {
        ProbeReply {
            node_id: self.node_id,
            load: local_load(),
            operational: self.is_operational(),
        }
    }

    /// This node's view of itself and the cluster.
    pub fn status(&self) -> NodeStatus {
        let metrics = self.metrics();
        NodeStatus {
            node_id: self.node_id,
            addr: self.member.addr.clone(),
            state: server_state_name(metrics.state).to_string(),
            leader: metrics.current_leader,
            term: metrics.current_term,
            last_applied: metrics.last_applied.map(|id| id.index),
            operational: self.is_operational(),
            members: self.members().as_ref().clone(),
            summary: self.state_machine.read(|s| s.summary()),
            active_tasks: Vec::new(),
        }
    }

    /// Subscribe to cluster events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// The local event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Whether this node has caught up and may run work.
    pub fn is_operational(&self) -> bool {
        self.membership.is_operational()
    }

    /// Membership view.
    pub fn membership(&self) -> &Arc<MembershipView> {
        &self.membership
    }

    /// Get this node's ID.
    pub fn node_id(&self) -> ClusterNodeId {
        self.node_id
    }

    /// Public endpoint.
    pub fn addr(&self) -> &str {
        &self.member.addr
    }

    /// Node configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Outbound RPC client.
    pub fn client(&self) -> &PeerClient {
        &self.client
    }

    /// The Raft instance.
    pub fn raft(&self) -> &Arc<ClusterRaft> {
        &self.raft
    }

    /// Get a reference to the state machine for read-only queries.
    ///
    /// Reads are served by the local replica and may lag the leader.
    pub fn state_machine(&self) -> &Arc<ClusterStateMachine> {
        &self.state_machine
    }

    /// Get cluster metrics.
    pub fn metrics(&self) -> ClusterMetrics {
        self.raft.metrics().borrow().clone()
    }

    /// Trigger a snapshot.
    pub async fn trigger_snapshot(&self) -> ClusterResult<()> {
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| ClusterError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Shutdown the node gracefully.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }

        self.raft
            .shutdown()
            .await
            .map_err(|e| ClusterError::Storage(format!("Shutdown error: {}", e)))?;

        tracing::info!(node_id = self.node_id, "Cluster node shutdown");
        Ok(())
    }

    fn ensure_leader(&self) -> ClusterResult<()> {
        match self.leader() {
            Some(leader) if leader == self.node_id => Ok(()),
            Some(leader) => Err(ClusterError::NotLeader {
                leader: Some(leader),
            }),
            None => Err(ClusterError::LeaderUnavailable),
        }
    }

    fn leader_addr(&self, leader: ClusterNodeId) -> ClusterResult<String> {
        if let Some(addr) = self.membership.addr_of(leader) {
            return Ok(addr);
        }
        self.metrics()
            .membership_config
            .membership()
            .nodes()
            .find(|(id, node)| **id == leader && !node.addr.is_empty())
            .map(|(_, node)| node.addr.clone())
            .ok_or(ClusterError::LeaderUnavailable)
    }

    fn join_reply(&self) -> JoinReply {
        JoinReply {
            leader: self.node_id,
            catch_up_index: self.metrics().last_applied.map(|id| id.index),
        }
    }

    fn evaluate_operational(&self) {
        if self.membership.evaluate(&self.metrics()) {
            tracing::info!(node_id = self.node_id, "replication caught up");
            self.events.publish(ClusterEvent::ReplicationCaughtUp);
        }
    }
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("node_id", &self.node_id)
            .field("member", &self.member)
            .finish_non_exhaustive()
    }
}

impl Drop for ClusterNode {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
    }
}

/// Translate Raft metrics changes into cluster events.
fn spawn_metrics_watcher(
    node_id: ClusterNodeId,
    mut metrics: watch::Receiver<ClusterMetrics>,
    membership: Arc<MembershipView>,
    events: EventBus,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_leader = None;
        loop {
            let current = metrics.borrow_and_update().clone();

            if current.current_leader != last_leader {
                last_leader = current.current_leader;
                tracing::info!(
                    node_id,
                    leader = ?current.current_leader,
                    term = current.current_term,
                    "leader changed"
                );
                events.publish(ClusterEvent::LeaderChanged {
                    leader: current.current_leader,
                    term: current.current_term,
                });
            }

            let delta = membership.refresh(&current);
            for (joined, addr) in delta.joined {
                tracing::info!(node_id, member = joined, %addr, "member joined");
                events.publish(ClusterEvent::MemberJoined {
                    node_id: joined,
                    addr,
                });
            }
            for left in delta.left {
                tracing::info!(node_id, member = left, "member left");
                events.publish(ClusterEvent::MemberLeft { node_id: left });
            }

            if membership.evaluate(&current) {
                tracing::info!(node_id, "replication caught up");
                events.publish(ClusterEvent::ReplicationCaughtUp);
            }

            if metrics.changed().await.is_err() {
                break;
            }
        }
    })
}

fn map_write_error(e: ClusterRaftWriteError) -> ClusterError {
    if let Some(info) = extract_forward_to_leader(&e) {
        return ClusterError::NotLeader {
            leader: Some(info.leader_id),
        };
    }
    if is_forward_without_leader(&e) {
        return ClusterError::LeaderUnavailable;
    }
    ClusterError::Raft(e.to_string())
}

fn server_state_name(state: ServerState) -> &'static str {
    match state {
        ServerState::Leader => "leader",
        ServerState::Follower => "follower",
        ServerState::Candidate => "candidate",
        ServerState::Learner => "learner",
        ServerState::Shutdown => "shutdown",
    }
}
