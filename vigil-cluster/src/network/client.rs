//! Network client implementing OpenRaft's RaftNetwork trait.
//!
//! [`PeerClient`] is the single outbound path of a node: Raft replication,
//! forwarded proposals, join/leave requests and liveness probes all go
//! through it.

use super::envelope::{Envelope, MessageType, RpcReply, RPC_PATH};
use crate::config::RpcConfig;
use crate::error::{ClusterError, ClusterResult, RPCError};
use crate::types::{ClusterNodeId, MemberNode, TypeConfig};
use openraft::error::{InstallSnapshotError, NetworkError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vigil_core::auth::{ClusterKey, CLUSTER_KEY_HEADER};

/// Authenticated HTTP client for cluster RPC.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    key: ClusterKey,
    /// Index of the endpoint that answered the last `send_any`.
    cursor: Arc<AtomicUsize>,
}

impl PeerClient {
    /// Create a client with the configured timeouts.
    pub fn new(key: ClusterKey, rpc: &RpcConfig) -> ClusterResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(rpc.connect_timeout_ms))
            .timeout(Duration::from_millis(rpc.request_timeout_ms))
            .build()
            .map_err(|e| ClusterError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            key,
            cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Send one message to `addr` and decode the reply.
    pub async fn send<T, R>(
        &self,
        addr: &str,
        path: &str,
        kind: MessageType,
        payload: &T,
    ) -> ClusterResult<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.post(addr, path, kind, payload, None).await
    }

    /// Try `endpoints` round-robin, starting after the last one that answered.
    ///
    /// Only connection-level failures move on to the next endpoint; an error
    /// reported by a peer is returned as is.
    pub async fn send_any<T, R>(
        &self,
        endpoints: &[String],
        path: &str,
        kind: MessageType,
        payload: &T,
    ) -> ClusterResult<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if endpoints.is_empty() {
            return Err(ClusterError::Unreachable("no endpoints".to_string()));
        }

        let start = self.cursor.load(Ordering::Relaxed).wrapping_add(1);
        let mut last_error = None;
        for offset in 0..endpoints.len() {
            let index = (start + offset) % endpoints.len();
            let addr = &endpoints[index];
            match self.send(addr, path, kind, payload).await {
                Ok(value) => {
                    self.cursor.store(index, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(e) if is_connection_error(&e) => {
                    tracing::debug!(peer = %addr, %kind, error = %e, "peer did not answer");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ClusterError::Unreachable(format!(
            "none of {} endpoints answered: {}",
            endpoints.len(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn post<T, R>(
        &self,
        addr: &str,
        path: &str,
        kind: MessageType,
        payload: &T,
        timeout: Option<Duration>,
    ) -> ClusterResult<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let envelope = Envelope::new(kind, payload)?;
        let mut request = self
            .http
            .post(endpoint_url(addr, path))
            .header(CLUSTER_KEY_HEADER, self.key.expose())
            .json(&envelope);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        match serde_json::from_slice::<RpcReply>(&body) {
            Ok(reply) => reply.into_result(),
            Err(_) if status == reqwest::StatusCode::UNAUTHORIZED => {
                Err(ClusterError::Unauthorized)
            }
            Err(e) => Err(ClusterError::Network(format!(
                "{} replied {} with an unreadable body: {}",
                addr, status, e
            ))),
        }
    }
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

fn endpoint_url(addr: &str, path: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        format!("{}{}", addr.trim_end_matches('/'), path)
    } else {
        format!("http://{}{}", addr, path)
    }
}

fn is_connection_error(e: &ClusterError) -> bool {
    matches!(
        e,
        ClusterError::Unreachable(_) | ClusterError::Timeout(_) | ClusterError::Network(_)
    )
}

/// Factory for creating network connections to other nodes.
#[derive(Clone, Debug)]
pub struct NetworkFactory {
    client: PeerClient,
}

impl NetworkFactory {
    /// Wrap a peer client.
    pub fn new(client: PeerClient) -> Self {
        Self { client }
    }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = PeerConnection;

    async fn new_client(&mut self, target: ClusterNodeId, node: &MemberNode) -> Self::Network {
        PeerConnection {
            target,
            addr: node.addr.clone(),
            client: self.client.clone(),
        }
    }
}

/// A connection to a specific node.
pub struct PeerConnection {
    /// Target node ID.
    target: ClusterNodeId,
    /// Target address.
    addr: String,
    /// Shared client.
    client: PeerClient,
}

impl PeerConnection {
    async fn call<T, R, E>(
        &self,
        kind: MessageType,
        req: &T,
        option: &RPCOption,
    ) -> Result<R, RPCError<E>>
    where
        T: Serialize,
        R: DeserializeOwned,
        E: std::error::Error,
    {
        self.client
            .post(&self.addr, RPC_PATH, kind, req, Some(option.hard_ttl()))
            .await
            .map_err(|e| {
                tracing::trace!(target_node = self.target, %kind, error = %e, "raft rpc failed");
                to_rpc_error(&e)
            })
    }
}

impl RaftNetwork<TypeConfig> for PeerConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<ClusterNodeId>, RPCError> {
        self.call(MessageType::AppendEntries, &req, &option).await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<InstallSnapshotResponse<ClusterNodeId>, RPCError<InstallSnapshotError>> {
        self.call(MessageType::InstallSnapshot, &req, &option).await
    }

    async fn vote(
        &mut self,
        req: VoteRequest<ClusterNodeId>,
        option: RPCOption,
    ) -> Result<VoteResponse<ClusterNodeId>, RPCError> {
        self.call(MessageType::Vote, &req, &option).await
    }
}

/// Connection failures become `Unreachable` so openraft backs off; anything
/// else is a generic network error.
fn to_rpc_error<E: std::error::Error>(err: &ClusterError) -> RPCError<E> {
    match err {
        ClusterError::Unreachable(_) | ClusterError::Timeout(_) => {
            openraft::error::RPCError::Unreachable(Unreachable::new(err))
        }
        _ => openraft::error::RPCError::Network(NetworkError::new(err)),
    }
}
