//! Talking to a running node over the cluster transport.

use anyhow::{Context, Result};
use vigil_cluster::config::RpcConfig;
use vigil_cluster::network::{MessageType, PeerClient, RPC_PATH};
use vigil_cluster::NodeStatus;
use vigil_core::ClusterKey;

/// Client authenticated with `cluster_key`.
pub fn client(cluster_key: &str) -> Result<PeerClient> {
    PeerClient::new(ClusterKey::new(cluster_key), &RpcConfig::default())
        .context("Failed to create cluster client")
}

/// Ask the node at `addr` for its view of the cluster.
pub async fn fetch_status(client: &PeerClient, addr: &str) -> Result<NodeStatus> {
    client
        .send(addr, RPC_PATH, MessageType::Status, &())
        .await
        .with_context(|| format!("Failed to query {}", addr))
}
