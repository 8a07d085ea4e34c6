//! Leave command - take a node out of the cluster.

use super::remote;
use anyhow::{Context, Result};
use vigil_cluster::network::{LeaveRequest, MessageType, LEADER_RPC_PATH};

/// Run the leave command.
///
/// Asks the node at `addr` who it is, then asks it to route its own removal
/// to the leader. The node keeps running until it is stopped.
pub async fn run(addr: &str, cluster_key: &str) -> Result<()> {
    let client = remote::client(cluster_key)?;
    let status = remote::fetch_status(&client, addr).await?;

    client
        .send::<_, serde_json::Value>(
            addr,
            LEADER_RPC_PATH,
            MessageType::Leave,
            &LeaveRequest {
                node_id: status.node_id,
            },
        )
        .await
        .with_context(|| format!("Node {} could not leave", status.node_id))?;

    tracing::info!(node_id = status.node_id, "node left the cluster");
    println!("Node {} left the cluster.", status.node_id);
    Ok(())
}
