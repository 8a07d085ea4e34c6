//! Remove command - evict a member, even one that is down.

use super::remote;
use anyhow::{Context, Result};
use vigil_cluster::network::{LeaveRequest, MessageType, LEADER_RPC_PATH};

/// Run the remove command against any reachable member at `addr`.
pub async fn run(addr: &str, cluster_key: &str, node_id: u64) -> Result<()> {
    let client = remote::client(cluster_key)?;
    client
        .send::<_, serde_json::Value>(
            addr,
            LEADER_RPC_PATH,
            MessageType::Leave,
            &LeaveRequest { node_id },
        )
        .await
        .with_context(|| format!("Failed to remove node {}", node_id))?;

    tracing::info!(node_id, "member removed");
    println!("Node {} removed from the cluster.", node_id);
    Ok(())
}
