//! Status command - show a node's view of the cluster.

use super::remote;
use anyhow::Result;
use vigil_cluster::NodeStatus;

/// Run the status command.
pub async fn run(addr: &str, cluster_key: &str, json: bool) -> Result<()> {
    let client = remote::client(cluster_key)?;
    let status = remote::fetch_status(&client, addr).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", render(&status));
    }
    Ok(())
}

fn render(status: &NodeStatus) -> String {
    let mut out = String::new();
    let leader = status
        .leader
        .map(|id| id.to_string())
        .unwrap_or_else(|| "none".to_string());

    out.push_str(&format!("Node:        {} ({})\n", status.node_id, status.addr));
    out.push_str(&format!("Role:        {}\n", status.state));
    out.push_str(&format!("Leader:      {}\n", leader));
    out.push_str(&format!("Term:        {}\n", status.term));
    out.push_str(&format!(
        "Applied:     {}\n",
        status
            .last_applied
            .map(|i| i.to_string())
            .unwrap_or_else(|| "-".to_string())
    ));
    out.push_str(&format!("Operational: {}\n", status.operational));
    out.push_str(&format!(
        "State:       {} monitors, {} assignments, {} history records\n",
        status.summary.monitors, status.summary.assignments, status.summary.history_records
    ));

    out.push_str("\nMembers:\n");
    for member in &status.members {
        out.push_str(&format!(
            "  {:>4}  {:<24} {:<11} load {:.2}{}\n",
            member.node_id,
            member.addr,
            if member.available { "available" } else { "unavailable" },
            member.load,
            if member.is_leader { "  (leader)" } else { "" },
        ));
    }

    out.push_str(&format!("\nActive tasks: {}\n", status.active_tasks.len()));
    for task in &status.active_tasks {
        out.push_str(&format!(
            "  {}  v{}  {}\n",
            task.monitor_id, task.monitor_version, task.assignment_id
        ));
    }
    out
}
