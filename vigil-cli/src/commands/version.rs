//! Version command - report what this build speaks.

use anyhow::Result;
use serde::Serialize;
use vigil_cluster::network::{MessageType, LEADER_RPC_PATH, RPC_PATH};
use vigil_core::auth::CLUSTER_KEY_HEADER;

/// Build and protocol facts operators compare across nodes before a rolling
/// upgrade.
#[derive(Debug, Serialize)]
pub struct BuildInfo {
    version: &'static str,
    platform: String,
    rpc_paths: [&'static str; 2],
    key_header: &'static str,
    message_types: Vec<&'static str>,
}

impl BuildInfo {
    /// Facts about the running binary.
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
            rpc_paths: [RPC_PATH, LEADER_RPC_PATH],
            key_header: CLUSTER_KEY_HEADER,
            message_types: MessageType::ALL.iter().map(|t| t.as_str()).collect(),
        }
    }
}

/// Run the version command.
pub fn run(json: bool) -> Result<()> {
    let info = BuildInfo::current();
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("vigil {} ({})", info.version, info.platform);
    println!("rpc:      {}", info.rpc_paths.join(", "));
    println!("auth:     {} header", info.key_header);
    println!("messages: {}", info.message_types.join(" "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_info_lists_every_message_type() {
        let info = BuildInfo::current();
        assert_eq!(info.message_types.len(), MessageType::ALL.len());
        assert!(info.message_types.contains(&"AppendEntries"));
        assert_eq!(info.rpc_paths[1], "/cluster/rpc/leader");
    }

    #[test]
    fn build_info_serializes() {
        let json = serde_json::to_value(BuildInfo::current()).expect("serializable");
        assert_eq!(json["key_header"], "x-vigil-cluster-key");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }
}
