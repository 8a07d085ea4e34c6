//! Serve command - run a cluster node.

use crate::logging::{self, LoggingConfig};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use vigil_cluster::{ClusterConfig, NodeRuntime};

/// A node file: cluster settings plus the `logging:` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeFile {
    #[serde(flatten)]
    cluster: ClusterConfig,
    logging: LoggingConfig,
}

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Default, Clone)]
pub struct ServeOptions {
    /// YAML config file.
    pub config: Option<PathBuf>,
    /// Node id.
    pub node_id: Option<u64>,
    /// Listen address.
    pub listen: Option<String>,
    /// Advertised address.
    pub advertise: Option<String>,
    /// Shared cluster key.
    pub cluster_key: Option<String>,
    /// Peers to join; replaces the file's list when non-empty.
    pub peers: Vec<String>,
    /// Extra tags.
    pub tags: Vec<String>,
    /// Force bootstrap on.
    pub bootstrap: bool,
    /// Data directory.
    pub data_dir: Option<PathBuf>,
    /// Leave the cluster on Ctrl+C instead of just stopping.
    pub leave_on_exit: bool,
}

/// Load the node configuration: file first, then flags, then validation.
///
/// Also returns the file's logging section, before environment overrides.
pub fn load_config(options: &ServeOptions) -> Result<(ClusterConfig, LoggingConfig)> {
    let NodeFile {
        cluster: mut config,
        logging,
    } = match &options.config {
        Some(path) => read_node_file(path)?,
        None => NodeFile::default(),
    };

    if let Some(node_id) = options.node_id {
        config.node_id = node_id;
    }
    if let Some(listen) = &options.listen {
        config.listen_addr = listen.clone();
    }
    if let Some(advertise) = &options.advertise {
        config.advertise_addr = Some(advertise.clone());
    }
    if let Some(key) = &options.cluster_key {
        config.cluster_key = key.clone();
    }
    if !options.peers.is_empty() {
        config.peers = options.peers.clone();
    }
    config.tags.extend(options.tags.iter().cloned());
    if options.bootstrap {
        config.bootstrap = true;
    }
    if let Some(data_dir) = &options.data_dir {
        config.data_dir = data_dir.clone();
    }

    config.validate().context("Invalid node configuration")?;
    Ok((config, logging))
}

fn read_node_file(path: &Path) -> Result<NodeFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Run the serve command.
pub async fn run(options: ServeOptions, verbosity: u8) -> Result<()> {
    let (config, logging) = load_config(&options)?;
    logging::init(&logging.with_env().with_verbosity(verbosity))?;
    tracing::info!(
        node_id = config.node_id,
        listen = %config.listen_addr,
        peers = ?config.peers,
        bootstrap = config.bootstrap,
        "Starting vigil node"
    );

    let runtime = NodeRuntime::start(config)
        .await
        .context("Failed to start node")?;

    println!("vigil node {} listening on {}", runtime.node().node_id(), runtime.local_addr());
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    if options.leave_on_exit {
        runtime.leave().await.context("Failed to leave the cluster")?;
    } else {
        runtime.shutdown().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[test]
    fn file_values_are_loaded() {
        let file = write_yaml(
            r#"
node_id: 3
listen_addr: "127.0.0.1:7403"
cluster_key: "s3cret"
peers: ["127.0.0.1:7401"]
tags: ["eu"]
timeline:
  flush_interval_ms: 1000
logging:
  format: compact
  filter: "info,vigil_cluster=debug"
"#,
        );
        let options = ServeOptions {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let (config, logging) = load_config(&options).expect("valid config");
        assert_eq!(config.node_id, 3);
        assert_eq!(config.peers, vec!["127.0.0.1:7401".to_string()]);
        assert!(config.tags.contains("eu"));
        assert_eq!(config.timeline.flush_interval_ms, 1000);
        // Unset sections keep their defaults.
        assert_eq!(config.coordination.debounce_ms, 1_000);
        assert_eq!(logging.format, crate::logging::LogFormat::Compact);
        assert_eq!(logging.filter, "info,vigil_cluster=debug");
    }

    #[test]
    fn flags_override_the_file() {
        let file = write_yaml(
            r#"
node_id: 3
listen_addr: "127.0.0.1:7403"
cluster_key: "from-file"
peers: ["127.0.0.1:7401"]
"#,
        );
        let options = ServeOptions {
            config: Some(file.path().to_path_buf()),
            node_id: Some(5),
            cluster_key: Some("from-flag".into()),
            peers: vec!["127.0.0.1:7402".into()],
            tags: vec!["us".into()],
            bootstrap: true,
            ..Default::default()
        };

        let (config, logging) = load_config(&options).expect("valid config");
        assert_eq!(config.node_id, 5);
        // No section in the file leaves logging at its defaults.
        assert_eq!(logging, LoggingConfig::default());
        assert_eq!(config.cluster_key, "from-flag");
        assert_eq!(config.peers, vec!["127.0.0.1:7402".to_string()]);
        assert!(config.tags.contains("us"));
        assert!(config.bootstrap);
    }

    #[test]
    fn invalid_config_is_fatal() {
        let options = ServeOptions {
            node_id: Some(1),
            listen: Some("127.0.0.1:7400".into()),
            ..Default::default()
        };
        let err = load_config(&options).expect_err("missing key");
        assert!(err.to_string().contains("Invalid node configuration"));
    }

    #[test]
    fn unreadable_file_is_reported() {
        let options = ServeOptions {
            config: Some(PathBuf::from("/nonexistent/vigil.yaml")),
            ..Default::default()
        };
        let err = load_config(&options).expect_err("missing file");
        assert!(err.to_string().contains("Failed to read"));
    }
}
