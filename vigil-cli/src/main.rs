//! vigil CLI - run and operate cluster nodes.

mod commands;
mod logging;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::serve::ServeOptions;
use logging::LoggingConfig;
use std::path::PathBuf;

/// vigil - clustered uptime monitoring.
#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cluster node
    Serve {
        /// Path to the node's YAML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Stable node id
        #[arg(long)]
        node_id: Option<u64>,

        /// Address to listen on for cluster RPC
        #[arg(short, long)]
        listen: Option<String>,

        /// Address other nodes use to reach this one
        #[arg(long)]
        advertise: Option<String>,

        /// Shared cluster key
        #[arg(long, env = "VIGIL_CLUSTER_KEY", hide_env_values = true)]
        cluster_key: Option<String>,

        /// Peer to contact when joining (repeatable)
        #[arg(short, long = "peer")]
        peers: Vec<String>,

        /// Tag used for assignment affinity (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Start a new cluster if no peer answers
        #[arg(long)]
        bootstrap: bool,

        /// Directory for the consensus log
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Leave the cluster on Ctrl+C
        #[arg(long)]
        leave_on_exit: bool,
    },

    /// Show a node's view of the cluster
    Status {
        /// Node address
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        addr: String,

        /// Shared cluster key
        #[arg(long, env = "VIGIL_CLUSTER_KEY", hide_env_values = true)]
        cluster_key: String,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Ask a node to leave the cluster
    Leave {
        /// Address of the node that leaves
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        addr: String,

        /// Shared cluster key
        #[arg(long, env = "VIGIL_CLUSTER_KEY", hide_env_values = true)]
        cluster_key: String,
    },

    /// Evict a member from the cluster
    Remove {
        /// Id of the member to evict
        node_id: u64,

        /// Address of any reachable member
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        addr: String,

        /// Shared cluster key
        #[arg(long, env = "VIGIL_CLUSTER_KEY", hide_env_values = true)]
        cluster_key: String,
    },

    /// Show version and protocol information
    Version {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // `serve` reads its logging section from the node file first.
    if !matches!(cli.command, Commands::Serve { .. }) {
        logging::init(&LoggingConfig::default().with_env().with_verbosity(cli.verbose))?;
    }

    match cli.command {
        Commands::Serve {
            config,
            node_id,
            listen,
            advertise,
            cluster_key,
            peers,
            tags,
            bootstrap,
            data_dir,
            leave_on_exit,
        } => {
            commands::serve::run(
                ServeOptions {
                    config,
                    node_id,
                    listen,
                    advertise,
                    cluster_key,
                    peers,
                    tags,
                    bootstrap,
                    data_dir,
                    leave_on_exit,
                },
                cli.verbose,
            )
            .await
        }
        Commands::Status {
            addr,
            cluster_key,
            json,
        } => commands::status::run(&addr, &cluster_key, json).await,
        Commands::Leave { addr, cluster_key } => commands::leave::run(&addr, &cluster_key).await,
        Commands::Remove {
            node_id,
            addr,
            cluster_key,
        } => commands::remove::run(&addr, &cluster_key, node_id).await,
        Commands::Version { json } => commands::version::run(json),
    }
}
