//! Distributed coordination for vigil.
//!
//! Every node holds a Raft-replicated copy of the monitors, incidents,
//! status pages, notification providers, task assignments and status
//! history. The leader decides which nodes check which monitors; every node
//! runs the checks it was assigned and reports results back into the log.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        vigil cluster                         │
//! │                                                              │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐    │
//! │  │    Node 1    │    │    Node 2    │    │    Node 3    │    │
//! │  │   (Leader)   │    │  (Follower)  │    │  (Follower)  │    │
//! │  │ ┌──────────┐ │    │ ┌──────────┐ │    │ ┌──────────┐ │    │
//! │  │ │   Raft   │◄┼────┼─┤   Raft   │◄┼────┼─┤   Raft   │ │    │
//! │  │ └────┬─────┘ │    │ └────┬─────┘ │    │ └────┬─────┘ │    │
//! │  │ ┌────▼─────┐ │    │ ┌────▼─────┐ │    │ ┌────▼─────┐ │    │
//! │  │ │  State   │ │    │ │  State   │ │    │ │  State   │ │    │
//! │  │ │ Machine  │ │    │ │ Machine  │ │    │ │ Machine  │ │    │
//! │  │ └────┬─────┘ │    │ └────┬─────┘ │    │ └────┬─────┘ │    │
//! │  │ ┌────▼─────┐ │    │ ┌────▼─────┐ │    │ ┌────▼─────┐ │    │
//! │  │ │  Worker  │ │    │ │  Worker  │ │    │ │  Worker  │ │    │
//! │  │ │  Engine  │ │    │ │  Engine  │ │    │ │  Engine  │ │    │
//! │  │ └──────────┘ │    │ └──────────┘ │    │ └──────────┘ │    │
//! │  └──────────────┘    └──────────────┘    └──────────────┘    │
//! │   coordination                                               │
//! │   notifications                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use vigil_cluster::{ClusterConfig, Command, NodeRuntime};
//!
//! let config = ClusterConfig::builder()
//!     .node_id(1)
//!     .listen_addr("127.0.0.1:7400")
//!     .cluster_key("secret")
//!     .bootstrap(true)
//!     .build()?;
//!
//! let runtime = NodeRuntime::start(config).await?;
//!
//! // Routed to the leader wherever it is.
//! runtime.node().execute(Command::CreateMonitor { monitor }).await?;
//! ```

#![warn(missing_docs)]

pub mod command;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod membership;
pub mod network;
pub mod raft;
pub mod runtime;
pub mod state;
pub mod timeline;
pub mod types;
pub mod worker;

pub use command::{ClusterRequest, Command};
pub use config::ClusterConfig;
pub use error::{ClusterError, ClusterResult};
pub use events::{ClusterEvent, EventBus};
pub use membership::{Member, MembershipView};
pub use network::{RpcServer, ServerHandle};
pub use raft::{ClusterNode, NodeStatus};
pub use runtime::{NodeRuntime, RuntimeBuilder};
pub use state::{ClusterResponse, ClusterStateMachine, ReplicatedState, SnapshotBundle};
pub use timeline::{NotificationDispatcher, Notifier, StatusChange, TimelineService};
pub use types::{ClusterNodeId, MemberNode, TypeConfig};
pub use worker::{ActiveTask, Checker, CheckOutcome, WorkerEngine};
