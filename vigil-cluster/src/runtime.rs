//! Node runtime.
//!
//! Wires a [`ClusterNode`] to the services that run beside it: the RPC
//! server, the worker engine, the status timeline, task coordination,
//! notification dispatch and the liveness prober. Everything spawned here
//! stops on the same shutdown signal.

use crate::config::ClusterConfig;
use crate::coordination::CoordinationService;
use crate::error::{ClusterError, ClusterResult};
use crate::membership::spawn_liveness_prober;
use crate::network::{RpcServer, ServerHandle};
use crate::raft::ClusterNode;
use crate::timeline::{NotificationDispatcher, Notifier, TimelineService, WebhookNotifier};
use crate::worker::{Checker, MonitorCatalog, NetworkChecker, TaskContext, WorkerEngine};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vigil_core::{Clock, Monitor, MonitorId, MonitorStatus, SystemClock, TaskAssignment};

/// Reads monitors and assignments from the local replica.
struct ReplicaCatalog {
    node: Arc<ClusterNode>,
    timeline: Arc<TimelineService>,
}

impl MonitorCatalog for ReplicaCatalog {
    fn monitor(&self, monitor_id: MonitorId) -> Option<Monitor> {
        self.node
            .state_machine()
            .read(|state| state.monitor(monitor_id).cloned())
    }

    fn latest_status(&self, monitor_id: MonitorId) -> MonitorStatus {
        self.timeline.current_status(monitor_id)
    }

    fn assignments(&self) -> Vec<TaskAssignment> {
        self.node
            .state_machine()
            .read(|state| state.assignments().values().cloned().collect())
    }
}

/// Builder for a [`NodeRuntime`].
///
/// The defaults are the production ones; tests swap in a paused clock, a
/// scripted checker or a recording notifier.
pub struct RuntimeBuilder {
    config: ClusterConfig,
    clock: Arc<dyn Clock>,
    checker: Arc<dyn Checker>,
    notifier: Arc<dyn Notifier>,
}

impl RuntimeBuilder {
    /// Use `clock` for scheduling, leases and retention.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `checker` to probe monitored services.
    pub fn checker(mut self, checker: Arc<dyn Checker>) -> Self {
        self.checker = checker;
        self
    }

    /// Use `notifier` to deliver status changes.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Start the node and enter the cluster.
    ///
    /// A node with persisted state resumes where it left off. Otherwise it
    /// asks its peers to admit it and, when none answers and `bootstrap` is
    /// set, initialises a new single-member cluster.
    pub async fn start(self) -> ClusterResult<NodeRuntime> {
        let RuntimeBuilder {
            config,
            clock,
            checker,
            notifier,
        } = self;

        let node = ClusterNode::start(config.clone()).await?;
        let timeline = TimelineService::new(Arc::clone(&node), Arc::clone(&clock));
        let catalog: Arc<dyn MonitorCatalog> = Arc::new(ReplicaCatalog {
            node: Arc::clone(&node),
            timeline: Arc::clone(&timeline),
        });
        let engine = Arc::new(WorkerEngine::new(
            catalog,
            TaskContext {
                node_id: node.node_id(),
                checker,
                sink: timeline.clone(),
                clock: Arc::clone(&clock),
            },
        ));
        let coordination = CoordinationService::new(Arc::clone(&node), Arc::clone(&clock));
        let notifications = NotificationDispatcher::new(Arc::clone(&node), notifier);

        let server = RpcServer::new(Arc::clone(&node))
            .with_task_report(engine.clone())
            .start()
            .await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // The engine subscribes before the join so it cannot miss the
        // catch-up event.
        let tasks = vec![
            engine.spawn(node.subscribe(), node.is_operational(), shutdown_rx.clone()),
            coordination.spawn(shutdown_rx.clone()),
            timeline.spawn(shutdown_rx.clone()),
            notifications.spawn(shutdown_rx.clone()),
            spawn_liveness_prober(
                Arc::clone(&node),
                config.membership.clone(),
                Arc::clone(&clock),
                shutdown_rx,
            ),
        ];

        let runtime = NodeRuntime {
            node,
            engine,
            timeline,
            coordination,
            notifications,
            local_addr: server.local_addr(),
            server: Mutex::new(Some(server)),
            shutdown_tx,
            tasks: Mutex::new(tasks),
        };

        if let Err(e) = runtime.enter_cluster().await {
            runtime.shutdown().await;
            return Err(e);
        }
        Ok(runtime)
    }
}

/// A running cluster node and its services.
pub struct NodeRuntime {
    node: Arc<ClusterNode>,
    engine: Arc<WorkerEngine>,
    timeline: Arc<TimelineService>,
    coordination: Arc<CoordinationService>,
    notifications: Arc<NotificationDispatcher>,
    local_addr: SocketAddr,
    server: Mutex<Option<ServerHandle>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeRuntime {
    /// Start building a runtime for `config`.
    pub fn builder(config: ClusterConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            clock: Arc::new(SystemClock),
            checker: Arc::new(NetworkChecker::default()),
            notifier: Arc::new(WebhookNotifier::new()),
        }
    }

    /// Start a runtime with production defaults.
    pub async fn start(config: ClusterConfig) -> ClusterResult<Self> {
        Self::builder(config).start().await
    }

    async fn enter_cluster(&self) -> ClusterResult<()> {
        let config = self.node.config();
        if self.node.has_state() {
            tracing::info!(node_id = self.node.node_id(), "resuming from persisted state");
            return Ok(());
        }

        let peers: Vec<String> = config
            .peers
            .iter()
            .filter(|p| p.as_str() != config.advertise_addr())
            .cloned()
            .collect();

        if !peers.is_empty() {
            match self.join_with_retry(&peers).await {
                Ok(()) => return Ok(()),
                Err(e) if config.bootstrap => {
                    tracing::warn!(error = %e, "no peer admitted us, bootstrapping");
                }
                Err(e) => return Err(e),
            }
        }

        if config.bootstrap {
            return self.node.initialize().await;
        }
        Err(ClusterError::Config(
            "no peers to join and bootstrap is disabled".to_string(),
        ))
    }

    async fn join_with_retry(&self, peers: &[String]) -> ClusterResult<()> {
        let rpc = &self.node.config().rpc;
        let mut backoff = Duration::from_millis(rpc.retry_backoff_ms);
        let mut attempt = 1;
        loop {
            match self.node.join(peers).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < rpc.retry_attempts => {
                    tracing::debug!(attempt, error = %e, "join failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The cluster node.
    pub fn node(&self) -> &Arc<ClusterNode> {
        &self.node
    }

    /// The worker engine.
    pub fn engine(&self) -> &Arc<WorkerEngine> {
        &self.engine
    }

    /// The status timeline.
    pub fn timeline(&self) -> &Arc<TimelineService> {
        &self.timeline
    }

    /// Task coordination.
    pub fn coordination(&self) -> &Arc<CoordinationService> {
        &self.coordination
    }

    /// Notification dispatch.
    pub fn notifications(&self) -> &Arc<NotificationDispatcher> {
        &self.notifications
    }

    /// Address the RPC server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Leave the cluster, then shut down.
    pub async fn leave(&self) -> ClusterResult<()> {
        self.node.leave().await?;
        self.shutdown().await;
        Ok(())
    }

    /// Stop every service, the server and finally the node.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.engine.shutdown().await;

        let server = self.server.lock().take();
        if let Some(mut server) = server {
            server.shutdown().await;
        }
        if let Err(e) = self.node.shutdown().await {
            tracing::warn!(error = %e, "node shutdown failed");
        }
    }
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("node", &self.node)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}
