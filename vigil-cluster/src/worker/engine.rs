//! Per-node worker engine.
//!
//! Owns the table of running [`MonitorTask`]s, keyed by (monitor, version).
//! The table is only mutated from the engine's own event path; other
//! components read it through [`WorkerEngine::active_tasks`].

use super::task::{MonitorTask, TaskContext};
use crate::command::Command;
use crate::events::ClusterEvent;
use crate::network::TaskReport;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vigil_core::{AssignmentId, Monitor, MonitorId, MonitorStatus, TaskAssignment};

type TaskKey = (MonitorId, u64);

/// Read access to replicated configuration the engine depends on.
pub trait MonitorCatalog: Send + Sync {
    /// Current definition of a monitor.
    fn monitor(&self, monitor_id: MonitorId) -> Option<Monitor>;

    /// Latest known status, pending readings included.
    fn latest_status(&self, monitor_id: MonitorId) -> MonitorStatus;

    /// Latest replicated assignment of every monitor.
    fn assignments(&self) -> Vec<TaskAssignment>;
}

/// A task running on a node, as reported by `Status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTask {
    /// Monitor being checked.
    pub monitor_id: MonitorId,
    /// Monitor version being checked.
    pub monitor_version: u64,
    /// Assignment the task runs under.
    pub assignment_id: AssignmentId,
}

/// Runs the monitor tasks assigned to the local node.
pub struct WorkerEngine {
    catalog: Arc<dyn MonitorCatalog>,
    context: TaskContext,
    tasks: Mutex<HashMap<TaskKey, MonitorTask>>,
    /// Newest assignment seen per monitor.
    latest: Mutex<HashMap<MonitorId, TaskAssignment>>,
    /// Assignments received before the node became operational.
    buffered: Mutex<HashMap<MonitorId, TaskAssignment>>,
    operational: AtomicBool,
}

impl WorkerEngine {
    /// Create an engine. It buffers assignments until
    /// [`become_operational`](Self::become_operational) is called.
    pub fn new(catalog: Arc<dyn MonitorCatalog>, context: TaskContext) -> Self {
        Self {
            catalog,
            context,
            tasks: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
            buffered: Mutex::new(HashMap::new()),
            operational: AtomicBool::new(false),
        }
    }

    /// Whether assignments are applied as they arrive.
    pub fn is_operational(&self) -> bool {
        self.operational.load(Ordering::SeqCst)
    }

    /// Handle an assignment from the log.
    pub async fn handle_assignment(&self, assignment: TaskAssignment) {
        if !self.is_operational() {
            self.buffer(assignment);
            return;
        }
        self.apply(assignment).await;
    }

    /// Start applying assignments, beginning with the newest buffered one
    /// per monitor.
    pub async fn become_operational(&self) {
        if self.operational.swap(true, Ordering::SeqCst) {
            return;
        }
        let buffered: Vec<TaskAssignment> =
            std::mem::take(&mut *self.buffered.lock()).into_values().collect();
        tracing::info!(
            node_id = self.context.node_id,
            buffered = buffered.len(),
            "worker engine operational"
        );
        for assignment in buffered {
            self.apply(assignment).await;
        }
    }

    /// Reconcile running tasks with the replicated assignments.
    ///
    /// Used after a snapshot install or when events were missed.
    pub async fn resync(&self) {
        let assignments = self.catalog.assignments();
        if !self.is_operational() {
            for assignment in assignments {
                self.buffer(assignment);
            }
            return;
        }

        let node_id = self.context.node_id;
        let wanted: HashSet<TaskKey> = assignments
            .iter()
            .filter(|a| a.includes(node_id))
            .map(|a| (a.monitor_id, a.monitor_version))
            .collect();
        let retired = self.take_tasks(|key, _| !wanted.contains(key));
        stop_all(retired).await;

        let known: HashSet<MonitorId> = assignments.iter().map(|a| a.monitor_id).collect();
        self.latest.lock().retain(|id, _| known.contains(id));

        tracing::debug!(
            node_id,
            assignments = assignments.len(),
            "worker engine resynchronised"
        );
        for assignment in assignments {
            self.apply(assignment).await;
        }
    }

    /// Stop every task of `monitor_id`.
    pub async fn retire_monitor(&self, monitor_id: MonitorId) {
        let retired = self.take_tasks(|key, _| key.0 == monitor_id);
        stop_all(retired).await;
    }

    /// Stop every task and buffer nothing more.
    pub async fn shutdown(&self) {
        self.operational.store(false, Ordering::SeqCst);
        let retired = self.take_tasks(|_, _| true);
        stop_all(retired).await;
    }

    /// Tasks currently running.
    pub fn active_tasks(&self) -> Vec<ActiveTask> {
        let mut active: Vec<ActiveTask> = self
            .tasks
            .lock()
            .values()
            .filter(|task| !task.is_cancelled())
            .map(|task| ActiveTask {
                monitor_id: task.monitor_id(),
                monitor_version: task.monitor_version(),
                assignment_id: task.assignment_id(),
            })
            .collect();
        active.sort_by_key(|t| (t.monitor_id, t.monitor_version));
        active
    }

    /// Whether a live task checks `monitor_id`.
    pub fn has_task(&self, monitor_id: MonitorId) -> bool {
        self.tasks
            .lock()
            .iter()
            .any(|(key, task)| key.0 == monitor_id && !task.is_cancelled())
    }

    /// Number of assignments waiting for the node to become operational.
    pub fn buffered_len(&self) -> usize {
        self.buffered.lock().len()
    }

    /// Follow cluster events until `shutdown` flips.
    ///
    /// `operational` is the node's state at subscription time, since the
    /// catch-up event may have been published before.
    pub fn spawn(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<ClusterEvent>,
        operational: bool,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if operational {
                engine.become_operational().await;
                engine.resync().await;
            }
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => engine.on_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "worker engine lagged, resynchronising");
                            engine.resync().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            engine.shutdown().await;
        })
    }

    async fn on_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::ReplicationCaughtUp => {
                self.become_operational().await;
                self.resync().await;
            }
            ClusterEvent::SnapshotInstalled { .. } => self.resync().await,
            ClusterEvent::CommandCommitted { command, .. } => match command.as_ref() {
                Command::AssignTasks { assignments } => {
                    for assignment in assignments {
                        self.handle_assignment(assignment.clone()).await;
                    }
                }
                Command::DeleteMonitor { monitor_id } => {
                    self.latest.lock().remove(monitor_id);
                    self.buffered.lock().remove(monitor_id);
                    self.retire_monitor(*monitor_id).await;
                }
                Command::UpdateMonitor { monitor } if !monitor.enabled => {
                    self.retire_monitor(monitor.id).await;
                }
                Command::RestoreSnapshot { .. } => self.resync().await,
                _ => {}
            },
            _ => {}
        }
    }

    fn buffer(&self, assignment: TaskAssignment) {
        let mut buffered = self.buffered.lock();
        let keep_existing = buffered
            .get(&assignment.monitor_id)
            .is_some_and(|existing| !assignment.is_newer_than(existing));
        if !keep_existing {
            tracing::debug!(
                monitor_id = %assignment.monitor_id,
                assignment_id = %assignment.id,
                "buffering assignment until operational"
            );
            buffered.insert(assignment.monitor_id, assignment);
        }
    }

    async fn apply(&self, assignment: TaskAssignment) {
        let node_id = self.context.node_id;
        {
            let mut latest = self.latest.lock();
            if let Some(known) = latest.get(&assignment.monitor_id) {
                if assignment.is_older_than(known) {
                    tracing::debug!(
                        monitor_id = %assignment.monitor_id,
                        assignment_id = %assignment.id,
                        "ignoring superseded assignment"
                    );
                    return;
                }
            }
            latest.insert(assignment.monitor_id, assignment.clone());
        }

        let monitor_id = assignment.monitor_id;
        let version = assignment.monitor_version;
        let assigned = assignment.includes(node_id);
        let retired = self.take_tasks(|key, task| {
            key.0 == monitor_id && (key.1 != version || !assigned || task.is_cancelled())
        });
        stop_all(retired).await;

        if !assigned {
            return;
        }

        let key = (monitor_id, version);
        if let Some(task) = self.tasks.lock().get(&key) {
            task.reassign(assignment.id);
            return;
        }

        let Some(monitor) = self.catalog.monitor(monitor_id) else {
            tracing::debug!(%monitor_id, "monitor no longer exists, skipping assignment");
            return;
        };
        if monitor.version != version || !monitor.enabled {
            tracing::debug!(
                %monitor_id,
                assigned_version = version,
                current_version = monitor.version,
                enabled = monitor.enabled,
                "assignment does not match the current monitor, skipping"
            );
            return;
        }

        let previous = self.catalog.latest_status(monitor_id);
        let task = MonitorTask::start(monitor, version, assignment.id, previous, self.context.clone());
        self.tasks.lock().insert(key, task);
    }

    fn take_tasks(&self, mut select: impl FnMut(&TaskKey, &MonitorTask) -> bool) -> Vec<MonitorTask> {
        let mut tasks = self.tasks.lock();
        let keys: Vec<TaskKey> = tasks
            .iter()
            .filter(|(key, task)| select(key, task))
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter().filter_map(|key| tasks.remove(&key)).collect()
    }
}

impl TaskReport for WorkerEngine {
    fn active_tasks(&self) -> Vec<ActiveTask> {
        WorkerEngine::active_tasks(self)
    }
}

async fn stop_all(tasks: Vec<MonitorTask>) {
    for task in tasks {
        task.stop().await;
    }
}
