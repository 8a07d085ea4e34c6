//! One running monitor assignment.
//!
//! ```text
//!  dispatcher ──(due instant, check handle)──► FIFO ──► consumer ──► sink
//!      │ sleeps until due, spawns the check,          │ awaits checks in
//!      │ moves on to the next instant                 │ schedule order
//!      └──────────── cancel (watch) ──────────────────┘
//! ```
//!
//! Scheduling never waits for a check, so a slow target cannot delay the
//! next due instant. The consumer reports in scheduled order, stamped with
//! the scheduled instant rather than the moment confirmation ended.

use super::confirm::{check_with_confirmation, ConfirmedResult};
use super::schedule;
use super::Checker;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use vigil_core::{
    AssignmentId, Clock, Monitor, MonitorId, MonitorStatus, NodeId, StatusReport,
};

/// What the receiving side made of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportVerdict {
    /// The report was taken.
    Accepted,
    /// The assignment behind the report has been superseded; stop the task.
    Stale,
}

/// Destination of worker results.
pub trait ResultSink: Send + Sync {
    /// Hand over one confirmed result.
    fn report(&self, report: StatusReport) -> ReportVerdict;
}

/// Shared dependencies of every task on a node.
#[derive(Clone)]
pub struct TaskContext {
    /// Local node, stamped on reports.
    pub node_id: NodeId,
    /// Performs check attempts.
    pub checker: Arc<dyn Checker>,
    /// Receives results.
    pub sink: Arc<dyn ResultSink>,
    /// Wall clock driving the schedule.
    pub clock: Arc<dyn Clock>,
}

/// Lifecycle of a [`MonitorTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Scheduling and executing checks.
    Running,
    /// Cancelled, loops still winding down.
    Cancelling,
    /// Both loops have exited.
    Stopped,
}

struct Scheduled {
    due_ms: u64,
    check: JoinHandle<Option<ConfirmedResult>>,
}

/// A cancellable execution context for one (monitor, version).
pub struct MonitorTask {
    monitor_id: MonitorId,
    monitor_version: u64,
    assignment_id: Arc<Mutex<AssignmentId>>,
    cancel: Arc<watch::Sender<bool>>,
    dispatcher: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl MonitorTask {
    /// Start scheduling `monitor` under `assignment_id`.
    ///
    /// `previous` is the last known status, used to decide whether the first
    /// reading needs confirmation.
    pub fn start(
        monitor: Monitor,
        monitor_version: u64,
        assignment_id: AssignmentId,
        previous: MonitorStatus,
        context: TaskContext,
    ) -> Self {
        let monitor = Arc::new(monitor);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel_tx);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let assignment = Arc::new(Mutex::new(assignment_id));
        let last_status = Arc::new(Mutex::new(previous));

        tracing::info!(
            monitor_id = %monitor.id,
            monitor_version,
            assignment_id = %assignment_id,
            interval_secs = monitor.interval_secs,
            "monitor task started"
        );

        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&monitor),
            Arc::clone(&last_status),
            context.clone(),
            cancel_rx.clone(),
            queue_tx,
        ));
        let consumer = tokio::spawn(consume(
            Arc::clone(&monitor),
            monitor_version,
            Arc::clone(&assignment),
            last_status,
            context,
            Arc::clone(&cancel),
            cancel_rx,
            queue_rx,
        ));

        Self {
            monitor_id: monitor.id,
            monitor_version,
            assignment_id: assignment,
            cancel,
            dispatcher: Some(dispatcher),
            consumer: Some(consumer),
        }
    }

    /// Monitor being checked.
    pub fn monitor_id(&self) -> MonitorId {
        self.monitor_id
    }

    /// Monitor version being checked.
    pub fn monitor_version(&self) -> u64 {
        self.monitor_version
    }

    /// Assignment the reports are tagged with.
    pub fn assignment_id(&self) -> AssignmentId {
        *self.assignment_id.lock()
    }

    /// Tag further reports with a newer assignment naming the same work.
    pub fn reassign(&self, assignment_id: AssignmentId) {
        *self.assignment_id.lock() = assignment_id;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        let finished = |h: &Option<JoinHandle<()>>| h.as_ref().map_or(true, |h| h.is_finished());
        if finished(&self.dispatcher) && finished(&self.consumer) {
            TaskState::Stopped
        } else if *self.cancel.borrow() {
            TaskState::Cancelling
        } else {
            TaskState::Running
        }
    }

    /// Whether the task was cancelled, by its owner or by a stale verdict.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Signal cancellation without waiting.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Cancel and wait until both loops have exited.
    ///
    /// No report is delivered once this returns.
    pub async fn stop(mut self) {
        self.cancel();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.await;
        }
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.await;
        }
        tracing::info!(
            monitor_id = %self.monitor_id,
            monitor_version = self.monitor_version,
            "monitor task stopped"
        );
    }
}

impl Drop for MonitorTask {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

impl std::fmt::Debug for MonitorTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorTask")
            .field("monitor_id", &self.monitor_id)
            .field("monitor_version", &self.monitor_version)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Resolves once cancellation is signalled or the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

async fn dispatch(
    monitor: Arc<Monitor>,
    last_status: Arc<Mutex<MonitorStatus>>,
    context: TaskContext,
    mut cancel: watch::Receiver<bool>,
    queue: mpsc::UnboundedSender<Scheduled>,
) {
    let interval_ms = monitor.interval().as_millis() as u64;
    let mut due_ms = schedule::next_due(context.clock.now_ms(), interval_ms);

    loop {
        tokio::select! {
            _ = context.clock.sleep_until_ms(due_ms) => {}
            _ = cancelled(&mut cancel) => break,
        }
        if *cancel.borrow() {
            break;
        }

        let previous = *last_status.lock();
        let check = tokio::spawn(run_check(
            Arc::clone(&monitor),
            previous,
            Arc::clone(&context.checker),
            Arc::clone(&context.clock),
            cancel.clone(),
        ));
        if queue.send(Scheduled { due_ms, check }).is_err() {
            break;
        }
        due_ms = schedule::next_after(due_ms, interval_ms);
    }
}

async fn run_check(
    monitor: Arc<Monitor>,
    previous: MonitorStatus,
    checker: Arc<dyn Checker>,
    clock: Arc<dyn Clock>,
    mut cancel: watch::Receiver<bool>,
) -> Option<ConfirmedResult> {
    tokio::select! {
        result = check_with_confirmation(checker.as_ref(), &monitor, previous, clock.as_ref()) => Some(result),
        _ = cancelled(&mut cancel) => None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn consume(
    monitor: Arc<Monitor>,
    monitor_version: u64,
    assignment: Arc<Mutex<AssignmentId>>,
    last_status: Arc<Mutex<MonitorStatus>>,
    context: TaskContext,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel: watch::Receiver<bool>,
    mut queue: mpsc::UnboundedReceiver<Scheduled>,
) {
    while let Some(scheduled) = queue.recv().await {
        let result = match scheduled.check.await {
            Ok(Some(result)) => result,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(monitor_id = %monitor.id, error = %e, "check task failed");
                continue;
            }
        };
        if *cancel.borrow() {
            break;
        }

        *last_status.lock() = result.outcome.status;
        let report = StatusReport {
            monitor_id: monitor.id,
            monitor_version,
            assignment_id: *assignment.lock(),
            node_id: context.node_id,
            timestamp_ms: scheduled.due_ms,
            status: result.outcome.status,
            latency_ms: result.outcome.latency_ms,
            attempts: result.attempts,
            message: result.outcome.message,
        };
        tracing::debug!(
            monitor_id = %monitor.id,
            at = report.timestamp_ms,
            status = %report.status,
            attempts = report.attempts,
            "check completed"
        );

        if context.sink.report(report) == ReportVerdict::Stale {
            tracing::info!(
                monitor_id = %monitor.id,
                monitor_version,
                "assignment superseded, cancelling task"
            );
            cancel_tx.send_replace(true);
            break;
        }
    }

    // Checks still queued see the cancellation and finish on their own.
    queue.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::check::{CheckFuture, CheckOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use vigil_core::clock::DAY_MS;
    use vigil_core::{MonitorKind, OffsetClock};

    /// Answers after a fixed delay with a fixed status.
    struct Delayed {
        delay: Duration,
        status: MonitorStatus,
        calls: AtomicUsize,
    }

    impl Checker for Delayed {
        fn check<'a>(&'a self, _monitor: &'a Monitor) -> CheckFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                CheckOutcome {
                    status: self.status,
                    latency_ms: Some(self.delay.as_millis() as u64),
                    message: None,
                }
            })
        }
    }

    #[derive(Default)]
    struct Collect {
        reports: Mutex<Vec<StatusReport>>,
        stale_after: Option<usize>,
    }

    impl ResultSink for Collect {
        fn report(&self, report: StatusReport) -> ReportVerdict {
            let mut reports = self.reports.lock();
            reports.push(report);
            match self.stale_after {
                Some(limit) if reports.len() >= limit => ReportVerdict::Stale,
                _ => ReportVerdict::Accepted,
            }
        }
    }

    fn monitor() -> Monitor {
        let mut m = Monitor::new(
            "api",
            MonitorKind::Tcp {
                host: "localhost".into(),
                port: 80,
                degraded_after_ms: None,
            },
        );
        m.interval_secs = 60;
        m
    }

    fn context(checker: Arc<Delayed>, sink: Arc<Collect>, clock: Arc<OffsetClock>) -> TaskContext {
        TaskContext {
            node_id: 7,
            checker,
            sink,
            clock,
        }
    }

    const DAY: u64 = 19_000 * DAY_MS;

    #[tokio::test(start_paused = true)]
    async fn reports_are_stamped_with_scheduled_instants_in_order() {
        // Checks take longer than the interval, so they overlap.
        let checker = Arc::new(Delayed {
            delay: Duration::from_secs(90),
            status: MonitorStatus::Available,
            calls: AtomicUsize::new(0),
        });
        let sink = Arc::new(Collect::default());
        let clock = Arc::new(OffsetClock::starting_at(DAY + 30_000));

        let task = MonitorTask::start(
            monitor(),
            1,
            AssignmentId::new(),
            MonitorStatus::Unknown,
            context(Arc::clone(&checker), Arc::clone(&sink), clock),
        );

        tokio::time::sleep(Duration::from_secs(250)).await;
        task.stop().await;

        let reports = sink.reports.lock().clone();
        let stamps: Vec<u64> = reports.iter().map(|r| r.timestamp_ms - DAY).collect();
        assert_eq!(stamps, vec![60_000, 120_000, 180_000]);
        assert!(reports.iter().all(|r| r.node_id == 7 && r.monitor_version == 1));
        // Dispatch kept going while earlier checks were still running.
        assert_eq!(checker.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn no_report_after_stop() {
        let checker = Arc::new(Delayed {
            delay: Duration::from_secs(30),
            status: MonitorStatus::Available,
            calls: AtomicUsize::new(0),
        });
        let sink = Arc::new(Collect::default());
        let clock = Arc::new(OffsetClock::starting_at(DAY));

        let task = MonitorTask::start(
            monitor(),
            1,
            AssignmentId::new(),
            MonitorStatus::Unknown,
            context(checker, Arc::clone(&sink), clock),
        );

        // First check starts at once and is still running.
        tokio::time::sleep(Duration::from_secs(10)).await;
        task.stop().await;
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert!(sink.reports.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_verdict_cancels_the_task() {
        let checker = Arc::new(Delayed {
            delay: Duration::from_millis(10),
            status: MonitorStatus::Available,
            calls: AtomicUsize::new(0),
        });
        let sink = Arc::new(Collect {
            reports: Mutex::new(Vec::new()),
            stale_after: Some(1),
        });
        let clock = Arc::new(OffsetClock::starting_at(DAY));

        let task = MonitorTask::start(
            monitor(),
            1,
            AssignmentId::new(),
            MonitorStatus::Unknown,
            context(checker, Arc::clone(&sink), clock),
        );

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(task.is_cancelled());
        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(sink.reports.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reassign_retags_reports() {
        let checker = Arc::new(Delayed {
            delay: Duration::from_millis(10),
            status: MonitorStatus::Available,
            calls: AtomicUsize::new(0),
        });
        let sink = Arc::new(Collect::default());
        let clock = Arc::new(OffsetClock::starting_at(DAY + 1));

        let first = AssignmentId::new();
        let second = AssignmentId::new();
        let task = MonitorTask::start(
            monitor(),
            1,
            first,
            MonitorStatus::Unknown,
            context(checker, Arc::clone(&sink), clock),
        );
        assert_eq!(task.state(), TaskState::Running);

        tokio::time::sleep(Duration::from_secs(61)).await;
        task.reassign(second);
        tokio::time::sleep(Duration::from_secs(60)).await;
        task.stop().await;

        let ids: Vec<AssignmentId> = sink.reports.lock().iter().map(|r| r.assignment_id).collect();
        assert_eq!(ids, vec![first, second]);
    }
}
