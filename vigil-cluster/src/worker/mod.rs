//! Worker execution engine.
//!
//! Every node runs one [`MonitorTask`] per (monitor, version) it is assigned.
//! A task schedules checks on a grid aligned to the UTC day, confirms
//! downgrades before reporting them, and hands results to a [`ResultSink`].
//!
//! # Components
//!
//! - [`WorkerEngine`]: follows assignments from the log, starts and retires tasks
//! - [`MonitorTask`]: dispatcher and consumer loops for one assignment
//! - [`Checker`]: a single attempt against the monitored service
//! - [`check_with_confirmation`]: re-checks a failure that follows a good reading

mod check;
mod confirm;
mod engine;
mod schedule;
mod task;

pub use check::{CheckFuture, CheckOutcome, Checker, NetworkChecker};
pub use confirm::{check_with_confirmation, needs_confirmation, ConfirmedResult};
pub use engine::{ActiveTask, MonitorCatalog, WorkerEngine};
pub use schedule::{next_after, next_due};
pub use task::{MonitorTask, ReportVerdict, ResultSink, TaskContext, TaskState};
