//! Check-with-confirmation.

use super::check::{CheckOutcome, Checker};
use vigil_core::{Clock, Monitor, MonitorStatus};

/// Outcome of a scheduled check after confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedResult {
    /// Outcome of the last attempt.
    pub outcome: CheckOutcome,
    /// Attempts made, the first check included.
    pub attempts: u32,
}

impl ConfirmedResult {
    /// Confirmation attempts made after the first check.
    pub fn confirmations(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Whether a provisional reading must be re-checked before it is reported.
///
/// Only a failure following a good reading is confirmed. A first reading,
/// or more bad news, is reported as is.
pub fn needs_confirmation(previous: MonitorStatus, provisional: MonitorStatus) -> bool {
    previous.is_up() && !provisional.is_up()
}

/// Check `monitor`, then confirm a downgrade with up to `monitor.retries`
/// further checks after the first one.
///
/// A failure that never recovers therefore costs `retries + 1` checks, and
/// `retries = 0` reports the first reading as is. Confirmations wait
/// `retry_interval` each and stop at the first `Available` or `Degraded`
/// reading.
pub async fn check_with_confirmation(
    checker: &dyn Checker,
    monitor: &Monitor,
    previous: MonitorStatus,
    clock: &dyn Clock,
) -> ConfirmedResult {
    let mut outcome = checker.check(monitor).await;
    let mut attempts = 1;

    if !needs_confirmation(previous, outcome.status) {
        return ConfirmedResult { outcome, attempts };
    }

    for _ in 0..monitor.retries {
        clock.sleep(monitor.retry_interval()).await;
        outcome = checker.check(monitor).await;
        attempts += 1;
        if outcome.status.is_up() {
            break;
        }
    }

    tracing::debug!(
        monitor_id = %monitor.id,
        attempts,
        status = %outcome.status,
        "confirmation finished"
    );
    ConfirmedResult { outcome, attempts }
}
