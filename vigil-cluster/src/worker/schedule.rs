//! Wall-clock aligned check schedule.
//!
//! Due instants are the top of the UTC day plus a multiple of the interval,
//! so every node checking the same monitor runs on the same cadence and a
//! restarted task picks up the grid where it was.

use vigil_core::clock::{start_of_utc_day, DAY_MS};

/// First due instant at or after `now_ms`.
pub fn next_due(now_ms: u64, interval_ms: u64) -> u64 {
    let interval_ms = interval_ms.max(1);
    let day_start = start_of_utc_day(now_ms);
    let elapsed = now_ms - day_start;
    let due = day_start + elapsed.div_ceil(interval_ms) * interval_ms;
    // The next day's grid starts again at midnight.
    due.min(day_start + DAY_MS)
}

/// Due instant following `due_ms`.
///
/// Re-aligns on the next UTC day when the interval does not divide a day.
pub fn next_after(due_ms: u64, interval_ms: u64) -> u64 {
    next_due(due_ms + 1, interval_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60_000;

    #[test]
    fn aligns_to_interval_grid() {
        let day = 19_000 * DAY_MS;
        assert_eq!(next_due(day, MINUTE), day);
        assert_eq!(next_due(day + 1, MINUTE), day + MINUTE);
        assert_eq!(next_due(day + 90_000, MINUTE), day + 2 * MINUTE);
        assert_eq!(next_due(day + 2 * MINUTE, MINUTE), day + 2 * MINUTE);
    }

    #[test]
    fn advances_by_one_interval() {
        let day = 19_000 * DAY_MS;
        assert_eq!(next_after(day + 5 * MINUTE, MINUTE), day + 6 * MINUTE);
    }

    #[test]
    fn odd_interval_restarts_at_midnight() {
        let day = 19_000 * DAY_MS;
        let interval = 7 * MINUTE;
        let last = day + (DAY_MS / interval) * interval;

        assert!(last < day + DAY_MS);
        assert_eq!(next_after(last, interval), day + DAY_MS);
    }

    #[test]
    fn zero_interval_does_not_spin() {
        assert_eq!(next_due(10, 0), 10);
        assert_eq!(next_after(10, 0), 11);
    }
}
