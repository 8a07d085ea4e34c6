//! Wall-clock abstraction.
//!
//! Schedulers align checks to wall-clock instants (top of the UTC day plus a
//! multiple of the interval), so they need "now" in epoch milliseconds as
//! well as a way to sleep. Production code uses [`SystemClock`]; tests use
//! [`OffsetClock`], whose wall clock follows tokio's (pausable) timer.

use crate::error::{CoreError, Result};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Future returned by [`Clock::sleep`].
pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Milliseconds in one UTC day.
pub const DAY_MS: u64 = 86_400_000;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time as milliseconds since the UNIX epoch.
    fn now_ms(&self) -> u64;

    /// Sleep for the given duration.
    fn sleep(&self, duration: Duration) -> SleepFuture;

    /// Sleep until the wall clock reaches `at_ms`. Returns at once if it has.
    fn sleep_until_ms(&self, at_ms: u64) -> SleepFuture {
        let now = self.now_ms();
        if at_ms <= now {
            return Box::pin(std::future::ready(()));
        }
        self.sleep(Duration::from_millis(at_ms - now))
    }
}

/// Real clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    fn sleep(&self, duration: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Clock anchored at a fixed epoch that advances with tokio's timer.
///
/// Under `#[tokio::test(start_paused = true)]` the wall clock only moves when
/// the runtime auto-advances or `tokio::time::advance` is called.
#[derive(Debug, Clone)]
pub struct OffsetClock {
    epoch_ms: u64,
    started: tokio::time::Instant,
}

impl OffsetClock {
    /// Create a clock that reads `epoch_ms` right now.
    pub fn starting_at(epoch_ms: u64) -> Self {
        Self {
            epoch_ms,
            started: tokio::time::Instant::now(),
        }
    }

    /// Create a clock starting at an RFC 3339 instant.
    ///
    /// ```
    /// use vigil_core::{Clock, OffsetClock};
    ///
    /// let clock = OffsetClock::fixed("2024-01-15T10:30:00Z").unwrap();
    /// assert_eq!(clock.now_ms() % 1_000, 0);
    /// ```
    pub fn fixed(rfc3339: &str) -> Result<Self> {
        let parsed = chrono::DateTime::parse_from_rfc3339(rfc3339).map_err(|e| {
            CoreError::InvalidTimestamp {
                input: rfc3339.to_string(),
                cause: e.to_string(),
            }
        })?;
        let millis = parsed.timestamp_millis();
        if millis < 0 {
            return Err(CoreError::InvalidTimestamp {
                input: rfc3339.to_string(),
                cause: "before the UNIX epoch".to_string(),
            });
        }
        Ok(Self::starting_at(millis as u64))
    }
}

impl Clock for OffsetClock {
    fn now_ms(&self) -> u64 {
        self.epoch_ms + self.started.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Start of the UTC day containing `at_ms`.
pub fn start_of_utc_day(at_ms: u64) -> u64 {
    at_ms - at_ms % DAY_MS
}
