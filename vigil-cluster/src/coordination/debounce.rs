//! Trailing-edge debouncer.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct Pending {
    handle: JoinHandle<()>,
    fired: Arc<AtomicBool>,
}

/// Collapses a burst of triggers into one run, `delay` after the last one.
///
/// Runs never overlap: a run that starts while the previous one is still
/// going waits for it. A run that has already fired is never cancelled by a
/// later trigger.
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<Pending>>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Debouncer {
    /// Create a debouncer with the given quiet period.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Schedule `run`, replacing a scheduled run that has not fired yet.
    pub fn trigger<F, Fut>(&self, run: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fired = Arc::new(AtomicBool::new(false));
        let delay = self.delay;
        let run_lock = Arc::clone(&self.run_lock);
        let flag = Arc::clone(&fired);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            flag.store(true, Ordering::SeqCst);
            let _guard = run_lock.lock().await;
            run().await;
        });

        let previous = self.pending.lock().replace(Pending { handle, fired });
        if let Some(previous) = previous {
            if !previous.fired.load(Ordering::SeqCst) {
                previous.handle.abort();
            }
        }
    }

    /// Drop a scheduled run that has not fired yet.
    pub fn cancel(&self) {
        if let Some(pending) = self.pending.lock().take() {
            if !pending.fired.load(Ordering::SeqCst) {
                pending.handle.abort();
            }
        }
    }

    /// Whether a run is scheduled and has not fired yet.
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|p| !p.fired.load(Ordering::SeqCst) && !p.handle.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> + Send {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_run() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            debouncer.trigger(counting(&runs));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(debouncer.is_pending());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn separated_bursts_run_twice() {
        let debouncer = Debouncer::new(Duration::from_millis(200));
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.trigger(counting(&runs));
        debouncer.trigger(counting(&runs));
        tokio::time::sleep(Duration::from_millis(300)).await;

        debouncer.trigger(counting(&runs));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_the_pending_run() {
        let debouncer = Debouncer::new(Duration::from_millis(200));
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.trigger(counting(&runs));
        debouncer.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fired_run_is_not_aborted() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let finished = Arc::new(AtomicUsize::new(0));

        let done = Arc::clone(&finished);
        debouncer.trigger(move || async move {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            done.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Replaces the schedule while the first run is mid-flight.
        debouncer.trigger(counting(&finished));
        tokio::time::sleep(Duration::from_millis(2_000)).await;

        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }
}
