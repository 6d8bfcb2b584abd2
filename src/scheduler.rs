//! Bus clock and timers.
//!
//! Bus time is a monotonic millisecond `f64` measured from scheduler creation. All
//! timers run on `tokio::time`, so a paused test runtime drives the whole engine
//! deterministically.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Handle to a pending timeout or interval.
///
/// Dropping the handle leaves the timer running; call [`TimerHandle::cancel`] to stop it.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Stop the timer. Cancelling twice is a no-op.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Monotonic clock plus delayed and periodic callbacks.
pub trait Scheduler: Send + Sync {
    /// Milliseconds since the scheduler was created.
    fn timestamp(&self) -> f64;

    /// Run `callback` once after `delay`.
    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerHandle;

    /// Run `callback` every `period`, first after one period.
    fn set_interval(&self, period: Duration, callback: Box<dyn FnMut() + Send>) -> TimerHandle;
}

/// [`Scheduler`] over the tokio timer wheel. Must be used inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    origin: Instant,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    /// Instant corresponding to bus time `timestamp`.
    pub fn instant_at(&self, timestamp: f64) -> Instant {
        self.origin + Duration::from_secs_f64(timestamp.max(0.0) / 1000.0)
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn timestamp(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }

    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => trace!("timeout cancelled"),
                _ = tokio::time::sleep(delay) => callback(),
            }
        });
        TimerHandle { token }
    }

    fn set_interval(
        &self,
        period: Duration,
        mut callback: Box<dyn FnMut() + Send>,
    ) -> TimerHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => callback(),
                }
            }
        });
        TimerHandle { token }
    }
}

type Job = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DebounceState {
    Idle,
    Scheduled,
    Running { rerun: bool },
}

/// Coalesces bursts of triggers into single runs of an async job.
///
/// Triggers within `window` of the first one produce one run. A trigger that arrives
/// while the job is running schedules exactly one follow-up run.
pub struct Debouncer {
    state: Arc<Mutex<DebounceState>>,
    window: Duration,
    job: Job,
    token: CancellationToken,
}

impl Debouncer {
    pub fn new<F, Fut>(window: Duration, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(DebounceState::Idle)),
            window,
            job: Arc::new(move || Box::pin(job())),
            token: CancellationToken::new(),
        }
    }

    pub fn trigger(&self) {
        let mut state = self.state.lock();
        match *state {
            DebounceState::Idle => {
                *state = DebounceState::Scheduled;
                drop(state);
                self.spawn_runner();
            }
            DebounceState::Scheduled => {}
            DebounceState::Running { .. } => *state = DebounceState::Running { rerun: true },
        }
    }

    /// Whether a run is scheduled or in progress.
    pub fn is_pending(&self) -> bool {
        *self.state.lock() != DebounceState::Idle
    }

    fn spawn_runner(&self) {
        let state = self.state.clone();
        let job = self.job.clone();
        let window = self.window;
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(window) => {}
                }
                *state.lock() = DebounceState::Running { rerun: false };
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = job() => {}
                }
                let mut guard = state.lock();
                if *guard == (DebounceState::Running { rerun: true }) {
                    *guard = DebounceState::Scheduled;
                } else {
                    *guard = DebounceState::Idle;
                    return;
                }
            }
        });
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("window", &self.window)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn timestamp_follows_paused_clock() {
        let scheduler = TokioScheduler::new();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let ts = scheduler.timestamp();
        assert!((ts - 250.0).abs() < 1.0, "{ts}");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_cancel_is_idempotent() {
        let scheduler = TokioScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        scheduler.set_timeout(Duration::from_millis(20), Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let h = hits.clone();
        let cancelled = scheduler.set_timeout(Duration::from_millis(20), Box::new(move || {
            h.fetch_add(100, Ordering::SeqCst);
        }));
        cancelled.cancel();
        cancelled.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(cancelled.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn interval_repeats_until_cancelled() {
        let scheduler = TokioScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = scheduler.set_interval(Duration::from_millis(10), Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(35)).await;
        handle.cancel();
        let seen = hits.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn debouncer_coalesces_bursts() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let debouncer = Debouncer::new(Duration::from_millis(200), move || {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });

        for _ in 0..5 {
            debouncer.trigger();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_during_run_schedules_one_follow_up() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let debouncer = Arc::new(Debouncer::new(Duration::from_millis(100), move || {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }));

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        debouncer.trigger();
        debouncer.trigger();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
