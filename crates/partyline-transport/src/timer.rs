//! Repeating timers for pings, keepalives, and session ticks.
//!
//! Each timer is one spawned task that sleeps until its next deadline, runs
//! the tick closure, and schedules the following deadline. When a tick fires
//! late (the runtime was busy, or the closure was slow) the missed ticks are
//! skipped and the schedule restarts from now, so a stall never turns into a
//! burst of back-to-back pings.
//!
//! Dropping the [`RepeatingTimer`] cancels the task.

use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{trace, warn};

/// What a tick closure wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerFlow {
    Continue,
    Stop,
}

/// A cancel-on-drop handle to a periodic task.
#[derive(Debug)]
pub struct RepeatingTimer {
    name: &'static str,
    period: Duration,
    task: JoinHandle<()>,
}

impl RepeatingTimer {
    /// Spawns a timer whose first tick fires one `period` from now.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(name: &'static str, period: Duration, tick: F) -> Self
    where
        F: FnMut() -> TimerFlow + Send + 'static,
    {
        Self::spawn_with_jitter(name, period, Duration::ZERO, tick)
    }

    /// Like [`spawn`](Self::spawn), but delays the first tick by a random
    /// amount up to `max_jitter`, so timers created together do not fire in
    /// lockstep.
    pub fn spawn_with_jitter<F>(name: &'static str, period: Duration, max_jitter: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> TimerFlow + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let jitter = if max_jitter.is_zero() {
            Duration::ZERO
        } else {
            let us = rand::rng().random_range(0..max_jitter.as_micros().max(1) as u64);
            Duration::from_micros(us)
        };

        let task = tokio::spawn(async move {
            let mut next = Instant::now() + period + jitter;
            let mut count = 0u64;
            loop {
                time::sleep_until(next).await;
                let now = Instant::now();
                count += 1;

                let late_by = now.saturating_duration_since(next);
                next = if late_by > period / 10 {
                    let skipped = late_by.as_nanos() / period.as_nanos();
                    if skipped > 0 {
                        warn!(
                            timer = name,
                            tick = count,
                            skipped = skipped as u64,
                            "timer overrun, skipping ahead"
                        );
                    }
                    now + period
                } else {
                    next + period
                };

                trace!(timer = name, tick = count, "timer fired");
                if tick() == TimerFlow::Stop {
                    break;
                }
            }
        });

        Self { name, period, task }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the task has stopped, by `TimerFlow::Stop` or cancellation.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_every_period() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let _timer = RepeatingTimer::spawn("test", Duration::from_millis(50), move || {
            c.fetch_add(1, Ordering::SeqCst);
            TimerFlow::Continue
        });

        time::sleep(Duration::from_millis(175)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_stops_when_asked() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let timer = RepeatingTimer::spawn("test", Duration::from_millis(10), move || {
            if c.fetch_add(1, Ordering::SeqCst) == 1 {
                TimerFlow::Stop
            } else {
                TimerFlow::Continue
            }
        });

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(timer.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_timer_cancels_it() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let timer = RepeatingTimer::spawn("test", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
            TimerFlow::Continue
        });
        time::sleep(Duration::from_millis(15)).await;
        drop(timer);
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_delays_first_tick_within_bound() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let _timer = RepeatingTimer::spawn_with_jitter(
            "test",
            Duration::from_millis(100),
            Duration::from_millis(20),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                TimerFlow::Continue
            },
        );
        time::sleep(Duration::from_millis(99)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_millis(22)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
