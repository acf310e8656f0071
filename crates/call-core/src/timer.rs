//! Call Timer.
//!
//! A local, one-second-resolution countdown. It never touches the store.
//! Starting a timer replaces the running one; stopping it invokes nothing.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const TICK: Duration = Duration::from_secs(1);

/// Countdown owned by one call.
#[derive(Debug, Default)]
pub struct CallTimer {
    current: Mutex<Option<CancellationToken>>,
}

impl CallTimer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count down from `duration_secs`.
    ///
    /// `on_tick(remaining)` runs after every elapsed second, including the
    /// final `0`; `on_expire` runs exactly once right after it. A zero
    /// duration expires on the first tick. Any running countdown is
    /// cancelled first.
    pub fn start<T, E>(&self, duration_secs: u64, mut on_tick: T, on_expire: E)
    where
        T: FnMut(u64) + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            if let Some(previous) = current.replace(token.clone()) {
                previous.cancel();
            }
        }

        let first_tick = Instant::now() + TICK;
        tokio::spawn(async move {
            let mut interval = interval_at(first_tick, TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            let mut remaining = duration_secs;
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        debug!(target: "call.timer", remaining = remaining, "Timer stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        remaining = remaining.saturating_sub(1);
                        on_tick(remaining);
                        if remaining == 0 {
                            token.cancel();
                            debug!(target: "call.timer", "Timer expired");
                            on_expire();
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Cancel the countdown without invoking any callback.
    pub fn stop(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(token) = current.take() {
                token.cancel();
            }
        }
    }

    /// Whether a countdown is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .map(|current| current.as_ref().is_some_and(|t| !t.is_cancelled()))
            .unwrap_or(false)
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Let spawned timer tasks observe the advanced clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<u64>>>, impl FnMut(u64) + Send + 'static) {
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ticks);
        (ticks, move |remaining| sink.lock().unwrap().push(remaining))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_each_second_then_expires_once() {
        let timer = CallTimer::new();
        let (ticks, on_tick) = recorder();
        let expired = Arc::new(AtomicU32::new(0));
        let expired_clone = Arc::clone(&expired);

        timer.start(3, on_tick, move || {
            expired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_running());

        for _ in 0..5 {
            tokio::time::advance(TICK).await;
            settle().await;
        }

        assert_eq!(*ticks.lock().unwrap(), vec![2, 1, 0]);
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_invokes_nothing() {
        let timer = CallTimer::new();
        let (ticks, on_tick) = recorder();
        let expired = Arc::new(AtomicU32::new(0));
        let expired_clone = Arc::clone(&expired);

        timer.start(2, on_tick, move || {
            expired_clone.fetch_add(1, Ordering::SeqCst);
        });
        timer.stop();
        for _ in 0..4 {
            tokio::time::advance(TICK).await;
            settle().await;
        }

        assert!(ticks.lock().unwrap().is_empty());
        assert_eq!(expired.load(Ordering::SeqCst), 0);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_running_countdown() {
        let timer = CallTimer::new();
        let (first_ticks, first_tick) = recorder();
        let first_expired = Arc::new(AtomicU32::new(0));
        let first_expired_clone = Arc::clone(&first_expired);
        timer.start(10, first_tick, move || {
            first_expired_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(TICK).await;
        settle().await;

        let (second_ticks, second_tick) = recorder();
        timer.start(2, second_tick, || {});
        for _ in 0..15 {
            tokio::time::advance(TICK).await;
            settle().await;
        }

        assert_eq!(*first_ticks.lock().unwrap(), vec![9]);
        assert_eq!(first_expired.load(Ordering::SeqCst), 0);
        assert_eq!(*second_ticks.lock().unwrap(), vec![1, 0]);
    }
}
