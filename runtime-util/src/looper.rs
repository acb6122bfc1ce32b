//! Runs a unit of work on an interval, backing off exponentially on
//! consecutive failures and resetting as soon as one succeeds.
//!
//! Grounded on the ticker-driven background tasks in
//! `integration-gateway/src/usage.rs` (`spawn_background_tasks`),
//! generalized with backoff and prompt cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exponential backoff schedule applied after a failed work invocation.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    fn new(policy: BackoffPolicy) -> Self {
        let current = policy.initial;
        Self { policy, current }
    }

    fn reset(&mut self) {
        self.current = self.policy.initial;
    }

    /// Returns the wait to apply now, then advances the schedule.
    fn advance(&mut self) -> Duration {
        let wait = self.current;
        self.current = self.current.mul_f64(self.policy.multiplier).min(self.policy.max);
        wait
    }
}

/// Spawns a looper task and returns its join handle.
///
/// `work` runs once per tick. On `Err`, `on_error` is consulted: returning
/// `true` terminates the loop (used to signal "shutting down" without the
/// caller having to inspect the error type), returning `false` backs off
/// and retries. Cancelling `cancel` stops the loop promptly, including
/// mid-backoff sleep.
pub struct Looper;

impl Looper {
    pub fn spawn<F, Fut, E, H>(
        interval: Duration,
        backoff: BackoffPolicy,
        cancel: CancellationToken,
        mut work: F,
        mut on_error: H,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: std::fmt::Display + Send + 'static,
        H: FnMut(&E) -> bool + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut backoff_state = Backoff::new(backoff);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                match work().await {
                    Ok(()) => backoff_state.reset(),
                    Err(err) => {
                        warn!(error = %err, "looper work failed");
                        if on_error(&err) {
                            return;
                        }
                        let wait = backoff_state.advance();
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn resets_backoff_after_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fails_then_succeeds = calls.clone();
        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();

        let handle = Looper::spawn(
            Duration::from_millis(10),
            BackoffPolicy {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(40),
                multiplier: 2.0,
            },
            cancel_for_task,
            move || {
                let calls = fails_then_succeeds.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("boom")
                    } else {
                        Ok(())
                    }
                }
            },
            |_err: &&str| false,
        );

        tokio::time::advance(Duration::from_millis(200)).await;
        cancel.cancel();
        let _ = handle.await;
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn on_error_can_terminate_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();

        let handle = Looper::spawn(
            Duration::from_millis(10),
            BackoffPolicy::default(),
            cancel.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), &str>("shutting down")
                }
            },
            |_err: &&str| true,
        );

        tokio::time::advance(Duration::from_secs(5)).await;
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_loop_mid_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();

        let handle = Looper::spawn(
            Duration::from_millis(10),
            BackoffPolicy {
                initial: Duration::from_secs(30),
                max: Duration::from_secs(60),
                multiplier: 2.0,
            },
            cancel_for_task,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), &str>("boom")
                }
            },
            |_err: &&str| false,
        );

        tokio::time::advance(Duration::from_millis(15)).await;
        cancel.cancel();
        tokio::time::advance(Duration::from_secs(1)).await;
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
