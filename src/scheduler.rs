use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Spawns timers that all hang off one root token, so disposing the owner tears
/// every pending timer down at once.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    root: CancellationToken,
}

/// A single armed timer. Cancelling it never interrupts a tick body that is
/// already running; it only prevents further firings.
#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_disposed(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn dispose(&self) {
        self.root.cancel();
    }

    /// Sleeps for `delay` unless the scheduler is disposed first. Returns `false`
    /// when disposal won.
    pub async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.root.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    pub fn after<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let task_token = token.clone();
        let join_handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => task.await,
            }
        });

        TimerHandle { token, join_handle }
    }

    /// Fixed-period timer; the first tick fires one full period after arming.
    /// Ticks that fall due while a previous tick body is still running are skipped.
    pub fn every<F, Fut>(&self, period: Duration, mut tick: F) -> TimerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let task_token = token.clone();
        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
        });

        TimerHandle { token, join_handle }
    }

    /// Variable-delay loop: each tick returns the delay before the next one.
    pub fn repeat<F, Fut>(&self, first_delay: Duration, mut tick: F) -> TimerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Duration> + Send + 'static,
    {
        let token = self.root.child_token();
        let task_token = token.clone();
        let join_handle = tokio::spawn(async move {
            let mut next_delay = first_delay;
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(next_delay) => {
                        next_delay = tick().await;
                    }
                }
            }
        });

        TimerHandle { token, join_handle }
    }
}
