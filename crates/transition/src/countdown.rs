use std::time::Duration;
use tokio::sync::watch;

/// How a countdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownOutcome {
    Completed,
    Cancelled,
}

/// Decrementing one-second timer.
///
/// Emits one tick per remaining second (N, N-1, .., 1), each followed by a
/// one second wait, then completes. A `true` on the shutdown channel (or the
/// sender going away) cancels it at the next wait.
#[derive(Debug, Clone)]
pub struct Countdown {
    seconds: u32,
    step: Duration,
}

impl Countdown {
    pub fn new(seconds: u32) -> Self {
        Self {
            seconds,
            step: Duration::from_secs(1),
        }
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub async fn run(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        mut on_tick: impl FnMut(u32),
    ) -> CountdownOutcome {
        if *shutdown.borrow() {
            return CountdownOutcome::Cancelled;
        }
        for remaining in (1..=self.seconds).rev() {
            on_tick(remaining);
            tokio::select! {
                _ = tokio::time::sleep(self.step) => {}
                _ = stopped(shutdown) => return CountdownOutcome::Cancelled,
            }
        }
        CountdownOutcome::Completed
    }
}

/// Resolves once shutdown is signalled. A dropped sender counts as shutdown.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
