//! Deferred replay scheduling.
//!
//! Delayed replays run as timer tasks on the tokio runtime, so waiting for a
//! delay never occupies a worker. Every task is tracked so shutdown can
//! cancel pending timers and wait for replays already in progress.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Tracks deferred work and cancels it on shutdown
#[derive(Debug, Default)]
pub struct ReplayScheduler {
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ReplayScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` after `delay` unless shutdown is requested first
    ///
    /// Returns `false` without spawning when the scheduler is shutting down.
    pub fn schedule<F>(&self, delay: Duration, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return false;
        }

        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Deferred replay cancelled before its delay elapsed");
                }
                _ = tokio::time::sleep(delay) => {
                    work.await;
                }
            }
        });
        true
    }

    /// Number of deferred tasks not yet finished
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Whether shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting work and cancel pending timers without waiting
    pub fn cancel(&self) {
        self.tracker.close();
        self.shutdown.cancel();
    }

    /// Resolves once shutdown has been requested
    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await;
    }

    /// Cancel pending timers and wait for running work to finish
    pub async fn shutdown(&self) {
        self.cancel();
        self.tracker.wait().await;
    }

    /// Wait for all scheduled work to complete without cancelling it
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
