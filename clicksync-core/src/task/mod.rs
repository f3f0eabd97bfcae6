//! Owned background work: abort-on-drop task handles and a cancellable
//! single-shot timer.
//!
//! Everything the lifecycle spawns is held through one of these, so
//! clearing or replacing the owning field is enough to cancel the work.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A spawned tokio task that is aborted when the guard is dropped.
#[derive(Debug)]
pub struct TaskGuard {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl TaskGuard {
    /// Spawns `fut` on the current runtime.
    pub fn spawn<F>(name: &'static str, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            handle: tokio::spawn(fut),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abort now instead of waiting for the drop.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A single pending timer. Dropping it cancels the callback.
///
/// Each timer carries a sequence number so a fire that was already queued
/// when the timer got replaced can be told apart from the live one.
#[derive(Debug)]
pub struct OneShotTimer {
    seq: u64,
    _task: TaskGuard,
}

impl OneShotTimer {
    /// Run `on_fire(seq)` once after `delay`.
    pub fn schedule<F>(seq: u64, delay: Duration, on_fire: F) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let task = TaskGuard::spawn("timer", async move {
            tokio::time::sleep(delay).await;
            on_fire(seq);
        });
        Self { seq, _task: task }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}
