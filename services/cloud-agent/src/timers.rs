//! One-shot cancellable timers.
//!
//! `cancel` is idempotent and safe from any task; a cancellation racing the
//! firing callback is harmless either way.  Dropping the handle cancels the
//! timer, so map-stored timers die with their entries.

use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Run `f` after `delay` on the runtime.
pub fn schedule<F>(delay: Duration, f: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    TimerHandle {
        task: tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        }),
    }
}
