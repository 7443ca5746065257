//! Cancellable one-shot timer slots backed by tokio tasks.

use tokio::task::{AbortHandle, JoinHandle};

/// Holds at most one armed timer task.
///
/// Arming a slot aborts whatever was armed before. Cancelling is safe to
/// call any number of times.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot(Option<AbortHandle>);

impl TimerSlot {
    pub fn arm(&mut self, task: JoinHandle<()>) {
        self.cancel();
        self.0 = Some(task.abort_handle());
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.0.as_ref().is_some_and(|h| !h.is_finished())
    }

    #[cfg(test)]
    pub fn handle(&self) -> Option<AbortHandle> {
        self.0.clone()
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
