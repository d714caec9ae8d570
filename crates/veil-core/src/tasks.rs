//! Background task tracking with a shared done signal.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Tasks owned by one relay or client
///
/// Once [`TaskGroup::signal`] has run no new task starts, so
/// [`TaskGroup::drain`] waits for a fixed set.
pub(crate) struct TaskGroup {
    done: watch::Sender<bool>,
    set: Mutex<Option<JoinSet<()>>>,
}

/// Resolve once `rx` observes the done signal (or its sender is gone)
pub(crate) async fn wait_done(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|done| *done).await;
}

impl TaskGroup {
    pub(crate) fn new() -> Self {
        Self {
            done: watch::channel(false).0,
            set: Mutex::new(Some(JoinSet::new())),
        }
    }

    fn set(&self) -> MutexGuard<'_, Option<JoinSet<()>>> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    /// Start `task`; false once the group is shutting down
    pub(crate) fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.set();
        let Some(set) = guard.as_mut() else {
            return false;
        };
        if self.is_done() {
            return false;
        }
        while set.try_join_next().is_some() {}
        set.spawn(task);
        true
    }

    /// Raise the done signal
    pub(crate) fn signal(&self) {
        self.done.send_replace(true);
    }

    /// Stop accepting tasks and wait for the running ones
    pub(crate) async fn drain(&self) {
        let set = self.set().take();
        let Some(mut set) = set else {
            return;
        };
        while let Some(result) = set.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!(error = %e, "background task panicked");
                }
            }
        }
    }
}
