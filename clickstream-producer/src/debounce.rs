use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

type Settle<S> = Arc<dyn Fn(S) + Send + Sync>;

/// A single-slot delayed task.
///
/// Every observed signal replaces the pending one: the previous delayed
/// task is aborted and a new one is scheduled after the quiet window. Only
/// the last signal of a burst reaches `on_settle`.
pub struct Debouncer<S> {
    quiet: Duration,
    on_settle: Settle<S>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Send + 'static> Debouncer<S> {
    pub fn new<F>(quiet: Duration, on_settle: F) -> Self
    where
        F: Fn(S) + Send + Sync + 'static,
    {
        Self {
            quiet,
            on_settle: Arc::new(on_settle),
            pending: Mutex::new(None),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn observe(&self, signal: S) {
        let on_settle = self.on_settle.clone();
        let quiet = self.quiet;
        let task = tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            on_settle(signal);
        });

        match self.pending.lock() {
            Ok(mut pending) => {
                if let Some(previous) = pending.replace(task) {
                    previous.abort();
                }
            }
            Err(_) => {
                warn!("poisoned Debouncer mutex, dropping signal");
                task.abort();
            }
        }
    }

    /// Drop the pending signal, if any.
    pub fn cancel(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(previous) = pending.take() {
                previous.abort();
            }
        }
    }
}

impl<S> Drop for Debouncer<S> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(previous) = pending.take() {
                previous.abort();
            }
        }
    }
}
