//! Shutdown signalling for the lock manager's background tasks.
//!
//! The expiry timer, the eviction worker and the blocking-callback workers of
//! one server or client share a [`ShutdownCoordinator`]; [`BackgroundTasks`]
//! joins them once the signal is given.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// One-shot stop signal shared by a server's or client's tasks. Cloning
/// shares the signal.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    stop: Arc<watch::Sender<bool>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop: Arc::new(stop),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.stop.borrow()
    }

    /// Signal shutdown. Returns false if it was already signalled.
    pub fn shutdown(&self) -> bool {
        let first = self.stop.send_if_modified(|stopped| !std::mem::replace(stopped, true));
        if first {
            debug!("shutdown signalled");
        }
        first
    }

    /// Resolve once shutdown has been signalled; meant for `select!` arms.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.stop.subscribe();
        // The sender lives as long as `self`, so this only ends on the signal.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Named background tasks joined at shutdown.
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every task, newest first, bounded by `timeout` overall.
    /// Tasks still running at the deadline are aborted.
    pub async fn join(&self, timeout: Duration) {
        let mut tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + timeout;
        while let Some((name, mut handle)) = tasks.pop() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "task stopped"),
                Ok(Err(e)) => error!(task = name, error = %e, "task ended abnormally"),
                Err(_) => {
                    error!(task = name, "task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        info!("background tasks stopped");
    }
}
