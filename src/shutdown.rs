//! Graceful shutdown signalling for long-lived connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Broadcasts the shutdown signal to every registered connection and counts
/// how many of them are still open.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

/// Held by a connection for as long as it is open.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a connection. The receiver flips to `true` on shutdown.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.active.fetch_add(1, Ordering::AcqRel);
        (
            ConnectionGuard {
                active: Arc::clone(&self.active),
            },
            self.tx.subscribe(),
        )
    }

    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait for every registered connection to go away, up to `timeout`.
    /// Returns `false` if some were still open when time ran out.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
