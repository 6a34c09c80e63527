//! Graceful shutdown (C11), grounded on
//! `original_source/lib/grace_exit.py`: a shared exit flag plus a
//! thread-drain helper that force-exits after ~9s (30 retries × 0.3s).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::defaults::{SHUTDOWN_DRAIN_POLL, SHUTDOWN_DRAIN_RETRIES};

/// Cooperative shutdown signal plus a live-task counter, shared by every
/// `tokio::spawn`ed LTC/CHP/CFT worker and the RPC accept loop.
#[derive(Clone)]
pub struct ShutdownGuard {
    token: CancellationToken,
    live_tasks: Arc<AtomicUsize>,
}

/// RAII handle incrementing/decrementing the live-task counter for the
/// lifetime of one spawned worker.
pub struct TaskTicket {
    live_tasks: Arc<AtomicUsize>,
}

impl Drop for TaskTicket {
    fn drop(&mut self) {
        self.live_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ShutdownGuard {
    pub fn new() -> Self {
        ShutdownGuard {
            token: CancellationToken::new(),
            live_tasks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_exit(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn set_exit(&self) {
        self.token.cancel();
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn track(&self) -> TaskTicket {
        self.live_tasks.fetch_add(1, Ordering::SeqCst);
        TaskTicket {
            live_tasks: self.live_tasks.clone(),
        }
    }

    /// Waits up to `SHUTDOWN_DRAIN_RETRIES * SHUTDOWN_DRAIN_POLL` (~9s) for
    /// every tracked task to drop its ticket. Returns whether all tasks
    /// drained in time, mirroring `wait_all_thread_exit`'s return value.
    pub async fn wait_for_drain(&self) -> bool {
        for attempt in 0..SHUTDOWN_DRAIN_RETRIES {
            let remaining = self.live_tasks.load(Ordering::SeqCst);
            if remaining == 0 {
                return true;
            }
            if attempt == SHUTDOWN_DRAIN_RETRIES - 1 {
                warn!("{remaining} task(s) did not stop in time, forcing exit");
                return false;
            }
            tokio::time::sleep(SHUTDOWN_DRAIN_POLL).await;
        }
        info!("all tasks stopped");
        true
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_once_tickets_drop() {
        let guard = ShutdownGuard::new();
        let ticket = guard.track();
        let guard2 = guard.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            drop(ticket);
            let _ = guard2;
        });
        assert!(guard.wait_for_drain().await);
    }

    #[test]
    fn set_exit_is_observable() {
        let guard = ShutdownGuard::new();
        assert!(!guard.is_exit());
        guard.set_exit();
        assert!(guard.is_exit());
    }
}
