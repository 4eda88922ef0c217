//! Periodic expiry sweeper for the record store.

use crate::storage::StorageAdapter;
use crate::observability::metrics;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Background task invoking `cleanup_expired` at a fixed interval.
/// Stopped and drained through [`CleanupTask::shutdown`].
pub struct CleanupTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CleanupTask {
    /// Spawns the sweeper. The first sweep happens one interval after
    /// startup.
    pub fn spawn(store: Arc<dyn StorageAdapter>, interval: Duration) -> Self {
        let (shutdown, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            tracing::info!(interval_seconds = interval.as_secs(), "cleanup task started");
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would sweep an empty store.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_sweep(&store).await;
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("cleanup task stopped");
        });

        Self { shutdown, handle }
    }

    /// Runs a single sweep; used at shutdown and from tests.
    pub async fn run_once(store: &Arc<dyn StorageAdapter>) -> usize {
        run_sweep(store).await
    }

    /// Signals the task to stop and waits for it to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "cleanup task did not stop cleanly");
        }
    }
}

async fn run_sweep(store: &Arc<dyn StorageAdapter>) -> usize {
    match store.cleanup_expired(Utc::now()).await {
        Ok(removed) => {
            metrics::record_cleanup(removed);
            if removed > 0 {
                tracing::info!(records_removed = removed, "cleanup completed");
            } else {
                tracing::debug!("cleanup completed, nothing to remove");
            }
            removed
        }
        Err(e) => {
            tracing::error!(error = %e, "cleanup failed");
            0
        }
    }
}
