//! Background cleanup of expired bans.
//!
//! Periodically deletes expired rows from the ban store, evicts the
//! matching mirror entries, and asks SQLite to reclaim freed pages.
//! Everything the sweep does also happens lazily on reads; the task just
//! keeps the table from accumulating dead rows on a quiet instance.

use super::engine::Limiter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Spawn the cleanup background task.
///
/// Runs one sweep every `interval` until `shutdown` is cancelled. A zero
/// interval disables the task entirely.
pub fn spawn_cleanup_task(limiter: Arc<Limiter>, interval: Duration, shutdown: CancellationToken) {
    if interval.is_zero() {
        debug!("Cleanup task disabled");
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; consume it so the first
        // sweep happens one full interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Cleanup task stopped");
                    break;
                }
                _ = ticker.tick() => limiter.run_cleanup().await,
            }
        }
    });
}
