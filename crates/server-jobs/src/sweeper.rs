// crates/server-jobs/src/sweeper.rs
//! Periodic expiry of finished async jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::JobRegistry;

/// Run [`JobRegistry::sweep`] every `interval` until `shutdown` fires.
pub fn spawn_sweeper(
    registry: Arc<JobRegistry>,
    ttl: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = registry.sweep(ttl);
                    if removed > 0 {
                        metrics::counter!("iavatar_jobs_swept_total").increment(removed as u64);
                        tracing::info!(removed, remaining = registry.len(), "Swept expired jobs");
                    }
                }
            }
        }
    })
}
