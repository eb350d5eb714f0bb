//! Background expiry sweeper.
//!
//! Pending decisions past their deadline move to `expired` (with an audit
//! entry each) on a fixed cadence. The queue's sweep is blocking SQLite
//! work, so each tick runs on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use clasper_core::decision::ApprovalQueue;
use tokio::task::JoinHandle;

/// Spawns the sweeper loop; aborting the handle stops it.
#[must_use]
pub fn spawn(queue: Arc<ApprovalQueue>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let queue = Arc::clone(&queue);
            let swept = tokio::task::spawn_blocking(move || queue.sweep_expired()).await;
            match swept {
                Ok(Ok(0)) => {},
                Ok(Ok(count)) => {
                    tracing::info!(count, "expired pending decisions");
                },
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "decision sweep failed");
                },
                Err(join_err) => {
                    tracing::error!(error = %join_err, "decision sweep panicked");
                },
            }
        }
    })
}
