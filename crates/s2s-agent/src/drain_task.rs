//! Periodic drain loop: process the queue, trim it, stop on shutdown.

use std::sync::Arc;
use std::time::Duration;

use s2s_client::PersistentQueue;
use tokio::sync::broadcast;

pub async fn run_drain_loop(
    queue: Arc<PersistentQueue>,
    process_interval: Duration,
    cleanup_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut process_timer = tokio::time::interval(process_interval);
    process_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut cleanup_timer = tokio::time::interval(cleanup_interval);
    cleanup_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = process_timer.tick() => {
                match queue.process().await {
                    Ok(stats) if stats.batches > 0 => {
                        tracing::debug!(
                            batches = stats.batches,
                            packets = stats.packets,
                            destination_full = stats.destination_full,
                            "drain: pass complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "drain: process failed, retrying next tick");
                    }
                }
            }
            _ = cleanup_timer.tick() => {
                match queue.cleanup() {
                    Ok(stats) if stats.total() > 0 => {
                        tracing::info!(
                            expired = stats.expired,
                            over_rows = stats.over_row_limit,
                            over_size = stats.over_size_limit,
                            "drain: cleanup removed packets"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "drain: cleanup failed"),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("drain: shutting down");
                break;
            }
        }
    }
}
