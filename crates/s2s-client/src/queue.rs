//! Durable send path: packets go to SQLite first and are drained in
//! batches, one transaction per batch.

use s2s_protocol::DataPacket;
use s2s_queue::{Batch, CleanupStats, QueueStats, SqliteQueue};
use std::sync::Arc;

use crate::client::SiteToSiteClient;
use crate::error::Result;
use crate::transaction::TransactionResult;

/// Counts reported by `process`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub batches: usize,
    pub packets: usize,
    pub destination_full: usize,
}

pub struct PersistentQueue {
    queue: SqliteQueue,
    client: Arc<SiteToSiteClient>,
}

impl PersistentQueue {
    pub fn new(queue: SqliteQueue, client: Arc<SiteToSiteClient>) -> Self {
        Self { queue, client }
    }

    pub fn store(&self) -> &SqliteQueue {
        &self.queue
    }

    pub fn client(&self) -> &SiteToSiteClient {
        &self.client
    }

    pub fn enqueue(&self, packets: &[DataPacket]) -> Result<usize> {
        Ok(self.queue.enqueue(packets)?)
    }

    pub fn cleanup(&self) -> Result<CleanupStats> {
        Ok(self.queue.cleanup()?)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        Ok(self.queue.stats()?)
    }

    /// Drain the queue batch by batch until it is empty.
    ///
    /// A batch whose transfer fails is released back to the queue and the
    /// error is returned; batches already delivered stay delivered.
    pub async fn process(&self) -> Result<ProcessStats> {
        let released = self.queue.release_expired_reservations()?;
        if released > 0 {
            tracing::info!(released, "queue: recovered abandoned packets");
        }

        let limit = self.queue.config().batch_limit.max(1);
        let mut stats = ProcessStats::default();
        loop {
            let batch = self.queue.dequeue(limit)?;
            if batch.is_empty() {
                break;
            }
            let count = batch.len();

            match self.deliver(&batch).await {
                Ok(result) => {
                    batch.transaction_complete()?;
                    stats.batches += 1;
                    stats.packets += count;
                    if result.destination_full() {
                        stats.destination_full += 1;
                    }
                }
                Err(e) => {
                    if let Err(release) = batch.transaction_failed() {
                        tracing::warn!(error = %release, "queue: failed to release batch");
                    }
                    return Err(e);
                }
            }
        }

        if stats.batches > 0 {
            tracing::info!(batches = stats.batches, packets = stats.packets, "queue: processed");
        }
        Ok(stats)
    }

    async fn deliver(&self, batch: &Batch<'_>) -> Result<TransactionResult> {
        let mut transaction = self.client.create_transaction().await?;
        for packet in batch.iter() {
            transaction.send(packet).await?;
        }
        transaction.confirm().await?;
        transaction.complete().await
    }
}
