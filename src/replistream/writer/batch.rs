//! Batch handler and row processor seams
//!
//! A [`RowProcessor`] knows how to turn one KV update into destination DML
//! with last-write-wins semantics; a [`BatchHandler`] drives it for a batch
//! of 1..B rows with the required atomicity. The SQL execution layer behind
//! the row processor is an external collaborator.

use crate::replistream::events::KvEvent;
use crate::replistream::writer::dlq::DecodedRow;
use crate::replistream::writer::errors::ApplyError;
use async_trait::async_trait;

/// Outcome accounting for one batch (or one row).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Rows left in the buffer for a later retry. Tracked per flush by the
    /// applier, not folded by `add`.
    pub not_processed: u64,
    pub byte_size: u64,
    pub optimistic_insert_conflicts: u64,
}

impl BatchStats {
    pub fn add(&mut self, other: &BatchStats) {
        self.byte_size += other.byte_size;
        self.optimistic_insert_conflicts += other.optimistic_insert_conflicts;
    }
}

/// Applies single KV updates to the destination.
///
/// `process_row` must enforce last-write-wins: reject the apply when the
/// destination row's commit timestamp is at or beyond the incoming event's,
/// making re-application of an already-applied update a no-op. Outside an
/// explicit transaction a row may rely on single-statement atomicity.
#[async_trait]
pub trait RowProcessor: Send {
    /// Decide insert vs update vs delete for one KV update and apply it,
    /// joining the open transaction if there is one.
    async fn process_row(&mut self, kv: &KvEvent) -> Result<BatchStats, ApplyError>;

    async fn begin_transaction(&mut self) -> Result<(), ApplyError>;
    async fn commit_transaction(&mut self) -> Result<(), ApplyError>;
    async fn abort_transaction(&mut self) -> Result<(), ApplyError>;

    /// The last row this processor decoded, for dead-letter enrichment.
    fn last_row(&self) -> Option<DecodedRow>;
}

/// Applies one batch of KV updates.
///
/// A size-1 batch may use an implicit transaction. A larger batch must be
/// atomic: all rows commit or none, and any per-row error fails the batch.
#[async_trait]
pub trait BatchHandler: Send {
    async fn handle_batch(&mut self, batch: &[KvEvent]) -> Result<BatchStats, ApplyError>;

    /// The last row decoded while handling the most recent batch.
    fn last_row(&self) -> Option<DecodedRow>;
}

/// The standard batch handler: implicit transaction for single rows,
/// explicit transaction with rollback-on-error for larger batches.
pub struct TransactionalBatchHandler<R: RowProcessor> {
    rp: R,
}

impl<R: RowProcessor> TransactionalBatchHandler<R> {
    pub fn new(rp: R) -> Self {
        Self { rp }
    }
}

#[async_trait]
impl<R: RowProcessor> BatchHandler for TransactionalBatchHandler<R> {
    async fn handle_batch(&mut self, batch: &[KvEvent]) -> Result<BatchStats, ApplyError> {
        let mut stats = BatchStats::default();
        if let [kv] = batch {
            stats.add(&self.rp.process_row(kv).await?);
            return Ok(stats);
        }

        self.rp.begin_transaction().await?;
        for kv in batch {
            match self.rp.process_row(kv).await {
                Ok(row_stats) => stats.add(&row_stats),
                Err(err) => {
                    if let Err(abort_err) = self.rp.abort_transaction().await {
                        log::debug!("abort after failed row also failed: {}", abort_err);
                    }
                    return Err(err);
                }
            }
        }
        self.rp.commit_transaction().await?;
        Ok(stats)
    }

    fn last_row(&self) -> Option<DecodedRow> {
        self.rp.last_row()
    }
}
