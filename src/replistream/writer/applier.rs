//! Parallel buffer applier
//!
//! `flush_buffer` sorts a KV buffer by (row prefix, commit timestamp),
//! carves it into at most one chunk per batch handler, and applies the
//! chunks concurrently. Chunk boundaries extend forward until the row
//! prefix changes, so every revision of a row lands in exactly one worker:
//! last-write-wins falls out of apply order inside a worker, with no
//! cross-worker coordination.
//!
//! Each buffer slot is sentinel-zeroed as it completes (applied or
//! dead-lettered); whatever is left non-zero after the workers join is
//! compacted and handed back for purgatory.

use crate::replistream::events::{row_prefix, KvEvent};
use crate::replistream::writer::batch::{BatchHandler, BatchStats};
use crate::replistream::writer::config::WriterConfig;
use crate::replistream::writer::debug::DebugStatus;
use crate::replistream::writer::dlq::{DeadLetterQueueClient, DecodedRow};
use crate::replistream::writer::errors::{ApplyError, WriterError};
use crate::replistream::writer::metrics::WriterMetrics;
use futures::future::try_join_all;
use log::info;
use std::sync::Arc;
use std::time::Instant;

/// Decides whether a failed apply may succeed if retried later (e.g. once
/// the parent side of an FK relationship has been ingested by another
/// processor).
pub type RetryPolicy = fn(&ApplyError) -> bool;

/// The default policy: everything is worth retrying.
pub fn retry_all(_err: &ApplyError) -> bool {
    true
}

/// A chunk never ends below this many events, so small buffers stay on few
/// workers instead of paying per-worker overhead for scraps.
const MIN_CHUNK_SIZE: usize = 64;

/// Applies KV buffers across a pool of batch handlers.
pub struct BufferApplier {
    job_id: u64,
    handlers: Vec<Box<dyn BatchHandler>>,
    config: WriterConfig,
    dlq: Arc<dyn DeadLetterQueueClient>,
    metrics: Arc<WriterMetrics>,
    debug: Arc<DebugStatus>,
    retry_policy: RetryPolicy,
}

/// Read-only context shared by every in-flight chunk of one flush.
struct ChunkShared<'a> {
    job_id: u64,
    batch_size: usize,
    must_process: bool,
    log_all_dlqs: bool,
    retry_later: RetryPolicy,
    dlq: &'a dyn DeadLetterQueueClient,
    metrics: &'a WriterMetrics,
    debug: &'a DebugStatus,
}

impl BufferApplier {
    pub fn new(
        job_id: u64,
        handlers: Vec<Box<dyn BatchHandler>>,
        config: WriterConfig,
        dlq: Arc<dyn DeadLetterQueueClient>,
        metrics: Arc<WriterMetrics>,
        debug: Arc<DebugStatus>,
        retry_policy: RetryPolicy,
    ) -> Self {
        assert!(
            !handlers.is_empty(),
            "applier requires at least one batch handler"
        );
        Self {
            job_id,
            handlers,
            config,
            dlq,
            metrics,
            debug,
            retry_policy,
        }
    }

    /// Process some or all of the events in `kvs`, sentinel-zeroing each
    /// slot it completes by applying it or by dead-lettering it.
    ///
    /// With `must_process` set every event must complete one way or the
    /// other; otherwise events whose application failed retriably are left
    /// in place and returned for a later retry. The returned buffer is
    /// empty when everything completed.
    pub async fn flush_buffer(
        &mut self,
        mut kvs: Vec<KvEvent>,
        must_process: bool,
    ) -> Result<Vec<KvEvent>, WriterError> {
        if kvs.is_empty() {
            return Ok(Vec::new());
        }

        let total = kvs.len() as u64;
        self.debug.record_flush_start(total);
        let pre_flush = Instant::now();
        let earliest_commit = kvs.iter().map(|kv| kv.commit_ts).min().unwrap_or_default();

        // Row-prefix order groups all revisions of a row together; commit
        // order within a row makes the newest revision apply last.
        kvs.sort_by(|a, b| {
            row_prefix(&a.key)
                .cmp(row_prefix(&b.key))
                .then_with(|| a.commit_ts.cmp(&b.commit_ts))
        });

        let chunk_size = (kvs.len() / self.handlers.len() + 1).max(MIN_CHUNK_SIZE);

        let BufferApplier {
            job_id,
            handlers,
            config,
            dlq,
            metrics,
            debug,
            retry_policy,
        } = self;
        let shared = ChunkShared {
            job_id: *job_id,
            batch_size: config.effective_batch_size(),
            must_process,
            log_all_dlqs: config.log_all_dlqs,
            retry_later: *retry_policy,
            dlq: &**dlq,
            metrics: &**metrics,
            debug: &**debug,
        };

        let mut chunk_futures = Vec::new();
        let mut rest = kvs.as_mut_slice();
        for handler in handlers.iter_mut() {
            if rest.is_empty() {
                break;
            }
            // The chunk ends at the first new row prefix after the target
            // size, keeping every revision of a row in one worker.
            let mut end = chunk_size.min(rest.len());
            while end < rest.len() && row_prefix(&rest[end - 1].key) == row_prefix(&rest[end].key)
            {
                end += 1;
            }
            let (chunk, tail) = rest.split_at_mut(end);
            rest = tail;
            chunk_futures.push(flush_chunk(handler.as_mut(), chunk, &shared));
        }

        let chunk_stats = try_join_all(chunk_futures).await?;
        let mut flush_stats = BatchStats::default();
        let mut not_processed = 0u64;
        for stats in &chunk_stats {
            not_processed += stats.not_processed;
            flush_stats.add(stats);
        }

        let flush_time = pre_flush.elapsed();
        let byte_count = flush_stats.byte_size;
        debug.record_flush_complete(flush_time, total, byte_count);

        metrics.applied_row_updates.inc_by(total);
        metrics.applied_logical_bytes.inc_by(byte_count);
        let now_nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        metrics
            .commit_to_commit_nanos
            .observe(now_nanos.saturating_sub(earliest_commit.wall_nanos).max(0) as f64);
        metrics.flush_nanos.observe(flush_time.as_nanos() as f64);
        metrics.flush_rows.observe(total as f64);
        metrics.flush_bytes.observe(byte_count as f64);
        metrics
            .optimistic_insert_conflicts
            .inc_by(flush_stats.optimistic_insert_conflicts);

        if not_processed > 0 {
            info!(
                "job {}: flush left {} of {} events unapplied",
                job_id, not_processed, total
            );
            Ok(filter_remaining(kvs))
        } else {
            Ok(Vec::new())
        }
    }

    /// Number of workers available to a flush.
    pub fn worker_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Per-worker body of `flush_buffer`; see its contract.
async fn flush_chunk(
    handler: &mut dyn BatchHandler,
    mut chunk: &mut [KvEvent],
    shared: &ChunkShared<'_>,
) -> Result<BatchStats, WriterError> {
    let mut stats = BatchStats::default();
    while !chunk.is_empty() {
        let batch_len = shared.batch_size.min(chunk.len());
        let (batch, tail) = std::mem::take(&mut chunk).split_at_mut(batch_len);
        chunk = tail;
        let pre_batch = Instant::now();

        match handler.handle_batch(batch).await {
            Ok(batch_stats) => {
                // Clear each event to mark successful application.
                for event in batch.iter_mut() {
                    event.clear();
                }
                stats.add(&batch_stats);
            }
            Err(err) if batch.len() == 1 => {
                // Already failed applying on its own; handle the failure.
                if shared.must_process || !(shared.retry_later)(&err) {
                    dead_letter(shared, &batch[0], handler.last_row(), &err).await?;
                    batch[0].clear();
                } else {
                    stats.not_processed += 1;
                }
            }
            Err(_) => {
                // Give each event its own chance to apply before switching
                // to handling its failure.
                for i in 0..batch.len() {
                    match handler.handle_batch(&batch[i..i + 1]).await {
                        Ok(single_stats) => {
                            batch[i].clear();
                            stats.add(&single_stats);
                        }
                        Err(err) => {
                            if shared.must_process || !(shared.retry_later)(&err) {
                                dead_letter(shared, &batch[i], handler.last_row(), &err).await?;
                                batch[i].clear();
                            } else {
                                stats.not_processed += 1;
                            }
                        }
                    }
                }
            }
        }

        let batch_time = pre_batch.elapsed();
        shared.debug.record_batch_applied(batch_time, batch_len as u64);
        shared
            .metrics
            .apply_batch_nanos
            .observe(batch_time.as_nanos() as f64);
    }
    Ok(stats)
}

/// Durably record an event that will not apply, or fail the flush if the
/// dead-letter queue refuses it.
async fn dead_letter(
    shared: &ChunkShared<'_>,
    event: &KvEvent,
    row: Option<DecodedRow>,
    apply_err: &ApplyError,
) -> Result<(), WriterError> {
    if shared.log_all_dlqs {
        match &row {
            Some(row) => info!("sending row to DLQ, {} due to {}", row, apply_err),
            None => info!("sending kv to DLQ, {} due to {}", event, apply_err),
        }
    }
    shared
        .dlq
        .log(shared.job_id, event, row.as_ref(), apply_err)
        .await
        .map_err(|err| WriterError::DeadLetterQueue(err.to_string()))?;
    shared.metrics.dlq_events.inc();
    Ok(())
}

/// Compact a flushed buffer down to the slots the workers left non-zero.
/// A buffer that shrank by half or more releases its retained capacity so a
/// small remainder does not pin a large allocation.
fn filter_remaining(mut kvs: Vec<KvEvent>) -> Vec<KvEvent> {
    let original_len = kvs.len();
    kvs.retain(|kv| !kv.is_applied());
    if kvs.len() < original_len / 2 {
        kvs.shrink_to_fit();
    }
    kvs
}
