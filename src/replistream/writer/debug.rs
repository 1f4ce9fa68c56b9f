//! Operator-facing consumer status
//!
//! Lock-free counters and timings for one processor, sampled via
//! [`DebugStatus::snapshot`]. Not on any correctness path.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Per-processor receive/flush/batch instrumentation.
#[derive(Debug, Default)]
pub struct DebugStatus {
    stream_id: u64,
    processor_id: i32,
    events_received: AtomicU64,
    last_recv_gap_nanos: AtomicU64,
    flushes_started: AtomicU64,
    /// Unix nanos when the current flush started; 0 when idle.
    current_flush_started_unix_nanos: AtomicI64,
    current_flush_rows: AtomicU64,
    last_flush_nanos: AtomicU64,
    last_flush_rows: AtomicU64,
    last_flush_bytes: AtomicU64,
    batches_applied: AtomicU64,
    rows_batched: AtomicU64,
    last_batch_nanos: AtomicU64,
}

/// Point-in-time copy of [`DebugStatus`], serializable for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct DebugStatusSnapshot {
    pub stream_id: u64,
    pub processor_id: i32,
    pub events_received: u64,
    pub last_recv_gap_nanos: u64,
    pub flushes_started: u64,
    pub flushing: bool,
    pub current_flush_rows: u64,
    pub last_flush_nanos: u64,
    pub last_flush_rows: u64,
    pub last_flush_bytes: u64,
    pub batches_applied: u64,
    pub rows_batched: u64,
    pub last_batch_nanos: u64,
}

impl DebugStatus {
    pub fn new(stream_id: u64, processor_id: i32) -> Self {
        Self {
            stream_id,
            processor_id,
            ..Default::default()
        }
    }

    /// Record the gap since the previous event was received.
    pub fn record_recv(&self, gap: Duration) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        self.last_recv_gap_nanos
            .store(gap.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_flush_start(&self, rows: u64) {
        self.flushes_started.fetch_add(1, Ordering::Relaxed);
        self.current_flush_rows.store(rows, Ordering::Relaxed);
        self.current_flush_started_unix_nanos.store(
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
            Ordering::Relaxed,
        );
    }

    pub fn record_flush_complete(&self, elapsed: Duration, rows: u64, bytes: u64) {
        self.current_flush_started_unix_nanos
            .store(0, Ordering::Relaxed);
        self.current_flush_rows.store(0, Ordering::Relaxed);
        self.last_flush_nanos
            .store(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.last_flush_rows.store(rows, Ordering::Relaxed);
        self.last_flush_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn record_batch_applied(&self, elapsed: Duration, rows: u64) {
        self.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.rows_batched.fetch_add(rows, Ordering::Relaxed);
        self.last_batch_nanos
            .store(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DebugStatusSnapshot {
        DebugStatusSnapshot {
            stream_id: self.stream_id,
            processor_id: self.processor_id,
            events_received: self.events_received.load(Ordering::Relaxed),
            last_recv_gap_nanos: self.last_recv_gap_nanos.load(Ordering::Relaxed),
            flushes_started: self.flushes_started.load(Ordering::Relaxed),
            flushing: self.current_flush_started_unix_nanos.load(Ordering::Relaxed) != 0,
            current_flush_rows: self.current_flush_rows.load(Ordering::Relaxed),
            last_flush_nanos: self.last_flush_nanos.load(Ordering::Relaxed),
            last_flush_rows: self.last_flush_rows.load(Ordering::Relaxed),
            last_flush_bytes: self.last_flush_bytes.load(Ordering::Relaxed),
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            rows_batched: self.rows_batched.load(Ordering::Relaxed),
            last_batch_nanos: self.last_batch_nanos.load(Ordering::Relaxed),
        }
    }
}
