//! Prometheus metrics for the replication writer

use prometheus::{
    exponential_buckets, register_histogram_with_registry, register_int_counter_with_registry,
    Histogram, HistogramOpts, IntCounter, Opts, Registry,
};

/// Counters and histograms registered against the caller's registry. The
/// scraping/export backend is the caller's concern.
#[derive(Debug, Clone)]
pub struct WriterMetrics {
    /// Row updates processed by the applier (applied or dead-lettered).
    pub applied_row_updates: IntCounter,
    /// Logical bytes processed by the applier.
    pub applied_logical_bytes: IntCounter,
    /// Checkpoint events forwarded to the frontier.
    pub checkpoint_events: IntCounter,
    /// Events recorded in the dead-letter queue.
    pub dlq_events: IntCounter,
    /// Optimistic inserts that fell back to a read after a conflict.
    pub optimistic_insert_conflicts: IntCounter,
    /// End-to-end duration of one buffer flush, in nanoseconds.
    pub flush_nanos: Histogram,
    /// Rows per buffer flush.
    pub flush_rows: Histogram,
    /// Bytes per buffer flush.
    pub flush_bytes: Histogram,
    /// Duration of one destination batch apply, in nanoseconds.
    pub apply_batch_nanos: Histogram,
    /// Gap between source commit and destination apply, in nanoseconds.
    pub commit_to_commit_nanos: Histogram,
}

impl WriterMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            applied_row_updates: register_int_counter_with_registry!(
                Opts::new(
                    "replication_applied_row_updates",
                    "Row updates applied or dead-lettered by the writer"
                ),
                registry
            )?,
            applied_logical_bytes: register_int_counter_with_registry!(
                Opts::new(
                    "replication_applied_logical_bytes",
                    "Logical bytes applied by the writer"
                ),
                registry
            )?,
            checkpoint_events: register_int_counter_with_registry!(
                Opts::new(
                    "replication_checkpoint_events",
                    "Checkpoint events forwarded to the frontier"
                ),
                registry
            )?,
            dlq_events: register_int_counter_with_registry!(
                Opts::new(
                    "replication_dlq_events",
                    "Events recorded in the dead-letter queue"
                ),
                registry
            )?,
            optimistic_insert_conflicts: register_int_counter_with_registry!(
                Opts::new(
                    "replication_optimistic_insert_conflicts",
                    "Optimistic inserts that conflicted and fell back to a read"
                ),
                registry
            )?,
            flush_nanos: register_histogram_with_registry!(
                HistogramOpts::new(
                    "replication_flush_nanos",
                    "End-to-end duration of one buffer flush in nanoseconds"
                )
                .buckets(exponential_buckets(100_000.0, 4.0, 12)?),
                registry
            )?,
            flush_rows: register_histogram_with_registry!(
                HistogramOpts::new("replication_flush_rows", "Rows per buffer flush")
                    .buckets(exponential_buckets(1.0, 4.0, 10)?),
                registry
            )?,
            flush_bytes: register_histogram_with_registry!(
                HistogramOpts::new("replication_flush_bytes", "Bytes per buffer flush")
                    .buckets(exponential_buckets(64.0, 4.0, 12)?),
                registry
            )?,
            apply_batch_nanos: register_histogram_with_registry!(
                HistogramOpts::new(
                    "replication_apply_batch_nanos",
                    "Duration of one destination batch apply in nanoseconds"
                )
                .buckets(exponential_buckets(100_000.0, 4.0, 12)?),
                registry
            )?,
            commit_to_commit_nanos: register_histogram_with_registry!(
                HistogramOpts::new(
                    "replication_commit_to_commit_nanos",
                    "Gap between source commit and destination apply in nanoseconds"
                )
                .buckets(exponential_buckets(1_000_000.0, 4.0, 12)?),
                registry
            )?,
        })
    }

    /// Metrics backed by a throwaway registry, for tests and tools that do
    /// not scrape.
    pub fn unregistered() -> Self {
        Self::new(&Registry::new()).expect("fresh registry cannot collide")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_against_a_fresh_registry() {
        let registry = Registry::new();
        let metrics = WriterMetrics::new(&registry).unwrap();
        metrics.applied_row_updates.inc_by(3);
        metrics.flush_rows.observe(3.0);

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "replication_applied_row_updates"));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = Registry::new();
        let _metrics = WriterMetrics::new(&registry).unwrap();
        assert!(WriterMetrics::new(&registry).is_err());
    }
}
