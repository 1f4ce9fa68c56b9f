//! Frontier gate and checkpoint emission

use crate::replistream::events::{ResolvedSpan, SourceTimestamp};
use crate::replistream::frontier::SpanFrontier;
use crate::replistream::writer::errors::WriterError;
use crate::replistream::writer::metrics::WriterMetrics;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Predicate that suppresses checkpoint emission for deterministic tests;
/// receives the current overall frontier.
pub type ElideCheckpoint = Box<dyn Fn(SourceTimestamp) -> bool + Send>;

/// Owns the frontier and the outbound checkpoint channel.
///
/// Only the dispatcher task touches the gate, so the frontier needs no
/// synchronization. The checkpoint channel has capacity 1; a slow consumer
/// throttles the dispatcher through it.
pub struct CheckpointGate {
    frontier: SpanFrontier,
    checkpoint_tx: mpsc::Sender<Vec<ResolvedSpan>>,
    metrics: Arc<WriterMetrics>,
    elide: Option<ElideCheckpoint>,
}

impl CheckpointGate {
    pub fn new(
        frontier: SpanFrontier,
        checkpoint_tx: mpsc::Sender<Vec<ResolvedSpan>>,
        metrics: Arc<WriterMetrics>,
        elide: Option<ElideCheckpoint>,
    ) -> Self {
        Self {
            frontier,
            checkpoint_tx,
            metrics,
            elide,
        }
    }

    /// Forward the resolved spans through the frontier and emit them on the
    /// checkpoint channel. Callers must route through purgatory first when
    /// it is non-empty; the gate itself never defers.
    pub async fn checkpoint(&mut self, resolved: Vec<ResolvedSpan>) -> Result<(), WriterError> {
        if let Some(elide) = &self.elide {
            if elide(self.frontier.frontier()) {
                return Ok(());
            }
        }

        if resolved.is_empty() {
            return Err(WriterError::Protocol(
                "checkpoint event expected to have resolved spans".to_string(),
            ));
        }

        for resolved_span in &resolved {
            self.frontier
                .forward(&resolved_span.span, resolved_span.timestamp)?;
        }

        self.checkpoint_tx
            .send(resolved)
            .await
            .map_err(|_| WriterError::Closed)?;
        self.metrics.checkpoint_events.inc();
        Ok(())
    }

    /// The overall resolved frontier for this partition.
    pub fn frontier(&self) -> SourceTimestamp {
        self.frontier.frontier()
    }

    /// Per-span progress, e.g. to resume a subscription.
    pub fn resolved_spans(&self) -> Vec<ResolvedSpan> {
        self.frontier.resolved_spans()
    }
}
