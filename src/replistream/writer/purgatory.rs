//! Purgatory: bounded deferral for transiently-unapplicable rows
//!
//! Rows that fail application with a retriable error wait here for a later
//! flush instead of blocking the stream. Purgatory also intercepts
//! checkpoints: a checkpoint that arrives while rows are deferred attaches
//! to the newest entry and is only released once every earlier row has been
//! applied or dead-lettered, so the frontier never advances past an
//! unapplied change.

use crate::replistream::events::{KvEvent, ResolvedSpan};
use crate::replistream::writer::applier::BufferApplier;
use crate::replistream::writer::config::PurgatoryConfig;
use crate::replistream::writer::errors::WriterError;
use crate::replistream::writer::gate::CheckpointGate;
use log::debug;
use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug)]
pub(crate) struct PurgatoryEntry {
    pub(crate) remaining: Vec<KvEvent>,
    pub(crate) checkpoint: Option<Vec<ResolvedSpan>>,
    pub(crate) arrived_at: Instant,
    pub(crate) last_attempt: Option<Instant>,
    pub(crate) level: u32,
}

/// Ordered deferral buffer. Entries drain oldest-first; attached
/// checkpoints release strictly in insertion order.
pub struct Purgatory {
    config: PurgatoryConfig,
    entries: VecDeque<PurgatoryEntry>,
}

impl Purgatory {
    pub fn new(config: PurgatoryConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Total deferred events across all entries.
    pub fn event_count(&self) -> usize {
        self.entries.iter().map(|e| e.remaining.len()).sum()
    }

    /// Defer a buffer the applier left unapplied. If the oldest entry has
    /// exhausted its retry budget or residence deadline, drain first so its
    /// failures move to the dead-letter queue rather than accumulating.
    pub async fn store(
        &mut self,
        unapplied: Vec<KvEvent>,
        applier: &mut BufferApplier,
        gate: &mut CheckpointGate,
    ) -> Result<(), WriterError> {
        if unapplied.is_empty() {
            return Ok(());
        }
        if self.over_limit(Instant::now()) {
            self.drain(applier, gate).await?;
        }
        debug!("deferring {} unapplied events to purgatory", unapplied.len());
        let now = Instant::now();
        self.entries.push_back(PurgatoryEntry {
            remaining: unapplied,
            checkpoint: None,
            arrived_at: now,
            // Storing follows a flush, so the first retry waits a full
            // delay rather than re-running immediately.
            last_attempt: Some(now),
            level: 0,
        });
        Ok(())
    }

    /// Intercept a checkpoint that cannot be forwarded yet. It attaches to
    /// the newest entry; if that entry already carries one, a new empty
    /// entry keeps the two checkpoints ordered.
    pub fn attach_checkpoint(&mut self, resolved: Vec<ResolvedSpan>) {
        match self.entries.back_mut() {
            Some(entry) if entry.checkpoint.is_none() => entry.checkpoint = Some(resolved),
            _ => self.entries.push_back(PurgatoryEntry {
                remaining: Vec::new(),
                checkpoint: Some(resolved),
                arrived_at: Instant::now(),
                last_attempt: None,
                level: 0,
            }),
        }
    }

    /// Retry deferred entries. Entries past `deadline` or `level_limit`
    /// flush with `must_process`, forcing their failures to the dead-letter
    /// queue. Entries whose buffers come back empty release their attached
    /// checkpoints from the front of the queue, in insertion order; an
    /// unresolved head holds everything behind it.
    pub async fn drain(
        &mut self,
        applier: &mut BufferApplier,
        gate: &mut CheckpointGate,
    ) -> Result<(), WriterError> {
        let now = Instant::now();
        for entry in self.entries.iter_mut() {
            if entry.remaining.is_empty() {
                continue;
            }
            let must_process = entry.level >= self.config.level_limit
                || now.duration_since(entry.arrived_at) >= self.config.deadline;
            let due = entry
                .last_attempt
                .map_or(true, |at| now.duration_since(at) >= self.config.delay);
            if !due && !must_process {
                continue;
            }

            let buffer = std::mem::take(&mut entry.remaining);
            let attempted = buffer.len();
            entry.remaining = applier.flush_buffer(buffer, must_process).await?;
            entry.last_attempt = Some(Instant::now());
            if !entry.remaining.is_empty() {
                entry.level += 1;
                debug!(
                    "purgatory entry retains {} of {} events at level {}",
                    entry.remaining.len(),
                    attempted,
                    entry.level
                );
            }
        }

        while let Some(front) = self.entries.front() {
            if !front.remaining.is_empty() {
                break;
            }
            if let Some(entry) = self.entries.pop_front() {
                if let Some(resolved) = entry.checkpoint {
                    gate.checkpoint(resolved).await?;
                }
            }
        }
        Ok(())
    }

    fn over_limit(&self, now: Instant) -> bool {
        self.entries.front().map_or(false, |oldest| {
            oldest.level >= self.config.level_limit
                || now.duration_since(oldest.arrived_at) >= self.config.deadline
        })
    }
}
