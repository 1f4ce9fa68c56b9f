//! Dead-letter queue client
//!
//! Events that will never apply on the destination are handed to a
//! [`DeadLetterQueueClient`]. Durable persistence is the embedding system's
//! concern; this module ships a logging-only client and a buffering client
//! that retains entries in memory for inspection.

use crate::replistream::events::KvEvent;
use crate::replistream::writer::errors::ApplyError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A row as decoded by the row processor, persisted alongside the raw event
/// when available.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecodedRow {
    pub table: String,
    pub columns: HashMap<String, serde_json::Value>,
}

impl DecodedRow {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: HashMap::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.columns.insert(name.into(), value);
        self
    }
}

impl std::fmt::Display for DecodedRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.columns.keys().collect();
        names.sort();
        write!(f, "{}(", self.table)?;
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, self.columns[*name])?;
        }
        write!(f, ")")
    }
}

/// Durably records a permanently-unapplicable event. Any error is fatal to
/// the processor: losing the event silently is not an option.
#[async_trait]
pub trait DeadLetterQueueClient: Send + Sync {
    async fn log(
        &self,
        job_id: u64,
        event: &KvEvent,
        row: Option<&DecodedRow>,
        apply_err: &ApplyError,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Client that only counts and logs; the default until a durable sink is
/// wired in by the embedding job system.
#[derive(Debug, Default)]
pub struct LoggingDeadLetterQueue {
    logged: AtomicU64,
}

impl LoggingDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logged(&self) -> u64 {
        self.logged.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeadLetterQueueClient for LoggingDeadLetterQueue {
    async fn log(
        &self,
        job_id: u64,
        event: &KvEvent,
        row: Option<&DecodedRow>,
        apply_err: &ApplyError,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.logged.fetch_add(1, Ordering::Relaxed);
        match row {
            Some(row) => log::warn!(
                "job {}: dead-lettered row {} due to {}",
                job_id,
                row,
                apply_err
            ),
            None => log::warn!(
                "job {}: dead-lettered event {} due to {}",
                job_id,
                event,
                apply_err
            ),
        }
        Ok(())
    }
}

/// One dead-lettered event with its failure context.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub job_id: u64,
    pub event: KvEvent,
    pub row: Option<DecodedRow>,
    pub error: String,
    pub logged_at: DateTime<Utc>,
}

/// Client that retains entries in memory for inspection and debugging, with
/// an optional size limit; the queue rejects writes at capacity so the
/// processor fails loudly instead of dropping events.
#[derive(Debug, Clone, Default)]
pub struct BufferingDeadLetterQueue {
    entries: Arc<Mutex<Vec<DeadLetterEntry>>>,
    max_size: Option<usize>,
}

impl BufferingDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            max_size: Some(max_size),
        }
    }

    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

#[async_trait]
impl DeadLetterQueueClient for BufferingDeadLetterQueue {
    async fn log(
        &self,
        job_id: u64,
        event: &KvEvent,
        row: Option<&DecodedRow>,
        apply_err: &ApplyError,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut entries = self.entries.lock().await;
        if let Some(max) = self.max_size {
            if entries.len() >= max {
                return Err(format!("dead letter queue at capacity ({} entries)", max).into());
            }
        }
        entries.push(DeadLetterEntry {
            job_id,
            event: event.clone(),
            row: row.cloned(),
            error: apply_err.to_string(),
            logged_at: Utc::now(),
        });
        Ok(())
    }
}
