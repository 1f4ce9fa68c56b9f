//! Shared fixtures for writer integration tests: a scripted stream client
//! and an in-memory last-write-wins destination table.

#![allow(dead_code)]

use async_trait::async_trait;
use replistream::replistream::events::{
    row_prefix, KvEvent, ResolvedSpan, SourceTimestamp, Span, StreamEvent,
};
use replistream::replistream::source::{
    ReplicationStreamClient, SourceError, Subscription, SubscriptionSpec,
};
use replistream::replistream::writer::{
    ApplyError, BatchHandler, BatchStats, DecodedRow, RowProcessor, TransactionalBatchHandler,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn ts(wall: i64) -> SourceTimestamp {
    SourceTimestamp::new(wall, 0)
}

pub fn span(start: &[u8], end: &[u8]) -> Span {
    Span::new(start.to_vec(), end.to_vec())
}

pub fn resolved(start: &[u8], end: &[u8], wall: i64) -> ResolvedSpan {
    ResolvedSpan::new(span(start, end), ts(wall))
}

pub fn kv(key: &[u8], wall: i64, value: &[u8]) -> KvEvent {
    KvEvent {
        key: key.to_vec(),
        value: value.to_vec(),
        commit_ts: ts(wall),
        prev_value: None,
        partition: "partition-0".to_string(),
    }
}

/// One step of a scripted subscription.
pub enum ScriptStep {
    Deliver(StreamEvent),
    Sleep(Duration),
    Fail(String),
}

pub struct ScriptedSubscription {
    steps: VecDeque<ScriptStep>,
}

#[async_trait]
impl Subscription for ScriptedSubscription {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, SourceError> {
        while let Some(step) = self.steps.pop_front() {
            match step {
                ScriptStep::Deliver(event) => return Ok(Some(event)),
                ScriptStep::Sleep(duration) => tokio::time::sleep(duration).await,
                ScriptStep::Fail(message) => return Err(SourceError::Receive(message)),
            }
        }
        Ok(None)
    }
}

/// Client that hands out one scripted subscription and records the spec it
/// was opened with.
pub struct ScriptedClient {
    steps: Mutex<Option<VecDeque<ScriptStep>>>,
    last_spec: Mutex<Option<SubscriptionSpec>>,
}

impl ScriptedClient {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(Some(steps.into())),
            last_spec: Mutex::new(None),
        }
    }

    /// A client whose subscribe call fails outright.
    pub fn refusing() -> Self {
        Self {
            steps: Mutex::new(None),
            last_spec: Mutex::new(None),
        }
    }

    pub fn subscribed_spec(&self) -> Option<SubscriptionSpec> {
        self.last_spec.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplicationStreamClient for ScriptedClient {
    async fn subscribe(
        &self,
        spec: SubscriptionSpec,
    ) -> Result<Box<dyn Subscription>, SourceError> {
        *self.last_spec.lock().unwrap() = Some(spec);
        match self.steps.lock().unwrap().take() {
            Some(steps) => Ok(Box::new(ScriptedSubscription { steps })),
            None => Err(SourceError::Subscribe("no partition available".to_string())),
        }
    }

    async fn close(&self) {}
}

/// Destination row state keyed by row prefix.
pub type SharedTable = Arc<Mutex<HashMap<Vec<u8>, (SourceTimestamp, Vec<u8>)>>>;

/// Worker id → set of row prefixes it applied, for key-grouping assertions.
pub type WorkerAssignments = Arc<Mutex<HashMap<usize, HashSet<Vec<u8>>>>>;

/// In-memory destination with last-write-wins semantics.
///
/// Rows whose prefix appears in `fk_requirements` fail with a retriable
/// foreign-key violation until the named parent prefix exists; rows whose
/// prefix appears in `poison` always fail permanently.
pub struct MemoryRowProcessor {
    pub table: SharedTable,
    pub worker_id: usize,
    pub assignments: Option<WorkerAssignments>,
    pub fk_requirements: Arc<HashMap<Vec<u8>, Vec<u8>>>,
    pub poison: Arc<HashSet<Vec<u8>>>,
    in_txn: bool,
    staged: Vec<(Vec<u8>, (SourceTimestamp, Vec<u8>))>,
    last: Option<DecodedRow>,
}

impl MemoryRowProcessor {
    pub fn new(table: SharedTable, worker_id: usize) -> Self {
        Self {
            table,
            worker_id,
            assignments: None,
            fk_requirements: Arc::new(HashMap::new()),
            poison: Arc::new(HashSet::new()),
            in_txn: false,
            staged: Vec::new(),
            last: None,
        }
    }

    pub fn with_assignments(mut self, assignments: WorkerAssignments) -> Self {
        self.assignments = Some(assignments);
        self
    }

    pub fn with_fk_requirements(mut self, reqs: Arc<HashMap<Vec<u8>, Vec<u8>>>) -> Self {
        self.fk_requirements = reqs;
        self
    }

    pub fn with_poison(mut self, poison: Arc<HashSet<Vec<u8>>>) -> Self {
        self.poison = poison;
        self
    }

    fn parent_present(&self, parent: &[u8]) -> bool {
        self.table.lock().unwrap().contains_key(parent)
            || self.staged.iter().any(|(key, _)| key.as_slice() == parent)
    }
}

#[async_trait]
impl RowProcessor for MemoryRowProcessor {
    async fn process_row(&mut self, kv: &KvEvent) -> Result<BatchStats, ApplyError> {
        let prefix = row_prefix(&kv.key).to_vec();
        self.last = Some(
            DecodedRow::new("rows").with_column(
                "key",
                serde_json::json!(String::from_utf8_lossy(&prefix).to_string()),
            ),
        );

        if self.poison.contains(&prefix) {
            return Err(ApplyError::ConstraintViolation(format!(
                "row {} violates a check constraint",
                String::from_utf8_lossy(&prefix)
            )));
        }
        if let Some(parent) = self.fk_requirements.get(&prefix) {
            if !self.parent_present(parent) {
                return Err(ApplyError::ForeignKeyViolation(format!(
                    "missing parent {}",
                    String::from_utf8_lossy(parent)
                )));
            }
        }

        if let Some(assignments) = &self.assignments {
            assignments
                .lock()
                .unwrap()
                .entry(self.worker_id)
                .or_default()
                .insert(prefix.clone());
        }

        let stats = BatchStats {
            not_processed: 0,
            byte_size: kv.byte_size() as u64,
            optimistic_insert_conflicts: 0,
        };

        // Last write wins: an incoming revision at or below the destination
        // row's timestamp is a no-op, which also makes re-application of an
        // already-applied update idempotent.
        let newer = {
            let table = self.table.lock().unwrap();
            let staged = self.staged.iter().rev().find(|(key, _)| *key == prefix);
            let current = staged
                .map(|(_, value)| value)
                .or_else(|| table.get(&prefix));
            current.map_or(true, |(applied_ts, _)| *applied_ts < kv.commit_ts)
        };
        if !newer {
            return Ok(stats);
        }

        if self.in_txn {
            self.staged
                .push((prefix, (kv.commit_ts, kv.value.clone())));
        } else {
            self.table
                .lock()
                .unwrap()
                .insert(prefix, (kv.commit_ts, kv.value.clone()));
        }
        Ok(stats)
    }

    async fn begin_transaction(&mut self) -> Result<(), ApplyError> {
        self.in_txn = true;
        self.staged.clear();
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<(), ApplyError> {
        let mut table = self.table.lock().unwrap();
        for (key, value) in self.staged.drain(..) {
            table.insert(key, value);
        }
        self.in_txn = false;
        Ok(())
    }

    async fn abort_transaction(&mut self) -> Result<(), ApplyError> {
        self.staged.clear();
        self.in_txn = false;
        Ok(())
    }

    fn last_row(&self) -> Option<DecodedRow> {
        self.last.clone()
    }
}

/// Builder for a worker pool of batch handlers over one shared table.
pub struct HandlerPool {
    pub table: SharedTable,
    pub assignments: WorkerAssignments,
    pub fk_requirements: Arc<HashMap<Vec<u8>, Vec<u8>>>,
    pub poison: Arc<HashSet<Vec<u8>>>,
}

impl HandlerPool {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            assignments: Arc::new(Mutex::new(HashMap::new())),
            fk_requirements: Arc::new(HashMap::new()),
            poison: Arc::new(HashSet::new()),
        }
    }

    pub fn requiring_parent(mut self, child: &[u8], parent: &[u8]) -> Self {
        let mut reqs = (*self.fk_requirements).clone();
        reqs.insert(child.to_vec(), parent.to_vec());
        self.fk_requirements = Arc::new(reqs);
        self
    }

    pub fn poisoning(mut self, prefix: &[u8]) -> Self {
        let mut poison = (*self.poison).clone();
        poison.insert(prefix.to_vec());
        self.poison = Arc::new(poison);
        self
    }

    pub fn handlers(&self, workers: usize) -> Vec<Box<dyn BatchHandler>> {
        (0..workers)
            .map(|worker_id| {
                let rp = MemoryRowProcessor::new(Arc::clone(&self.table), worker_id)
                    .with_assignments(Arc::clone(&self.assignments))
                    .with_fk_requirements(Arc::clone(&self.fk_requirements))
                    .with_poison(Arc::clone(&self.poison));
                Box::new(TransactionalBatchHandler::new(rp)) as Box<dyn BatchHandler>
            })
            .collect()
    }

    /// The value currently applied for a row prefix.
    pub fn value_of(&self, prefix: &[u8]) -> Option<Vec<u8>> {
        self.table
            .lock()
            .unwrap()
            .get(prefix)
            .map(|(_, value)| value.clone())
    }
}

/// Retry policy that consults the error taxonomy instead of retrying
/// everything.
pub fn retry_by_taxonomy(err: &ApplyError) -> bool {
    err.is_retriable()
}
