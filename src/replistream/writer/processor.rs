//! The replication writer processor
//!
//! Consumes a cross-cluster replication stream for one partition, applying
//! row updates through the parallel applier and emitting checkpointed
//! progress rows.
//!
//! A subscription's event stream is read by the subscription loop task and
//! handed, one event at a time, to the dispatcher task:
//!
//!   client.subscribe -> subscription loop -> dispatcher -> next_progress()
//!
//! At most one flush is in flight at a time; because the dispatcher
//! consumes events serially, the subscription cannot outrun the applier.
//! All errors are reported to `next_progress` via the error channel, with
//! the first error winning.

use crate::replistream::events::{KvEvent, ResolvedSpan, SourceTimestamp, Span, StreamEvent};
use crate::replistream::frontier::SpanFrontier;
use crate::replistream::source::{
    redact_source_uri, ReplicationStreamClient, Subscription, SubscriptionOptions,
    SubscriptionSpec,
};
use crate::replistream::writer::applier::{retry_all, BufferApplier, RetryPolicy};
use crate::replistream::writer::batch::BatchHandler;
use crate::replistream::writer::config::{WriterConfig, MAX_WRITER_WORKERS};
use crate::replistream::writer::debug::DebugStatus;
use crate::replistream::writer::dlq::DeadLetterQueueClient;
use crate::replistream::writer::errors::WriterError;
use crate::replistream::writer::gate::{CheckpointGate, ElideCheckpoint};
use crate::replistream::writer::metrics::WriterMetrics;
use crate::replistream::writer::progress::{encode_resolved_spans, ProgressRow};
use crate::replistream::writer::purgatory::Purgatory;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Everything the job harness knows about one partition assignment.
#[derive(Debug, Clone)]
pub struct WriterSpec {
    pub job_id: u64,
    pub stream_id: u64,
    pub processor_id: i32,
    /// Opaque token identifying the partition on the source.
    pub partition_token: Vec<u8>,
    /// Source address for this partition; redacted before logging.
    pub partition_address: String,
    /// Spans this processor is responsible for.
    pub partition_spans: Vec<Span>,
    /// Timestamp of the already-performed initial scan.
    pub initial_scan_ts: SourceTimestamp,
    /// Frontier seed: everything at or below this is already replicated.
    pub previous_replicated_ts: SourceTimestamp,
    /// Per-span progress from the job's previous checkpoint.
    pub checkpoint: Vec<ResolvedSpan>,
}

/// Called with the redacted address, partition token, and current frontier
/// just before the subscription is opened.
pub type BeforeSubscribe = Box<dyn Fn(&str, &[u8], SourceTimestamp) + Send>;

/// Called after each event is received, before it is handled; an error
/// fails the dispatcher.
pub type AfterReceive = Box<dyn Fn(&StreamEvent) -> Result<(), WriterError> + Send>;

/// Callbacks injectable for deterministic tests.
#[derive(Default)]
pub struct TestingHooks {
    pub before_subscribe: Option<BeforeSubscribe>,
    pub after_receive: Option<AfterReceive>,
    pub elide_checkpoint: Option<ElideCheckpoint>,
}

/// Lifecycle of the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Starting,
    Running,
    Draining,
    Closed,
}

/// Per-partition stateful stream consumer.
///
/// Construct once, `start` once, pull progress rows with `next_progress`
/// until it returns `None`, then `close`.
pub struct ReplicationWriterProcessor {
    spec: WriterSpec,
    state: ProcessorState,
    debug: Arc<DebugStatus>,
    checkpoint_rx: mpsc::Receiver<Vec<ResolvedSpan>>,
    error_tx: mpsc::Sender<WriterError>,
    error_rx: mpsc::Receiver<WriterError>,
    stop_tx: broadcast::Sender<()>,
    client: Option<Arc<dyn ReplicationStreamClient>>,
    tasks: Vec<JoinHandle<()>>,
    drain_error: Option<WriterError>,
    before_subscribe: Option<BeforeSubscribe>,
    /// Dispatcher state handed to the dispatcher task by `start`.
    startup: Option<EventDispatcher>,
}

impl ReplicationWriterProcessor {
    /// Build a processor whose frontier is seeded from the job's previously
    /// replicated timestamp plus any previously resolved checkpoint spans.
    /// One batch handler per worker; the pool size caps apply parallelism.
    pub fn new(
        spec: WriterSpec,
        config: WriterConfig,
        handlers: Vec<Box<dyn BatchHandler>>,
        dlq: Arc<dyn DeadLetterQueueClient>,
        metrics: Arc<WriterMetrics>,
        hooks: TestingHooks,
    ) -> Result<Self, WriterError> {
        Self::with_retry_policy(spec, config, handlers, dlq, metrics, hooks, retry_all)
    }

    pub fn with_retry_policy(
        spec: WriterSpec,
        config: WriterConfig,
        mut handlers: Vec<Box<dyn BatchHandler>>,
        dlq: Arc<dyn DeadLetterQueueClient>,
        metrics: Arc<WriterMetrics>,
        hooks: TestingHooks,
        retry_policy: RetryPolicy,
    ) -> Result<Self, WriterError> {
        // The handler pool caps apply parallelism; the pool never exceeds
        // the configured worker bound.
        let worker_limit = config.max_workers.clamp(1, MAX_WRITER_WORKERS);
        if handlers.len() > worker_limit {
            warn!(
                "truncating batch handler pool from {} to {} workers",
                handlers.len(),
                worker_limit
            );
            handlers.truncate(worker_limit);
        }

        let mut frontier =
            SpanFrontier::new(spec.previous_replicated_ts, &spec.partition_spans)?;
        for resolved_span in &spec.checkpoint {
            frontier.forward(&resolved_span.span, resolved_span.timestamp)?;
        }

        let debug = Arc::new(DebugStatus::new(spec.stream_id, spec.processor_id));
        let (checkpoint_tx, checkpoint_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (stop_tx, _) = broadcast::channel(1);

        let applier = BufferApplier::new(
            spec.job_id,
            handlers,
            config.clone(),
            dlq,
            Arc::clone(&metrics),
            Arc::clone(&debug),
            retry_policy,
        );
        let gate = CheckpointGate::new(frontier, checkpoint_tx, metrics, hooks.elide_checkpoint);
        let dispatcher = EventDispatcher {
            applier,
            purgatory: Purgatory::new(config.purgatory.clone()),
            gate,
            debug: Arc::clone(&debug),
            after_receive: hooks.after_receive,
        };

        Ok(Self {
            spec,
            state: ProcessorState::Starting,
            debug,
            checkpoint_rx,
            error_tx,
            error_rx,
            stop_tx,
            client: None,
            tasks: Vec::new(),
            drain_error: None,
            before_subscribe: hooks.before_subscribe,
            startup: Some(dispatcher),
        })
    }

    /// Open the subscription and launch the subscription-loop and
    /// dispatcher tasks. A subscribe failure drains the processor instead
    /// of returning an error; `next_progress` surfaces it.
    pub async fn start(&mut self, client: Arc<dyn ReplicationStreamClient>) {
        let dispatcher = match self.startup.take() {
            Some(dispatcher) => dispatcher,
            None => return,
        };

        let redacted = match redact_source_uri(&self.spec.partition_address) {
            Ok(redacted) => redacted,
            Err(_) => {
                warn!("could not redact stream address");
                "<unredacted source address>".to_string()
            }
        };
        info!(
            "starting logical replication writer for job {} stream {} ({} spans) from {}",
            self.spec.job_id,
            self.spec.stream_id,
            self.spec.partition_spans.len(),
            redacted
        );

        if let Some(hook) = &self.before_subscribe {
            hook(
                &redacted,
                &self.spec.partition_token,
                dispatcher.gate.frontier(),
            );
        }

        let subscription_spec = SubscriptionSpec {
            stream_id: self.spec.stream_id,
            partition_token: self.spec.partition_token.clone(),
            consumer_id: self.spec.processor_id,
            initial_scan_ts: self.spec.initial_scan_ts,
            frontier: dispatcher.gate.resolved_spans(),
            options: SubscriptionOptions::default(),
        };
        let subscription = match client.subscribe(subscription_spec).await {
            Ok(subscription) => subscription,
            Err(err) => {
                self.move_to_draining(Some(err.into()));
                return;
            }
        };
        self.client = Some(client);
        self.state = ProcessorState::Running;

        let (event_tx, event_rx) = mpsc::channel(1);
        let stop_rx = self.stop_tx.subscribe();
        let error_tx = self.error_tx.clone();
        self.tasks.push(tokio::spawn(subscription_loop(
            subscription,
            event_tx,
            stop_rx,
            error_tx,
        )));

        let error_tx = self.error_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut dispatcher = dispatcher;
            if let Err(err) = dispatcher.consume_events(event_rx).await {
                send_error(&error_tx, err);
            }
            // Dropping the dispatcher closes the checkpoint channel, which
            // is how next_progress learns the stream is done.
        }));
    }

    /// Pull the next progress row.
    ///
    /// Returns `Some(Ok(row))` for each emitted checkpoint, `Some(Err(e))`
    /// exactly once when the processor drains on a fatal error, and `None`
    /// once drained (cleanly or after the error was returned).
    pub async fn next_progress(&mut self) -> Option<Result<ProgressRow, WriterError>> {
        if self.state != ProcessorState::Running {
            return self.take_drain();
        }

        tokio::select! {
            resolved = self.checkpoint_rx.recv() => match resolved {
                Some(resolved) => match encode_resolved_spans(&resolved) {
                    Ok(row) => Some(Ok(row)),
                    Err(err) => {
                        self.move_to_draining(Some(err.into()));
                        self.take_drain()
                    }
                },
                None => {
                    // The dispatcher is gone. One non-blocking error read,
                    // then a clean drain.
                    let pending = self.error_rx.try_recv().ok();
                    self.move_to_draining(pending);
                    self.take_drain()
                }
            },
            err = self.error_rx.recv() => {
                self.move_to_draining(err);
                self.take_drain()
            }
        }
    }

    /// Close the client, stop the tasks, and join them. Idempotent.
    pub async fn close(&mut self) {
        if self.state == ProcessorState::Closed {
            return;
        }
        if let Some(client) = self.client.take() {
            client.close().await;
        }
        let _ = self.stop_tx.send(());
        // Failing pending checkpoint sends unblocks a dispatcher that is
        // mid-emission.
        self.checkpoint_rx.close();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                error!("error on close(): {}", err);
            }
        }
        self.state = ProcessorState::Closed;
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// Operator-facing status for this processor.
    pub fn debug_status(&self) -> Arc<DebugStatus> {
        Arc::clone(&self.debug)
    }

    fn move_to_draining(&mut self, err: Option<WriterError>) {
        if let Some(err) = &err {
            info!("gracefully draining with error {}", err);
        }
        if self.state != ProcessorState::Closed {
            self.state = ProcessorState::Draining;
        }
        if self.drain_error.is_none() {
            self.drain_error = err;
        }
    }

    fn take_drain(&mut self) -> Option<Result<ProgressRow, WriterError>> {
        self.drain_error.take().map(Err)
    }
}

impl Drop for ReplicationWriterProcessor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Publish an error with first-error-wins semantics: the channel holds one
/// slot and later errors are dropped with a log entry.
fn send_error(error_tx: &mpsc::Sender<WriterError>, err: WriterError) {
    if let Err(send_err) = error_tx.try_send(err) {
        debug!("dropping additional error: {}", send_err.into_inner());
    }
}

/// Pulls events off the subscription and feeds the dispatcher's channel;
/// closing the channel signals termination.
async fn subscription_loop(
    mut subscription: Box<dyn Subscription>,
    event_tx: mpsc::Sender<StreamEvent>,
    mut stop_rx: broadcast::Receiver<()>,
    error_tx: mpsc::Sender<WriterError>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            next = subscription.next_event() => match next {
                Ok(Some(event)) => {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    send_error(&error_tx, err.into());
                    break;
                }
            },
        }
    }
}

/// Serially classifies events and routes row buffers to the applier,
/// checkpoints to the frontier gate.
struct EventDispatcher {
    applier: BufferApplier,
    purgatory: Purgatory,
    gate: CheckpointGate,
    debug: Arc<DebugStatus>,
    after_receive: Option<AfterReceive>,
}

impl EventDispatcher {
    async fn consume_events(
        &mut self,
        mut events: mpsc::Receiver<StreamEvent>,
    ) -> Result<(), WriterError> {
        let mut before = Instant::now();
        while let Some(event) = events.recv().await {
            self.debug.record_recv(before.elapsed());
            before = Instant::now();
            self.handle_event(event).await?;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: StreamEvent) -> Result<(), WriterError> {
        if let Some(hook) = &self.after_receive {
            hook(&event)?;
        }
        match event {
            StreamEvent::Kvs(kvs) => self.handle_stream_buffer(kvs).await,
            StreamEvent::Checkpoint(resolved) => self.maybe_checkpoint(resolved).await,
            StreamEvent::Split { split_key } => {
                info!(
                    "split event received on logical replication stream at {}",
                    String::from_utf8_lossy(&split_key)
                );
                Ok(())
            }
            other @ (StreamEvent::Sstable { .. } | StreamEvent::DeleteRange { .. }) => {
                Err(WriterError::UnexpectedEvent(other.kind()))
            }
        }
    }

    /// Flush a buffer of row updates; whatever fails transiently goes to
    /// purgatory (which may force-drain if it is already full).
    async fn handle_stream_buffer(&mut self, kvs: Vec<KvEvent>) -> Result<(), WriterError> {
        let unapplied = self.applier.flush_buffer(kvs, false).await?;
        self.purgatory
            .store(unapplied, &mut self.applier, &mut self.gate)
            .await
    }

    /// Non-empty purgatory intercepts the checkpoint and gets a drain
    /// attempt; otherwise the checkpoint forwards straight through the
    /// gate.
    async fn maybe_checkpoint(&mut self, resolved: Vec<ResolvedSpan>) -> Result<(), WriterError> {
        if !self.purgatory.is_empty() {
            self.purgatory.attach_checkpoint(resolved);
            return self
                .purgatory
                .drain(&mut self.applier, &mut self.gate)
                .await;
        }
        self.gate.checkpoint(resolved).await
    }
}
