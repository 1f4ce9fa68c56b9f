//! The per-partition replication writer
//!
//! Layered as: subscription loop → dispatcher → parallel applier → batch
//! handler, with purgatory gating the frontier and checkpoint emission.

pub mod applier;
pub mod batch;
pub mod config;
pub mod debug;
pub mod dlq;
pub mod errors;
pub mod gate;
pub mod metrics;
pub mod processor;
pub mod progress;
pub mod purgatory;

pub use applier::{retry_all, BufferApplier, RetryPolicy};
pub use batch::{BatchHandler, BatchStats, RowProcessor, TransactionalBatchHandler};
pub use config::{PurgatoryConfig, WriterConfig, MAX_WRITER_WORKERS};
pub use debug::{DebugStatus, DebugStatusSnapshot};
pub use dlq::{
    BufferingDeadLetterQueue, DeadLetterEntry, DeadLetterQueueClient, DecodedRow,
    LoggingDeadLetterQueue,
};
pub use errors::{ApplyError, WriterError};
pub use gate::CheckpointGate;
pub use metrics::WriterMetrics;
pub use processor::{
    ProcessorState, ReplicationWriterProcessor, TestingHooks, WriterSpec,
};
pub use progress::{decode_resolved_spans, encode_resolved_spans, ProgressRow};
pub use purgatory::Purgatory;
