//! Library for cross-cluster logical replication
//!
//! This library provides a per-partition replication writer that consumes a
//! change stream from a source cluster and applies row updates to a
//! destination, maintaining a checkpointed resolved-timestamp frontier.

// Export the replistream module structure
pub mod replistream;

// Re-export main API
pub use replistream::{
    events::{KvEvent, ResolvedSpan, SourceTimestamp, Span, StreamEvent},
    frontier::SpanFrontier,
    source::{ReplicationStreamClient, Subscription, SubscriptionOptions, SubscriptionSpec},
    writer::{
        ApplyError, BatchHandler, DeadLetterQueueClient, ProgressRow, PurgatoryConfig,
        ReplicationWriterProcessor, RowProcessor, WriterConfig, WriterError,
    },
};
