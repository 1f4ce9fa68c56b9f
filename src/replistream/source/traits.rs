//! Client and subscription traits for the replication stream transport

use crate::replistream::events::{ResolvedSpan, SourceTimestamp, StreamEvent};
use async_trait::async_trait;
use std::error::Error;
use std::fmt;

/// Errors surfaced by the stream transport.
#[derive(Debug)]
pub enum SourceError {
    /// Failed to establish the client connection.
    Connect(String),
    /// Failed to open the partition subscription.
    Subscribe(String),
    /// The stream broke mid-subscription.
    Receive(String),
    /// The client was closed while a receive was pending.
    Closed,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Connect(msg) => write!(f, "connecting to source: {}", msg),
            SourceError::Subscribe(msg) => write!(f, "subscribing to partition: {}", msg),
            SourceError::Receive(msg) => write!(f, "receiving from stream: {}", msg),
            SourceError::Closed => write!(f, "stream client closed"),
        }
    }
}

impl Error for SourceError {}

/// Capability flags negotiated when opening a subscription.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionOptions {
    /// Ask the source to filter events server-side to the subscribed spans.
    pub with_filtering: bool,
    /// Ask the source to deliver the previous value alongside each update.
    pub with_diff: bool,
    /// Ask the transport to compress the stream.
    pub with_compression: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            with_filtering: true,
            with_diff: true,
            with_compression: true,
        }
    }
}

/// Everything needed to open a subscription to one source partition.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub stream_id: u64,
    /// Opaque token identifying the partition on the source.
    pub partition_token: Vec<u8>,
    /// Consumer identity reported to the source for observability.
    pub consumer_id: i32,
    /// Timestamp of the initial scan this stream continues from.
    pub initial_scan_ts: SourceTimestamp,
    /// Current per-span progress; the source resumes each span past it.
    pub frontier: Vec<ResolvedSpan>,
    pub options: SubscriptionOptions,
}

/// An open event stream for one partition.
///
/// Events are pulled serially; the subscription ends by returning `None`
/// once the source has closed the stream cleanly.
#[async_trait]
pub trait Subscription: Send {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, SourceError>;
}

/// Client connection to the source cluster.
#[async_trait]
pub trait ReplicationStreamClient: Send + Sync {
    async fn subscribe(
        &self,
        spec: SubscriptionSpec,
    ) -> Result<Box<dyn Subscription>, SourceError>;

    /// Close the connection, unblocking any pending receives.
    async fn close(&self);
}
