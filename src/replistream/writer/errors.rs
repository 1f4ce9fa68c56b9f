//! Error types for the replication writer
//!
//! Two layers: [`ApplyError`] describes why a single row (or batch) failed
//! to apply on the destination and drives the retry / dead-letter decision;
//! [`WriterError`] is the fatal pipeline taxonomy surfaced on the
//! processor's error channel.

use crate::replistream::frontier::FrontierError;
use crate::replistream::source::SourceError;
use std::error::Error;
use std::fmt;

/// Why a row update failed to apply on the destination.
#[derive(Debug, Clone)]
pub enum ApplyError {
    /// Referenced parent row is missing; resolves once the parent
    /// replicates.
    ForeignKeyViolation(String),
    /// Write-write contention on the destination.
    Contention(String),
    /// Destination temporarily unavailable.
    Unavailable(String),
    /// Duplicate key that last-write-wins cannot resolve.
    UniqueViolation(String),
    /// Structural constraint that will not resolve with time.
    ConstraintViolation(String),
    /// Destination schema does not accept the decoded row.
    Schema(String),
    /// Transport-level destination failure.
    Io(String),
}

impl ApplyError {
    /// Whether retrying this error later could plausibly succeed, e.g. after
    /// the parent side of an FK relationship is ingested by another
    /// processor. The default retry policy does not consult this; a
    /// stricter policy may.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ApplyError::ForeignKeyViolation(_)
                | ApplyError::Contention(_)
                | ApplyError::Unavailable(_)
        )
    }
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyError::ForeignKeyViolation(msg) => write!(f, "foreign key violation: {}", msg),
            ApplyError::Contention(msg) => write!(f, "contention: {}", msg),
            ApplyError::Unavailable(msg) => write!(f, "destination unavailable: {}", msg),
            ApplyError::UniqueViolation(msg) => write!(f, "unique violation: {}", msg),
            ApplyError::ConstraintViolation(msg) => write!(f, "constraint violation: {}", msg),
            ApplyError::Schema(msg) => write!(f, "schema error: {}", msg),
            ApplyError::Io(msg) => write!(f, "destination i/o error: {}", msg),
        }
    }
}

impl Error for ApplyError {}

/// Fatal errors that drain the processor. First one wins; the rest are
/// dropped with a debug log.
#[derive(Debug)]
pub enum WriterError {
    /// The subscription or its transport failed.
    Subscription(SourceError),
    /// An event kind that is never valid on an online stream.
    UnexpectedEvent(&'static str),
    /// The source violated the stream protocol.
    Protocol(String),
    /// A resolved span could not be forwarded.
    Frontier(FrontierError),
    /// The dead-letter queue refused a write; the event would be lost.
    DeadLetterQueue(String),
    /// A progress row could not be serialized.
    Progress(serde_json::Error),
    /// The processor is shutting down.
    Closed,
}

impl fmt::Display for WriterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriterError::Subscription(err) => write!(f, "subscription: {}", err),
            WriterError::UnexpectedEvent(kind) => {
                write!(f, "unexpected event for online stream: {}", kind)
            }
            WriterError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            WriterError::Frontier(err) => {
                write!(f, "unable to forward checkpoint frontier: {}", err)
            }
            WriterError::DeadLetterQueue(msg) => write!(f, "dead letter queue: {}", msg),
            WriterError::Progress(err) => write!(f, "encoding progress row: {}", err),
            WriterError::Closed => write!(f, "processor is shutting down"),
        }
    }
}

impl Error for WriterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WriterError::Subscription(err) => Some(err),
            WriterError::Frontier(err) => Some(err),
            WriterError::Progress(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SourceError> for WriterError {
    fn from(err: SourceError) -> Self {
        WriterError::Subscription(err)
    }
}

impl From<FrontierError> for WriterError {
    fn from(err: FrontierError) -> Self {
        WriterError::Frontier(err)
    }
}

impl From<serde_json::Error> for WriterError {
    fn from(err: serde_json::Error) -> Self {
        WriterError::Progress(err)
    }
}
