//! Wire-level event model for the replication stream
//!
//! A subscription delivers a mixed stream of row updates ([`KvEvent`]),
//! resolved-timestamp checkpoints, and control events. Row updates carry the
//! commit timestamp assigned by the source cluster; checkpoints carry
//! [`ResolvedSpan`]s asserting that no further updates at or below a
//! timestamp will appear for a key range.

use serde::{Deserialize, Serialize};

/// Commit timestamp assigned by the source cluster.
///
/// Ordered lexicographically by `(wall_nanos, logical)`; the logical
/// component disambiguates updates committed in the same nanosecond.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SourceTimestamp {
    pub wall_nanos: i64,
    pub logical: u32,
}

impl SourceTimestamp {
    pub fn new(wall_nanos: i64, logical: u32) -> Self {
        Self {
            wall_nanos,
            logical,
        }
    }

    /// The zero timestamp, used as the sentinel for "no timestamp".
    pub fn is_empty(&self) -> bool {
        self.wall_nanos == 0 && self.logical == 0
    }
}

impl std::fmt::Display for SourceTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:010}", self.wall_nanos, self.logical)
    }
}

/// Half-open key range `[start, end)` over byte-string keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl Span {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key < self.end.as_slice()
    }

    /// A span is valid when it covers at least one key.
    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            String::from_utf8_lossy(&self.start),
            String::from_utf8_lossy(&self.end)
        )
    }
}

/// A claim by the source that no more events with commit timestamp at or
/// below `timestamp` will appear for keys in `span`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSpan {
    pub span: Span,
    pub timestamp: SourceTimestamp,
}

impl ResolvedSpan {
    pub fn new(span: Span, timestamp: SourceTimestamp) -> Self {
        Self { span, timestamp }
    }
}

/// A single row update from the replication stream.
///
/// The default value is the **sentinel-zeroed** event (empty key) that the
/// applier writes back into a buffer slot once the slot has been processed,
/// either by applying it or by sending it to the dead-letter queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEvent {
    /// Row key, including any column-family suffix.
    pub key: Vec<u8>,
    /// Encoded row value as committed on the source.
    pub value: Vec<u8>,
    /// Commit timestamp embedded in the source value.
    pub commit_ts: SourceTimestamp,
    /// Value before the change was applied on the source, when the
    /// subscription was opened with previous-value delivery.
    pub prev_value: Option<Vec<u8>>,
    /// Opaque identifier of the source partition that produced the event.
    pub partition: String,
}

impl KvEvent {
    /// True once the applier has marked this buffer slot as processed.
    pub fn is_applied(&self) -> bool {
        self.key.is_empty()
    }

    /// Reset this slot to the sentinel-zeroed value.
    pub fn clear(&mut self) {
        *self = KvEvent::default();
    }

    /// Logical byte size used for apply accounting.
    pub fn byte_size(&self) -> usize {
        self.key.len()
            + self.value.len()
            + self.prev_value.as_ref().map(Vec::len).unwrap_or_default()
    }

    /// The portion of the key that identifies the logical row.
    pub fn row_prefix(&self) -> &[u8] {
        row_prefix(&self.key)
    }
}

impl std::fmt::Display for KvEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "kv key={} ts={} ({} bytes)",
            String::from_utf8_lossy(&self.key),
            self.commit_ts,
            self.byte_size()
        )
    }
}

/// Strips the trailing column-family suffix from a key.
///
/// The final key byte encodes the length of the suffix in bytes, counting
/// the length byte itself. A key whose final byte does not describe a valid
/// suffix (zero, or longer than the key) is its own row prefix.
pub fn row_prefix(key: &[u8]) -> &[u8] {
    match key.last() {
        Some(&n) if n > 0 && (n as usize) < key.len() => &key[..key.len() - n as usize],
        _ => key,
    }
}

/// One event delivered by a partition subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A batch of row updates.
    Kvs(Vec<KvEvent>),
    /// Resolved-timestamp checkpoint for a set of spans.
    Checkpoint(Vec<ResolvedSpan>),
    /// Bulk ingestion data; never valid on an online stream.
    Sstable { span: Span },
    /// Bulk deletion; never valid on an online stream.
    DeleteRange { span: Span },
    /// Source-side range split notification; informational only.
    Split { split_key: Vec<u8> },
}

impl StreamEvent {
    /// Short name used in log and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Kvs(_) => "kvs",
            StreamEvent::Checkpoint(_) => "checkpoint",
            StreamEvent::Sstable { .. } => "sstable",
            StreamEvent::DeleteRange { .. } => "delete-range",
            StreamEvent::Split { .. } => "split",
        }
    }
}
