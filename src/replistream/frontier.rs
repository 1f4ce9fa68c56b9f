//! Span-partitioned resolved-timestamp frontier
//!
//! The frontier tracks, for a covering set of key spans, the highest
//! timestamp up to which the stream is resolved. The overall frontier is the
//! minimum across all tracked segments, so it only advances once every
//! tracked span has advanced. Per-span timestamps are monotonically
//! non-decreasing for the lifetime of the frontier.

use crate::replistream::events::{ResolvedSpan, Span, SourceTimestamp};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::ops::Bound;

/// Errors from frontier construction and forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontierError {
    /// A span with `start >= end` was supplied.
    EmptySpan(Span),
    /// The frontier must track at least one span.
    NoTrackedSpans,
    /// A forwarded span is not fully covered by the tracked span set.
    NotTracked(Span),
}

impl fmt::Display for FrontierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrontierError::EmptySpan(span) => write!(f, "empty span {}", span),
            FrontierError::NoTrackedSpans => write!(f, "frontier requires at least one span"),
            FrontierError::NotTracked(span) => {
                write!(f, "span {} is not covered by the tracked span set", span)
            }
        }
    }
}

impl Error for FrontierError {}

#[derive(Debug, Clone)]
struct Segment {
    end: Vec<u8>,
    ts: SourceTimestamp,
}

/// Ordered, non-overlapping segments keyed by start key.
///
/// `forward` splits segments at the boundaries of the forwarded span, so the
/// segment set refines over time but always covers exactly the key range the
/// frontier was constructed with.
#[derive(Debug, Clone)]
pub struct SpanFrontier {
    segments: BTreeMap<Vec<u8>, Segment>,
}

impl SpanFrontier {
    /// Build a frontier at `initial` over the given spans. Overlapping or
    /// adjacent spans are coalesced.
    pub fn new(initial: SourceTimestamp, spans: &[Span]) -> Result<Self, FrontierError> {
        if spans.is_empty() {
            return Err(FrontierError::NoTrackedSpans);
        }
        let mut sorted: Vec<&Span> = spans.iter().collect();
        for span in &sorted {
            if !span.is_valid() {
                return Err(FrontierError::EmptySpan((*span).clone()));
            }
        }
        sorted.sort_by(|a, b| a.start.cmp(&b.start));

        let mut segments = BTreeMap::new();
        let mut current = sorted[0].clone();
        for span in sorted.into_iter().skip(1) {
            if span.start <= current.end {
                if span.end > current.end {
                    current.end = span.end.clone();
                }
            } else {
                segments.insert(
                    current.start,
                    Segment {
                        end: current.end,
                        ts: initial,
                    },
                );
                current = span.clone();
            }
        }
        segments.insert(
            current.start,
            Segment {
                end: current.end,
                ts: initial,
            },
        );
        Ok(Self { segments })
    }

    /// Advance the timestamp for `span` to at least `ts`.
    ///
    /// Sub-spans already at or beyond `ts` are left untouched; forwarding is
    /// a per-segment `max`, never a lowering. Returns whether the overall
    /// frontier advanced. Forwarding a span that is not fully covered by the
    /// tracked set is an error.
    pub fn forward(&mut self, span: &Span, ts: SourceTimestamp) -> Result<bool, FrontierError> {
        if !span.is_valid() {
            return Err(FrontierError::EmptySpan(span.clone()));
        }
        let before = self.frontier();

        // Gather the tracked segments intersecting the span: the predecessor
        // that may straddle span.start, then everything starting inside it.
        let mut keys: Vec<Vec<u8>> = Vec::new();
        if let Some((start, seg)) = self
            .segments
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(span.start.as_slice())))
            .next_back()
        {
            if seg.end.as_slice() > span.start.as_slice() {
                keys.push(start.clone());
            }
        }
        for (start, _) in self.segments.range::<[u8], _>((
            Bound::Excluded(span.start.as_slice()),
            Bound::Excluded(span.end.as_slice()),
        )) {
            keys.push(start.clone());
        }

        // The intersecting segments must cover the span contiguously.
        let mut cursor = span.start.clone();
        for key in &keys {
            if *key > cursor {
                return Err(FrontierError::NotTracked(span.clone()));
            }
            cursor = self.segments[key].end.clone();
        }
        if cursor < span.end {
            return Err(FrontierError::NotTracked(span.clone()));
        }

        // Split each intersecting segment at the span boundaries and raise
        // the covered portion.
        for key in keys {
            let seg = self.segments.remove(&key).expect("segment disappeared");
            if key < span.start {
                self.segments.insert(
                    key.clone(),
                    Segment {
                        end: span.start.clone(),
                        ts: seg.ts,
                    },
                );
            }
            let mid_start = key.clone().max(span.start.clone());
            let mid_end = seg.end.clone().min(span.end.clone());
            self.segments.insert(
                mid_start,
                Segment {
                    end: mid_end,
                    ts: seg.ts.max(ts),
                },
            );
            if seg.end > span.end {
                self.segments.insert(
                    span.end.clone(),
                    Segment {
                        end: seg.end,
                        ts: seg.ts,
                    },
                );
            }
        }

        Ok(self.frontier() > before)
    }

    /// The overall frontier: the minimum timestamp across tracked segments.
    pub fn frontier(&self) -> SourceTimestamp {
        self.segments
            .values()
            .map(|seg| seg.ts)
            .min()
            .unwrap_or_default()
    }

    /// The tracked segments as resolved spans, e.g. to resume a
    /// subscription from current progress.
    pub fn resolved_spans(&self) -> Vec<ResolvedSpan> {
        self.segments
            .iter()
            .map(|(start, seg)| {
                ResolvedSpan::new(Span::new(start.clone(), seg.end.clone()), seg.ts)
            })
            .collect()
    }

    /// The resolved timestamp covering `key`, if the key is tracked.
    pub fn timestamp_for(&self, key: &[u8]) -> Option<SourceTimestamp> {
        let (_, seg) = self
            .segments
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()?;
        if seg.end.as_slice() > key {
            Some(seg.ts)
        } else {
            None
        }
    }
}
