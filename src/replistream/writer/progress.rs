//! Outbound progress rows
//!
//! Checkpoints leave the processor as single-column rows carrying the
//! serialized resolved spans: a 4-byte big-endian length prefix followed by
//! the JSON body. Consumers decode and persist them as job progress.

use crate::replistream::events::ResolvedSpan;
use std::error::Error;
use std::fmt;

/// A single-column progress row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRow(pub Vec<u8>);

impl ProgressRow {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Errors from decoding a progress row.
#[derive(Debug)]
pub enum ProgressDecodeError {
    /// Shorter than the 4-byte length prefix.
    TruncatedPrefix,
    /// Body length disagrees with the prefix.
    LengthMismatch { declared: usize, actual: usize },
    Json(serde_json::Error),
}

impl fmt::Display for ProgressDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressDecodeError::TruncatedPrefix => {
                write!(f, "progress row shorter than its length prefix")
            }
            ProgressDecodeError::LengthMismatch { declared, actual } => write!(
                f,
                "progress row declares {} body bytes but carries {}",
                declared, actual
            ),
            ProgressDecodeError::Json(err) => write!(f, "progress row body: {}", err),
        }
    }
}

impl Error for ProgressDecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProgressDecodeError::Json(err) => Some(err),
            _ => None,
        }
    }
}

pub fn encode_resolved_spans(
    resolved: &[ResolvedSpan],
) -> Result<ProgressRow, serde_json::Error> {
    let body = serde_json::to_vec(resolved)?;
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(ProgressRow(bytes))
}

pub fn decode_resolved_spans(row: &ProgressRow) -> Result<Vec<ResolvedSpan>, ProgressDecodeError> {
    let bytes = row.as_bytes();
    if bytes.len() < 4 {
        return Err(ProgressDecodeError::TruncatedPrefix);
    }
    let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let body = &bytes[4..];
    if body.len() != declared {
        return Err(ProgressDecodeError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    serde_json::from_slice(body).map_err(ProgressDecodeError::Json)
}
