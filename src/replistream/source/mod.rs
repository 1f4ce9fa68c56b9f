//! Replication stream transport seam
//!
//! The network transport that delivers the change stream is an external
//! collaborator; this module defines the client and subscription traits the
//! writer consumes, plus the address redaction helper used before a source
//! address appears in any log line.

pub mod traits;
pub mod uri;

pub use traits::{
    ReplicationStreamClient, SourceError, Subscription, SubscriptionOptions, SubscriptionSpec,
};
pub use uri::redact_source_uri;
