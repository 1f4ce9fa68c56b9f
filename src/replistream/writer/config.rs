//! Configuration for writer behavior

use log::warn;
use std::collections::HashMap;
use std::time::Duration;

/// Hard upper bound on apply parallelism.
pub const MAX_WRITER_WORKERS: usize = 32;

/// Bounds on how long transiently-failed rows may sit in purgatory.
#[derive(Debug, Clone)]
pub struct PurgatoryConfig {
    /// Maximum residence time before an entry is forced through the
    /// dead-letter path.
    pub deadline: Duration,
    /// Minimum gap between retries of the same entry.
    pub delay: Duration,
    /// Maximum retry level before an entry is forced through the
    /// dead-letter path.
    pub level_limit: u32,
}

impl Default for PurgatoryConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(60),
            delay: Duration::from_secs(5),
            level_limit: 10,
        }
    }
}

/// Configuration for the replication writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// The number of row updates to attempt in a single destination
    /// transaction.
    pub flush_batch_size: usize,
    /// Process each row in its own implicit transaction instead of explicit
    /// multi-row transactions; forces an effective batch size of 1.
    pub use_implicit_txns: bool,
    /// Upper bound on apply parallelism, clamped to [1, 32].
    pub max_workers: usize,
    /// Log every event sent to the dead-letter queue. A debugging default;
    /// disable for high-failure workloads.
    pub log_all_dlqs: bool,
    pub purgatory: PurgatoryConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_batch_size: 32,
            use_implicit_txns: true,
            max_workers: MAX_WRITER_WORKERS,
            log_all_dlqs: true,
            purgatory: PurgatoryConfig::default(),
        }
    }
}

impl WriterConfig {
    /// Build a config from a flat property map, falling back to the default
    /// for any key that is absent or unparseable.
    pub fn from_properties(props: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        let mut config = Self {
            flush_batch_size: parse_prop(props, "consumer.batch_size", defaults.flush_batch_size),
            use_implicit_txns: parse_prop(
                props,
                "consumer.use_implicit_txns.enabled",
                defaults.use_implicit_txns,
            ),
            max_workers: parse_prop(props, "consumer.max.workers", defaults.max_workers),
            log_all_dlqs: parse_prop(
                props,
                "consumer.log.all.dlq.events",
                defaults.log_all_dlqs,
            ),
            purgatory: PurgatoryConfig {
                deadline: Duration::from_millis(parse_prop(
                    props,
                    "purgatory.deadline.ms",
                    defaults.purgatory.deadline.as_millis() as u64,
                )),
                delay: Duration::from_millis(parse_prop(
                    props,
                    "purgatory.retry.delay.ms",
                    defaults.purgatory.delay.as_millis() as u64,
                )),
                level_limit: parse_prop(
                    props,
                    "purgatory.level.limit",
                    defaults.purgatory.level_limit,
                ),
            },
        };
        config.max_workers = config.max_workers.clamp(1, MAX_WRITER_WORKERS);
        config.flush_batch_size = config.flush_batch_size.max(1);
        config
    }

    /// Rows per batch actually used by a worker: implicit-transaction mode
    /// applies each row on its own.
    pub fn effective_batch_size(&self) -> usize {
        if self.use_implicit_txns {
            1
        } else {
            self.flush_batch_size.max(1)
        }
    }
}

fn parse_prop<T: std::str::FromStr + Copy>(
    props: &HashMap<String, String>,
    key: &str,
    default: T,
) -> T {
    match props.get(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(
                "invalid value '{}' for property '{}', using default",
                raw, key
            );
            default
        }),
        None => default,
    }
}
