//! Applier-level tests: chunking, last-write-wins, failure disposition,
//! and buffer compaction.

mod common;

use common::*;
use replistream::replistream::writer::{
    BufferApplier, BufferingDeadLetterQueue, DeadLetterQueueClient, DebugStatus, WriterConfig,
    WriterMetrics,
};
use std::sync::Arc;

fn make_applier(
    pool: &HandlerPool,
    workers: usize,
    config: WriterConfig,
) -> (BufferApplier, Arc<BufferingDeadLetterQueue>) {
    let dlq = Arc::new(BufferingDeadLetterQueue::new());
    let applier = BufferApplier::new(
        42,
        pool.handlers(workers),
        config,
        Arc::clone(&dlq) as Arc<dyn DeadLetterQueueClient>,
        Arc::new(WriterMetrics::unregistered()),
        Arc::new(DebugStatus::new(1, 1)),
        retry_by_taxonomy,
    );
    (applier, dlq)
}

#[tokio::test]
async fn applies_a_simple_buffer() {
    let pool = HandlerPool::new();
    let (mut applier, dlq) = make_applier(&pool, 4, WriterConfig::default());

    let unapplied = applier
        .flush_buffer(vec![kv(b"a", 10, b"1"), kv(b"b", 10, b"2")], false)
        .await
        .unwrap();

    assert!(unapplied.is_empty());
    assert_eq!(pool.value_of(b"a"), Some(b"1".to_vec()));
    assert_eq!(pool.value_of(b"b"), Some(b"2".to_vec()));
    assert!(dlq.is_empty().await);
}

#[tokio::test]
async fn last_write_wins_within_one_flush() {
    let pool = HandlerPool::new();
    let (mut applier, _dlq) = make_applier(&pool, 4, WriterConfig::default());

    // Out of order on the wire; the sort applies ts=9 before ts=12.
    let unapplied = applier
        .flush_buffer(vec![kv(b"a", 12, b"new"), kv(b"a", 9, b"old")], false)
        .await
        .unwrap();

    assert!(unapplied.is_empty());
    assert_eq!(pool.value_of(b"a"), Some(b"new".to_vec()));
}

#[tokio::test]
async fn reapplying_an_applied_update_is_a_noop() {
    let pool = HandlerPool::new();
    let (mut applier, _dlq) = make_applier(&pool, 2, WriterConfig::default());

    let update = kv(b"a", 10, b"1");
    applier
        .flush_buffer(vec![update.clone()], false)
        .await
        .unwrap();
    applier
        .flush_buffer(vec![update, kv(b"a", 8, b"stale")], false)
        .await
        .unwrap();

    assert_eq!(pool.value_of(b"a"), Some(b"1".to_vec()));
}

#[tokio::test]
async fn permanent_failure_goes_to_the_dlq() {
    let pool = HandlerPool::new().poisoning(b"bad");
    let (mut applier, dlq) = make_applier(&pool, 2, WriterConfig::default());

    let unapplied = applier
        .flush_buffer(vec![kv(b"bad", 5, b"x"), kv(b"ok", 5, b"y")], false)
        .await
        .unwrap();

    // The poison row was dead-lettered, so nothing remains for retry.
    assert!(unapplied.is_empty());
    assert_eq!(dlq.len().await, 1);
    let entries = dlq.entries().await;
    assert_eq!(entries[0].event.key, b"bad");
    assert!(entries[0].row.is_some());
    assert_eq!(pool.value_of(b"ok"), Some(b"y".to_vec()));
    assert_eq!(pool.value_of(b"bad"), None);
}

#[tokio::test]
async fn transient_failure_is_returned_for_retry() {
    let pool = HandlerPool::new().requiring_parent(b"child", b"parent");
    let (mut applier, dlq) = make_applier(&pool, 2, WriterConfig::default());

    let unapplied = applier
        .flush_buffer(vec![kv(b"child", 5, b"c"), kv(b"other", 5, b"o")], false)
        .await
        .unwrap();

    // Exactly the transiently-failed entry comes back, uncleared.
    assert_eq!(unapplied.len(), 1);
    assert_eq!(unapplied[0].key, b"child");
    assert!(dlq.is_empty().await);
    assert_eq!(pool.value_of(b"other"), Some(b"o".to_vec()));
}

#[tokio::test]
async fn must_process_forces_transient_failures_to_the_dlq() {
    let pool = HandlerPool::new().requiring_parent(b"child", b"parent");
    let (mut applier, dlq) = make_applier(&pool, 2, WriterConfig::default());

    let unapplied = applier
        .flush_buffer(vec![kv(b"child", 5, b"c")], true)
        .await
        .unwrap();

    assert!(unapplied.is_empty());
    assert_eq!(dlq.len().await, 1);
}

#[tokio::test]
async fn failed_explicit_batch_retries_rows_individually() {
    let pool = HandlerPool::new().poisoning(b"bad");
    let config = WriterConfig {
        use_implicit_txns: false,
        flush_batch_size: 8,
        ..Default::default()
    };
    let (mut applier, dlq) = make_applier(&pool, 1, config);

    let unapplied = applier
        .flush_buffer(
            vec![kv(b"a", 5, b"1"), kv(b"bad", 5, b"x"), kv(b"c", 5, b"3")],
            false,
        )
        .await
        .unwrap();

    // The batch failed as a unit, then each row got its own chance: the two
    // good rows applied, the poison row went to the DLQ.
    assert!(unapplied.is_empty());
    assert_eq!(dlq.len().await, 1);
    assert_eq!(pool.value_of(b"a"), Some(b"1".to_vec()));
    assert_eq!(pool.value_of(b"c"), Some(b"3".to_vec()));
}

#[tokio::test]
async fn key_grouping_keeps_each_row_on_one_worker() {
    let pool = HandlerPool::new();
    let (mut applier, _dlq) = make_applier(&pool, 4, WriterConfig::default());

    // 1000 updates over 4 row prefixes, two column families each, so chunk
    // extension has real work to do.
    let prefixes: [&[u8]; 4] = [b"alpha", b"beta", b"gamma", b"delta"];
    let mut buffer = Vec::new();
    for i in 0..1000u32 {
        let prefix = prefixes[(i % 4) as usize];
        let mut key = prefix.to_vec();
        // Column-family suffix: [family, length]. Length 2 counts itself.
        key.extend_from_slice(&[(i % 2) as u8, 0x02]);
        buffer.push(kv(&key, 1 + i as i64, format!("v{}", i).as_bytes()));
    }

    let unapplied = applier.flush_buffer(buffer, false).await.unwrap();
    assert!(unapplied.is_empty());

    let assignments = pool.assignments.lock().unwrap();
    for prefix in prefixes {
        let workers_touching: Vec<usize> = assignments
            .iter()
            .filter(|(_, prefixes)| prefixes.contains(&prefix.to_vec()))
            .map(|(worker, _)| *worker)
            .collect();
        assert_eq!(
            workers_touching.len(),
            1,
            "row prefix {:?} touched by workers {:?}",
            String::from_utf8_lossy(prefix),
            workers_touching
        );
    }
    // Every prefix ends at its newest revision.
    for (i, prefix) in prefixes.iter().enumerate() {
        let newest = 996 + i as u32; // last i with i % 4 == this prefix
        assert_eq!(
            pool.value_of(prefix),
            Some(format!("v{}", newest).into_bytes())
        );
    }
}

#[tokio::test]
async fn compaction_returns_exactly_the_unfinished_entries() {
    let pool = HandlerPool::new()
        .poisoning(b"bad")
        .requiring_parent(b"child1", b"parent")
        .requiring_parent(b"child2", b"parent");
    let (mut applier, dlq) = make_applier(&pool, 4, WriterConfig::default());

    let unapplied = applier
        .flush_buffer(
            vec![
                kv(b"a", 5, b"1"),
                kv(b"child1", 5, b"c1"),
                kv(b"bad", 5, b"x"),
                kv(b"child2", 5, b"c2"),
                kv(b"b", 5, b"2"),
            ],
            false,
        )
        .await
        .unwrap();

    // Applied and dead-lettered entries are gone; the two FK waits remain.
    let mut remaining_keys: Vec<Vec<u8>> =
        unapplied.iter().map(|event| event.key.clone()).collect();
    remaining_keys.sort();
    assert_eq!(remaining_keys, vec![b"child1".to_vec(), b"child2".to_vec()]);
    assert_eq!(dlq.len().await, 1);
}
