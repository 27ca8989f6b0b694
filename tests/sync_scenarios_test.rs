// ABOUTME: End-to-end sync scenarios against in-memory backends
// ABOUTME: Covers idempotence, boundary selection, upserts and failure recovery

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use watermark_replicator::error::{SyncError, SyncResult};
use watermark_replicator::memory::{MemoryDestination, MemorySource, MemoryWatermarkStore};
use watermark_replicator::sync::{
    default_floor, Marker, MarkerChange, RunPhase, Sequential, SourceRecord, SyncRunner,
    WatermarkStore,
};

const SOURCE: &str = "customer_transactions";

fn ts(month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, day, 0, 0, 0).unwrap()
}

fn record(id: i64, cents: i64, last_modified: DateTime<Utc>) -> SourceRecord {
    SourceRecord {
        id,
        amount: Decimal::new(cents, 2),
        customer_id: 100 + id,
        last_modified,
    }
}

type MemoryRunner = SyncRunner<MemorySource, Sequential<MemoryDestination, MemoryWatermarkStore>>;

fn runner(
    source: &MemorySource,
    destination: &MemoryDestination,
    store: &MemoryWatermarkStore,
) -> MemoryRunner {
    SyncRunner::new(
        source.clone(),
        Sequential::new(destination.clone(), store.clone()),
        default_floor(),
    )
}

#[tokio::test]
async fn initial_load_from_seeded_marker() {
    let source = MemorySource::with_rows(vec![
        record(1, 1000, ts(1, 1)),
        record(2, 2000, ts(1, 5)),
        record(3, 3000, ts(1, 10)),
    ]);
    let destination = MemoryDestination::new();
    let store = MemoryWatermarkStore::new();
    store
        .set(SOURCE, Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap())
        .await
        .unwrap();

    let outcome = runner(&source, &destination, &store)
        .run_sync(SOURCE)
        .await
        .unwrap();

    assert_eq!(outcome.inserted, 3);
    assert_eq!(outcome.updated, 0);
    assert_eq!(destination.len().await, 3);
    assert_eq!(store.get(SOURCE).await.unwrap(), Some(ts(1, 10)));
}

#[tokio::test]
async fn mixed_insert_and_update_advances_to_latest_change() {
    let source = MemorySource::with_rows(vec![
        record(1, 1000, ts(1, 1)),
        record(2, 2000, ts(1, 5)),
        record(3, 3000, ts(1, 10)),
    ]);
    let destination = MemoryDestination::new();
    let store = MemoryWatermarkStore::new();
    let runner = runner(&source, &destination, &store);
    runner.run_sync(SOURCE).await.unwrap();

    source.put(record(4, 4000, ts(2, 1))).await;
    source.put(record(2, 2500, ts(2, 2))).await;

    let outcome = runner.run_sync(SOURCE).await.unwrap();

    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.updated, 1);
    assert_eq!(
        outcome.marker,
        MarkerChange::Advanced {
            from: Some(ts(1, 10)),
            to: ts(2, 2)
        }
    );
    assert_eq!(destination.len().await, 4);
    assert_eq!(
        destination.get(2).await,
        Some(record(2, 2500, ts(2, 2)))
    );
    assert_eq!(store.get(SOURCE).await.unwrap(), Some(ts(2, 2)));
}

#[tokio::test]
async fn second_run_without_changes_is_a_no_op() {
    let source = MemorySource::with_rows(vec![record(1, 1000, ts(1, 1)), record(2, 2000, ts(1, 5))]);
    let destination = MemoryDestination::new();
    let store = MemoryWatermarkStore::new();
    let runner = runner(&source, &destination, &store);

    runner.run_sync(SOURCE).await.unwrap();
    let rows_after_first = destination.rows().await;
    let marker_after_first = store.get(SOURCE).await.unwrap();
    let writes_after_first = store.write_count().await;

    let outcome = runner.run_sync(SOURCE).await.unwrap();

    assert_eq!(outcome.rows_applied(), 0);
    assert_eq!(outcome.marker, MarkerChange::Unchanged(marker_after_first));
    assert_eq!(destination.rows().await, rows_after_first);
    assert_eq!(store.get(SOURCE).await.unwrap(), marker_after_first);
    assert_eq!(store.write_count().await, writes_after_first);
}

#[tokio::test]
async fn empty_source_leaves_missing_marker_missing() {
    let source = MemorySource::new();
    let destination = MemoryDestination::new();
    let store = MemoryWatermarkStore::new();

    let outcome = runner(&source, &destination, &store)
        .run_sync(SOURCE)
        .await
        .unwrap();

    assert_eq!(outcome.marker, MarkerChange::Unchanged(None));
    assert_eq!(store.get(SOURCE).await.unwrap(), None);
    assert_eq!(store.write_count().await, 0);
}

#[tokio::test]
async fn row_at_marker_is_not_reselected() {
    let source = MemorySource::with_rows(vec![record(1, 1000, ts(1, 10))]);
    let destination = MemoryDestination::new();
    let store = MemoryWatermarkStore::new();
    store.set(SOURCE, ts(1, 10)).await.unwrap();

    let outcome = runner(&source, &destination, &store)
        .run_sync(SOURCE)
        .await
        .unwrap();

    assert_eq!(outcome.rows_applied(), 0);
    assert_eq!(destination.len().await, 0);
}

#[tokio::test]
async fn watermark_never_moves_backwards() {
    let source = MemorySource::new();
    let destination = MemoryDestination::new();
    let store = MemoryWatermarkStore::new();
    let runner = runner(&source, &destination, &store);

    let mut previous: Option<Marker> = None;
    for (id, (month, day)) in [(1, (1, 3)), (2, (1, 2)), (3, (2, 1)), (4, (1, 1))] {
        source.put(record(id, 100, ts(month, day))).await;
        runner.run_sync(SOURCE).await.unwrap();

        let current = store.get(SOURCE).await.unwrap();
        assert!(current >= previous, "marker moved from {:?} to {:?}", previous, current);
        previous = current;
    }

    // Rows written with last_modified at or below the marker are invisible
    assert_eq!(destination.len().await, 2);
    assert_eq!(previous, Some(ts(2, 1)));
}

#[tokio::test]
async fn duplicate_ids_fail_without_touching_marker() {
    let source = DuplicatingSource {
        rows: vec![record(7, 100, ts(1, 1)), record(7, 200, ts(1, 2))],
    };
    let destination = MemoryDestination::new();
    let store = MemoryWatermarkStore::new();
    let runner = SyncRunner::new(
        source,
        Sequential::new(destination.clone(), store.clone()),
        default_floor(),
    );

    let failure = runner.run_sync(SOURCE).await.unwrap_err();

    assert_eq!(failure.phase, RunPhase::Selected);
    assert!(matches!(
        failure.error,
        SyncError::ConstraintViolation { id: Some(7), .. }
    ));
    assert!(!failure.is_retryable());
    assert_eq!(destination.len().await, 0);
    assert_eq!(store.get(SOURCE).await.unwrap(), None);
}

#[tokio::test]
async fn failed_advance_is_repaired_by_rerun() {
    let source = MemorySource::with_rows(vec![record(1, 1000, ts(1, 1)), record(2, 2000, ts(1, 5))]);
    let destination = MemoryDestination::new();
    let store = FailOnceStore {
        inner: MemoryWatermarkStore::new(),
        fail_next_set: AtomicBool::new(true),
    };
    let runner = SyncRunner::new(
        source,
        Sequential::new(destination.clone(), store),
        default_floor(),
    );

    let failure = runner.run_sync(SOURCE).await.unwrap_err();
    assert!(failure.applied_without_advance());
    assert!(failure.is_retryable());
    assert_eq!(destination.len().await, 2);
    assert_eq!(runner.target().store().inner.get(SOURCE).await.unwrap(), None);

    let outcome = runner.run_sync(SOURCE).await.unwrap();
    // Same rows reselect and reapply as updates
    assert_eq!(outcome.updated, 2);
    assert_eq!(outcome.inserted, 0);
    assert_eq!(destination.len().await, 2);
    assert_eq!(
        runner.target().store().inner.get(SOURCE).await.unwrap(),
        Some(ts(1, 5))
    );
}

#[tokio::test]
async fn source_read_failure_reports_marker_read_phase() {
    let runner = SyncRunner::new(
        UnreachableSource,
        Sequential::new(MemoryDestination::new(), MemoryWatermarkStore::new()),
        default_floor(),
    );

    let failure = runner.run_sync(SOURCE).await.unwrap_err();
    assert_eq!(failure.phase, RunPhase::MarkerRead);
    assert!(failure.is_retryable());
}

/// Source that returns its rows verbatim, duplicates included.
struct DuplicatingSource {
    rows: Vec<SourceRecord>,
}

impl watermark_replicator::sync::ChangeSource for DuplicatingSource {
    async fn changed_since(&self, since: Marker) -> SyncResult<Vec<SourceRecord>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.last_modified > since)
            .cloned()
            .collect())
    }
}

struct UnreachableSource;

impl watermark_replicator::sync::ChangeSource for UnreachableSource {
    async fn changed_since(&self, _since: Marker) -> SyncResult<Vec<SourceRecord>> {
        Err(SyncError::transient("read changes", "connection refused"))
    }
}

/// Watermark store whose first write fails after the rows are applied.
struct FailOnceStore {
    inner: MemoryWatermarkStore,
    fail_next_set: AtomicBool,
}

impl WatermarkStore for FailOnceStore {
    async fn get(&self, source_name: &str) -> SyncResult<Option<Marker>> {
        self.inner.get(source_name).await
    }

    async fn set(&self, source_name: &str, marker: Marker) -> SyncResult<()> {
        if self.fail_next_set.swap(false, Ordering::SeqCst) {
            return Err(SyncError::transient("write marker", "connection reset"));
        }
        self.inner.set(source_name, marker).await
    }
}
