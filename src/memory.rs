// ABOUTME: In-memory source, destination and watermark store
// ABOUTME: Used by tests and dry runs; all data is lost when the process exits

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::sync::{
    ChangeSource, Destination, DestinationRecord, Marker, SourceRecord, UpsertSummary,
    WatermarkStore,
};

/// In-memory source table.
///
/// Clones share the same rows, so a test can keep a handle and mutate the
/// source between runs.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    rows: Arc<Mutex<BTreeMap<i64, SourceRecord>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = SourceRecord>) -> Self {
        let rows = rows.into_iter().map(|r| (r.id, r)).collect();
        Self {
            rows: Arc::new(Mutex::new(rows)),
        }
    }

    /// Insert or replace a row, as the upstream producer would.
    pub async fn put(&self, record: SourceRecord) {
        self.rows.lock().await.insert(record.id, record);
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }
}

impl ChangeSource for MemorySource {
    async fn changed_since(&self, since: Marker) -> SyncResult<Vec<SourceRecord>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|r| r.last_modified > since)
            .cloned()
            .collect())
    }
}

/// In-memory destination table.
///
/// Batches are validated against the current contents and then written as a
/// whole under one lock, so a batch is never half applied.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    rows: Arc<Mutex<BTreeMap<i64, DestinationRecord>>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: i64) -> Option<DestinationRecord> {
        self.rows.lock().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    /// Snapshot of every row, ordered by id.
    pub async fn rows(&self) -> Vec<DestinationRecord> {
        self.rows.lock().await.values().cloned().collect()
    }
}

impl Destination for MemoryDestination {
    async fn upsert(&self, records: &[SourceRecord]) -> SyncResult<UpsertSummary> {
        let mut rows = self.rows.lock().await;

        let mut seen = std::collections::HashSet::with_capacity(records.len());
        for record in records {
            if !seen.insert(record.id) {
                return Err(SyncError::constraint(
                    Some(record.id),
                    "duplicate identifier in batch",
                ));
            }
        }

        let mut summary = UpsertSummary::default();
        for record in records {
            match rows.insert(record.id, record.clone()) {
                Some(_) => summary.updated += 1,
                None => summary.inserted += 1,
            }
        }
        Ok(summary)
    }
}

#[derive(Debug, Default)]
struct WatermarkInner {
    entries: HashMap<String, Marker>,
    writes: usize,
}

/// In-memory watermark store.
#[derive(Debug, Clone, Default)]
pub struct MemoryWatermarkStore {
    inner: Arc<Mutex<WatermarkInner>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls served, for asserting that empty runs never write.
    pub async fn write_count(&self) -> usize {
        self.inner.lock().await.writes
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, source_name: &str) -> SyncResult<Option<Marker>> {
        Ok(self.inner.lock().await.entries.get(source_name).copied())
    }

    async fn set(&self, source_name: &str, marker: Marker) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.entries.insert(source_name.to_string(), marker);
        inner.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    fn row(id: i64, day: u32) -> SourceRecord {
        SourceRecord {
            id,
            amount: Decimal::new(500, 2),
            customer_id: 3,
            last_modified: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_memory_source_filters_strictly() {
        let source = MemorySource::with_rows(vec![row(1, 1), row(2, 5), row(3, 10)]);
        let since = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();

        let rows = source.changed_since(since).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 3);
    }

    #[tokio::test]
    async fn test_memory_destination_rejects_whole_batch() {
        let destination = MemoryDestination::new();
        let err = destination
            .upsert(&[row(1, 1), row(1, 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConstraintViolation { .. }));
        assert_eq!(destination.len().await, 0);
    }

    #[tokio::test]
    async fn test_memory_watermark_store_counts_writes() {
        let store = MemoryWatermarkStore::new();
        let marker = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();

        assert_eq!(store.get("orders").await.unwrap(), None);
        store.set("orders", marker).await.unwrap();
        store.set("orders", marker).await.unwrap();

        assert_eq!(store.get("orders").await.unwrap(), Some(marker));
        assert_eq!(store.write_count().await, 2);
    }
}
