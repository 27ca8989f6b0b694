// ABOUTME: Watermark advancer for watermark-driven sync
// ABOUTME: Commits the change set's max last_modified as the new marker

use super::store::WatermarkStore;
use super::types::{ChangeSet, Marker};
use crate::error::SyncResult;

/// Candidate marker for a change set: its highest `last_modified`.
///
/// `None` for an empty set, in which case nothing may be written.
pub fn candidate_marker(changeset: &ChangeSet) -> Option<Marker> {
    changeset.max_last_modified()
}

/// Persist the new marker for `source_name`.
///
/// Must only be called once the rows in `changeset` are durable in the
/// destination. An empty change set leaves the stored marker untouched (it is
/// neither written nor reset). The store decides between create and update.
///
/// # Returns
///
/// The marker written, or `None` if the step was skipped.
pub async fn advance<W: WatermarkStore>(
    store: &W,
    source_name: &str,
    changeset: &ChangeSet,
) -> SyncResult<Option<Marker>> {
    let Some(candidate) = candidate_marker(changeset) else {
        tracing::debug!(
            "Empty change set for '{}', leaving watermark untouched",
            source_name
        );
        return Ok(None);
    };

    store.set(source_name, candidate).await?;

    tracing::debug!(
        "Advanced watermark for '{}' to {}",
        source_name,
        candidate.to_rfc3339()
    );

    Ok(Some(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryWatermarkStore;
    use crate::sync::types::SourceRecord;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    fn ts(month: u32, day: u32) -> Marker {
        Utc.with_ymd_and_hms(2024, month, day, 0, 0, 0).unwrap()
    }

    fn row(id: i64, last_modified: Marker) -> SourceRecord {
        SourceRecord {
            id,
            amount: Decimal::ONE,
            customer_id: 1,
            last_modified,
        }
    }

    #[tokio::test]
    async fn test_empty_changeset_leaves_marker() {
        let store = MemoryWatermarkStore::new();
        store.set("orders", ts(1, 10)).await.unwrap();

        let written = advance(&store, "orders", &ChangeSet::default())
            .await
            .unwrap();

        assert_eq!(written, None);
        assert_eq!(store.get("orders").await.unwrap(), Some(ts(1, 10)));
        assert_eq!(store.write_count().await, 1);
    }

    #[tokio::test]
    async fn test_empty_changeset_does_not_create_entry() {
        let store = MemoryWatermarkStore::new();
        advance(&store, "orders", &ChangeSet::default())
            .await
            .unwrap();
        assert_eq!(store.get("orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_advances_to_max_of_changeset() {
        let store = MemoryWatermarkStore::new();
        let set = ChangeSet::new(vec![row(4, ts(2, 1)), row(2, ts(2, 2))]);

        let written = advance(&store, "orders", &set).await.unwrap();

        assert_eq!(written, Some(ts(2, 2)));
        assert_eq!(store.get("orders").await.unwrap(), Some(ts(2, 2)));
    }
}
