// ABOUTME: Change selection for watermark-driven sync
// ABOUTME: Picks source rows whose last_modified is strictly above the marker

use std::future::Future;

use super::types::{ChangeSet, Marker, SourceRecord};
use crate::error::SyncResult;

/// A readable source dataset, queryable by `last_modified > since`.
///
/// Implementations must apply a strict inequality. Returning rows equal to
/// `since` makes the boundary row reselect on every run.
pub trait ChangeSource {
    /// Rows whose `last_modified` is strictly greater than `since`.
    fn changed_since(
        &self,
        since: Marker,
    ) -> impl Future<Output = SyncResult<Vec<SourceRecord>>> + Send;
}

/// Produce the change set for one run.
///
/// An absent marker is replaced by `floor`, which must sort below every real
/// `last_modified`. The read has no side effects and imposes no ordering on
/// the returned rows.
///
/// # Arguments
///
/// * `source` - Source dataset
/// * `marker` - Stored watermark, `None` if the source was never synced
/// * `floor` - "Beginning of time" sentinel used when `marker` is absent
pub async fn select<C: ChangeSource>(
    source: &C,
    marker: Option<Marker>,
    floor: Marker,
) -> SyncResult<ChangeSet> {
    let since = effective_marker(marker, floor);
    let rows = source.changed_since(since).await?;

    // Backends filter in SQL; re-check here so a lax source cannot move the
    // boundary row back into the set.
    let selected: ChangeSet = rows
        .into_iter()
        .filter(|row| row.last_modified > since)
        .collect();

    tracing::debug!(
        "Selected {} changed rows since {}",
        selected.len(),
        since.to_rfc3339()
    );

    Ok(selected)
}

/// Marker actually used for filtering.
pub fn effective_marker(marker: Option<Marker>, floor: Marker) -> Marker {
    marker.unwrap_or(floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::default_floor;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    struct FixedSource(Vec<SourceRecord>);

    impl ChangeSource for FixedSource {
        async fn changed_since(&self, _since: Marker) -> SyncResult<Vec<SourceRecord>> {
            // Deliberately ignores the predicate
            Ok(self.0.clone())
        }
    }

    fn row(id: i64, day: u32) -> SourceRecord {
        SourceRecord {
            id,
            amount: Decimal::new(1000 + id, 2),
            customer_id: 1,
            last_modified: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_absent_marker_uses_floor() {
        let source = FixedSource(vec![row(1, 1), row(2, 5)]);
        let set = select(&source, None, default_floor()).await.unwrap();
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn test_boundary_row_is_excluded() {
        let source = FixedSource(vec![row(1, 1), row(2, 5), row(3, 10)]);
        let marker = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();

        let set = select(&source, Some(marker), default_floor()).await.unwrap();

        let ids: Vec<i64> = set.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[tokio::test]
    async fn test_nothing_newer_is_empty() {
        let source = FixedSource(vec![row(1, 1), row(2, 5)]);
        let marker = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();

        let set = select(&source, Some(marker), default_floor()).await.unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_effective_marker() {
        let floor = default_floor();
        let marker = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        assert_eq!(effective_marker(None, floor), floor);
        assert_eq!(effective_marker(Some(marker), floor), marker);
    }
}
