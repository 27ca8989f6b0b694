// ABOUTME: Record, marker and change-set types shared by every sync component
// ABOUTME: A ChangeSet is the transient set of rows selected by one run

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Watermark value. Lives in the same ordered domain as `last_modified`.
pub type Marker = DateTime<Utc>;

/// Floor used when no watermark exists yet: `1900-01-01T00:00:00Z`.
///
/// Must sort strictly below every real `last_modified`, otherwise the first
/// run silently loads nothing.
pub fn default_floor() -> Marker {
    Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// One row of replicated business data.
///
/// Source and destination rows share this shape; the destination holds a
/// projection of the source as of some marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Primary key, immutable once created
    pub id: i64,
    /// Transaction amount
    pub amount: Decimal,
    /// Owning customer
    pub customer_id: i64,
    /// Bumped by the producer on every payload change
    pub last_modified: DateTime<Utc>,
}

/// Replicated projection of a [`SourceRecord`].
pub type DestinationRecord = SourceRecord;

/// Rows selected by a single run.
///
/// Holds no ordering guarantee. Only the maximum `last_modified` and the
/// per-id payload matter downstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    records: Vec<SourceRecord>,
}

impl ChangeSet {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[SourceRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SourceRecord> {
        self.records.iter()
    }

    /// Highest `last_modified` in the set, `None` when empty.
    pub fn max_last_modified(&self) -> Option<Marker> {
        self.records.iter().map(|r| r.last_modified).max()
    }

    /// First id that appears more than once, if any.
    pub fn first_duplicate_id(&self) -> Option<i64> {
        let mut seen = std::collections::HashSet::with_capacity(self.records.len());
        self.records
            .iter()
            .map(|r| r.id)
            .find(|id| !seen.insert(*id))
    }
}

impl FromIterator<SourceRecord> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = SourceRecord>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a SourceRecord;
    type IntoIter = std::slice::Iter<'a, SourceRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Insert/update split reported by a destination after an upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertSummary {
    pub fn applied(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Parse an RFC 3339 timestamp (or a bare `YYYY-MM-DD` date at midnight UTC).
pub fn parse_marker(value: &str) -> Option<Marker> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value.trim()) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn record(id: i64, day: u32) -> SourceRecord {
        SourceRecord {
            id,
            amount: Decimal::from_str("10.50").unwrap(),
            customer_id: 7,
            last_modified: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_max_last_modified() {
        let set = ChangeSet::new(vec![record(1, 5), record(2, 10), record(3, 1)]);
        assert_eq!(
            set.max_last_modified(),
            Some(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap())
        );
        assert_eq!(ChangeSet::default().max_last_modified(), None);
    }

    #[test]
    fn test_first_duplicate_id() {
        let set = ChangeSet::new(vec![record(1, 1), record(2, 2), record(1, 3)]);
        assert_eq!(set.first_duplicate_id(), Some(1));

        let set = ChangeSet::new(vec![record(1, 1), record(2, 2)]);
        assert_eq!(set.first_duplicate_id(), None);
    }

    #[test]
    fn test_default_floor_is_below_real_data() {
        assert!(default_floor() < record(1, 1).last_modified);
        assert_eq!(default_floor().to_rfc3339(), "1900-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_parse_marker() {
        assert_eq!(
            parse_marker("2000-01-01"),
            Some(Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            parse_marker("2024-01-10T12:30:00+02:00"),
            Some(Utc.with_ymd_and_hms(2024, 1, 10, 10, 30, 0).unwrap())
        );
        assert_eq!(parse_marker("yesterday"), None);
    }

    #[test]
    fn test_upsert_summary_applied() {
        let summary = UpsertSummary {
            inserted: 3,
            updated: 2,
        };
        assert_eq!(summary.applied(), 5);
    }
}
