// ABOUTME: Upsert applier for watermark-driven sync
// ABOUTME: Merges a change set into the destination keyed by record id

use std::future::Future;

use super::types::{ChangeSet, SourceRecord, UpsertSummary};
use crate::error::{SyncError, SyncResult};

/// A read/write destination dataset supporting upsert by identifier.
///
/// The create-or-update decision lives in the storage primitive, not at call
/// sites. An implementation must apply a batch all-or-nothing; if it cannot,
/// it reports what it wrote through [`SyncError::PartialWrite`].
pub trait Destination {
    /// Insert rows whose id is new, overwrite every field of rows whose id
    /// already exists.
    fn upsert(
        &self,
        records: &[SourceRecord],
    ) -> impl Future<Output = SyncResult<UpsertSummary>> + Send;
}

/// Merge `changeset` into `destination`.
///
/// Existing ids get a full-row overwrite (payload and `last_modified`), new
/// ids are inserted. An empty change set touches nothing. A change set that
/// carries the same id twice is rejected as a constraint violation before
/// any write happens.
///
/// # Returns
///
/// The insert/update split; `applied()` is the number of rows touched.
pub async fn apply<D: Destination>(
    changeset: &ChangeSet,
    destination: &D,
) -> SyncResult<UpsertSummary> {
    if changeset.is_empty() {
        return Ok(UpsertSummary::default());
    }

    validate_changeset(changeset)?;

    let summary = destination.upsert(changeset.records()).await?;

    tracing::debug!(
        "Applied {} rows ({} inserted, {} updated)",
        summary.applied(),
        summary.inserted,
        summary.updated
    );

    Ok(summary)
}

/// Reject batches that would make one row both matched and inserted.
pub fn validate_changeset(changeset: &ChangeSet) -> SyncResult<()> {
    if let Some(id) = changeset.first_duplicate_id() {
        return Err(SyncError::constraint(
            Some(id),
            "identifier appears more than once in the change set",
        ));
    }
    Ok(())
}
