// ABOUTME: Synchronization orchestrator - one watermark-driven run per invocation
// ABOUTME: Sequences marker read, selection, apply and advance with a failure contract

use std::fmt;
use std::future::Future;

use tracing::Instrument;
use uuid::Uuid;

use super::advancer;
use super::applier::{self, Destination};
use super::selector::{self, ChangeSource};
use super::store::WatermarkStore;
use super::types::{ChangeSet, Marker, UpsertSummary};
use crate::error::SyncError;

/// Progress of a single run. A failure is reported together with the last
/// phase that completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Start,
    MarkerRead,
    Selected,
    Applied,
    Advanced,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Start => "start",
            RunPhase::MarkerRead => "marker_read",
            RunPhase::Selected => "selected",
            RunPhase::Applied => "applied",
            RunPhase::Advanced => "advanced",
            RunPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Error from [`SyncTarget::commit`], split by whether rows reached the
/// destination.
#[derive(Debug)]
pub enum CommitError {
    /// Nothing was committed: the destination and the marker are as before.
    NotApplied(SyncError),
    /// Rows are durable but the marker was not advanced. Re-running is safe:
    /// the same rows reselect and reapply idempotently.
    AppliedNotAdvanced {
        summary: UpsertSummary,
        error: SyncError,
    },
}

/// Successful apply-and-advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    pub upsert: UpsertSummary,
    /// Marker written, `None` when the change set was empty
    pub marker: Option<Marker>,
}

/// Where a run writes: a destination plus the watermark store it reads the
/// starting marker from.
///
/// `commit` owns the atomicity boundary. Targets whose destination and
/// watermark live in one database apply and advance in a single
/// transaction; [`Sequential`] applies first and advances afterwards.
pub trait SyncTarget: WatermarkStore {
    fn commit(
        &self,
        source_name: &str,
        changeset: &ChangeSet,
    ) -> impl Future<Output = Result<CommitSummary, CommitError>> + Send;
}

/// Commit strategy for a destination and a watermark store that do not share
/// a transaction.
///
/// The upsert must succeed before the marker is written. A failure between
/// the two leaves rows applied and the marker behind, which the next run
/// repairs by reselecting and reapplying.
#[derive(Debug, Clone)]
pub struct Sequential<D, W> {
    destination: D,
    store: W,
}

impl<D, W> Sequential<D, W> {
    pub fn new(destination: D, store: W) -> Self {
        Self { destination, store }
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }

    pub fn store(&self) -> &W {
        &self.store
    }
}

impl<D, W> WatermarkStore for Sequential<D, W>
where
    D: Sync,
    W: WatermarkStore + Sync,
{
    async fn get(&self, source_name: &str) -> crate::error::SyncResult<Option<Marker>> {
        self.store.get(source_name).await
    }

    async fn set(&self, source_name: &str, marker: Marker) -> crate::error::SyncResult<()> {
        self.store.set(source_name, marker).await
    }
}

impl<D, W> SyncTarget for Sequential<D, W>
where
    D: Destination + Sync,
    W: WatermarkStore + Sync,
{
    async fn commit(
        &self,
        source_name: &str,
        changeset: &ChangeSet,
    ) -> Result<CommitSummary, CommitError> {
        let upsert = applier::apply(changeset, &self.destination)
            .await
            .map_err(CommitError::NotApplied)?;

        let marker = advancer::advance(&self.store, source_name, changeset)
            .await
            .map_err(|error| CommitError::AppliedNotAdvanced {
                summary: upsert,
                error,
            })?;

        Ok(CommitSummary { upsert, marker })
    }
}

/// What happened to the watermark during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerChange {
    /// Nothing selected; the stored marker (possibly absent) was left alone
    Unchanged(Option<Marker>),
    Advanced { from: Option<Marker>, to: Marker },
}

impl MarkerChange {
    /// Stored marker after the run.
    pub fn current(&self) -> Option<Marker> {
        match self {
            MarkerChange::Unchanged(marker) => *marker,
            MarkerChange::Advanced { to, .. } => Some(*to),
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub run_id: Uuid,
    pub source_name: String,
    pub inserted: usize,
    pub updated: usize,
    pub marker: MarkerChange,
}

impl SyncOutcome {
    pub fn rows_applied(&self) -> usize {
        self.inserted + self.updated
    }
}

/// A run that ended in the FAILED state.
#[derive(Debug, thiserror::Error)]
#[error("sync run for '{source_name}' failed after phase {phase}")]
pub struct RunFailure {
    pub run_id: Uuid,
    pub source_name: String,
    /// Last phase completed before the failure
    pub phase: RunPhase,
    #[source]
    pub error: SyncError,
}

impl RunFailure {
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }

    /// Rows reached the destination but the marker did not move.
    pub fn applied_without_advance(&self) -> bool {
        self.phase == RunPhase::Applied
    }
}

/// Runs watermark-driven syncs from a source into a target.
///
/// The watermark store is injected through the target; the runner holds no
/// state between invocations. At most one run per `source_name` may be in
/// flight; callers provide that exclusion (see [`crate::lock::RunLock`]).
pub struct SyncRunner<C, T> {
    source: C,
    target: T,
    floor: Marker,
}

impl<C, T> SyncRunner<C, T>
where
    C: ChangeSource,
    T: SyncTarget,
{
    /// Create a runner. `floor` is substituted when no marker exists yet.
    pub fn new(source: C, target: T, floor: Marker) -> Self {
        Self {
            source,
            target,
            floor,
        }
    }

    pub fn source(&self) -> &C {
        &self.source
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn floor(&self) -> Marker {
        self.floor
    }

    /// Run one synchronization for `source_name`.
    ///
    /// 1. Read the stored marker
    /// 2. Select rows with `last_modified` above it
    /// 3. Apply them to the destination
    /// 4. Advance the marker to the max `last_modified` of the same rows
    ///
    /// Running again with no source change selects nothing and leaves the
    /// marker untouched.
    pub async fn run_sync(&self, source_name: &str) -> Result<SyncOutcome, RunFailure> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("sync_run", %run_id, source_name);

        self.run_phases(run_id, source_name).instrument(span).await
    }

    async fn run_phases(&self, run_id: Uuid, source_name: &str) -> Result<SyncOutcome, RunFailure> {
        let fail = |phase: RunPhase, error: SyncError| {
            tracing::error!("Sync failed after phase {}: {}", phase, error);
            RunFailure {
                run_id,
                source_name: source_name.to_string(),
                phase,
                error,
            }
        };

        // START -> MARKER_READ
        let previous = self
            .target
            .get(source_name)
            .await
            .map_err(|e| fail(RunPhase::Start, e))?;
        match previous {
            Some(marker) => tracing::debug!("Stored marker: {}", marker.to_rfc3339()),
            None => tracing::debug!(
                "No stored marker, using floor {}",
                self.floor.to_rfc3339()
            ),
        }

        // MARKER_READ -> SELECTED
        let changeset = selector::select(&self.source, previous, self.floor)
            .await
            .map_err(|e| fail(RunPhase::MarkerRead, e))?;

        if changeset.is_empty() {
            tracing::debug!("No changes for '{}' since last run", source_name);
            return Ok(SyncOutcome {
                run_id,
                source_name: source_name.to_string(),
                inserted: 0,
                updated: 0,
                marker: MarkerChange::Unchanged(previous),
            });
        }

        // SELECTED -> APPLIED -> ADVANCED
        let commit = match self.target.commit(source_name, &changeset).await {
            Ok(commit) => commit,
            Err(CommitError::NotApplied(e)) => return Err(fail(RunPhase::Selected, e)),
            Err(CommitError::AppliedNotAdvanced { summary, error }) => {
                tracing::warn!(
                    "{} rows applied to destination but watermark was not advanced; \
                     the next run will reapply them",
                    summary.applied()
                );
                return Err(fail(RunPhase::Applied, error));
            }
        };

        // ADVANCED -> DONE: the change set is released here
        drop(changeset);

        let marker = match commit.marker {
            Some(to) => MarkerChange::Advanced { from: previous, to },
            None => MarkerChange::Unchanged(previous),
        };

        tracing::info!(
            "Synced {} rows for '{}' ({} inserted, {} updated), marker {} -> {}",
            commit.upsert.applied(),
            source_name,
            commit.upsert.inserted,
            commit.upsert.updated,
            display_marker(previous),
            display_marker(marker.current())
        );

        Ok(SyncOutcome {
            run_id,
            source_name: source_name.to_string(),
            inserted: commit.upsert.inserted,
            updated: commit.upsert.updated,
            marker,
        })
    }
}

fn display_marker(marker: Option<Marker>) -> String {
    marker
        .map(|m| m.to_rfc3339())
        .unwrap_or_else(|| "(none)".to_string())
}
