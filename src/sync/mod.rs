// ABOUTME: Watermark-driven incremental sync core
// ABOUTME: Selects rows changed since the stored marker, upserts them, then advances

pub mod advancer;
pub mod applier;
pub mod daemon;
pub mod orchestrator;
pub mod selector;
pub mod store;
pub mod types;

pub use applier::Destination;
pub use daemon::{DaemonConfig, DaemonStats, SyncDaemon};
pub use orchestrator::{
    CommitError, CommitSummary, MarkerChange, RunFailure, RunPhase, Sequential, SyncOutcome,
    SyncRunner, SyncTarget,
};
pub use selector::ChangeSource;
pub use store::{seed, FileWatermarkStore, SeedOutcome, WatermarkEntry, WatermarkStore};
pub use types::{
    default_floor, parse_marker, ChangeSet, DestinationRecord, Marker, SourceRecord,
    UpsertSummary,
};
