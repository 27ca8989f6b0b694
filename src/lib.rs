// ABOUTME: Library root for watermark-replicator
// ABOUTME: Incremental table sync driven by a last_modified high-water mark

pub mod backend;
pub mod config;
pub mod error;
pub mod lock;
pub mod memory;
pub mod postgres;
pub mod sqlite;
pub mod sync;
pub mod utils;

pub use error::{SyncError, SyncResult};
pub use sync::{RunFailure, SyncOutcome, SyncRunner};
