// ABOUTME: Watermark store contract and the JSON state-file implementation
// ABOUTME: Persists one high-water mark per tracked source name

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::types::Marker;
use crate::error::{SyncError, SyncResult};

/// Durable keyed storage of "last successfully loaded" markers.
///
/// Implementations must make [`WatermarkStore::set`] atomic with respect to
/// concurrent readers: a reader sees either the old or the new marker, never
/// a half-written value.
pub trait WatermarkStore {
    /// Current marker for `source_name`, or `None` if never seeded or committed.
    fn get(&self, source_name: &str) -> impl Future<Output = SyncResult<Option<Marker>>> + Send;

    /// Create the entry if absent, otherwise overwrite it.
    fn set(&self, source_name: &str, marker: Marker)
        -> impl Future<Output = SyncResult<()>> + Send;
}

/// Progress record for one tracked source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkEntry {
    /// Tracked source (unique key)
    pub source_name: String,
    /// Highest `last_modified` already incorporated into the destination
    pub marker_value: Marker,
    /// When the marker was last written
    pub updated_at: DateTime<Utc>,
}

impl WatermarkEntry {
    pub fn new(source_name: &str, marker_value: Marker) -> Self {
        Self {
            source_name: source_name.to_string(),
            marker_value,
            updated_at: Utc::now(),
        }
    }
}

/// On-disk layout of the watermark state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkFile {
    /// Version of the state format for future migrations
    pub version: u32,
    /// Entries keyed by source name
    pub entries: BTreeMap<String, WatermarkEntry>,
}

impl Default for WatermarkFile {
    fn default() -> Self {
        Self {
            version: 1,
            entries: BTreeMap::new(),
        }
    }
}

/// Watermark store backed by a JSON file.
///
/// Used when the destination cannot host a watermark table. Writes go to a
/// temporary file in the same directory which is then renamed over the
/// state file, so readers never observe a partial document. The store does
/// not share a transaction with the destination: the orchestrator applies
/// rows first and advances afterwards.
pub struct FileWatermarkStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Get the default state file path for the current directory
    pub fn default_path() -> PathBuf {
        PathBuf::from(".watermark-replicator/watermarks.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every entry; a missing file is an empty store.
    pub async fn load(&self) -> SyncResult<WatermarkFile> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(WatermarkFile::default())
            }
            Err(e) => {
                return Err(SyncError::transient(
                    "read watermark file",
                    format!("{}: {}", self.path.display(), e),
                ))
            }
        };

        serde_json::from_str(&contents).map_err(|e| {
            SyncError::InvalidData(format!(
                "failed to parse watermark file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Write the whole document via temp file + rename.
    fn save(&self, state: &WatermarkFile) -> SyncResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let contents = serde_json::to_string_pretty(state)
            .map_err(|e| SyncError::InvalidData(format!("failed to serialize watermarks: {}", e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| {
            SyncError::transient(
                "write watermark file",
                format!("{}: {}", self.path.display(), e.error),
            )
        })?;
        Ok(())
    }
}

impl WatermarkStore for FileWatermarkStore {
    async fn get(&self, source_name: &str) -> SyncResult<Option<Marker>> {
        let state = self.load().await?;
        Ok(state.entries.get(source_name).map(|e| e.marker_value))
    }

    async fn set(&self, source_name: &str, marker: Marker) -> SyncResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.load().await?;
        state
            .entries
            .insert(source_name.to_string(), WatermarkEntry::new(source_name, marker));
        self.save(&state)
    }
}

/// Result of seeding a watermark out-of-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Created,
    Replaced { previous: Marker },
    /// The stored marker already had this value; nothing was written
    Unchanged,
}

/// Write an initial marker for `source_name` outside of a sync run.
///
/// Without `force`, refuses to overwrite an existing entry. With `force`,
/// the marker may move backwards, which makes the next run reselect and
/// reapply everything above it.
pub async fn seed<W: WatermarkStore>(
    store: &W,
    source_name: &str,
    marker: Marker,
    force: bool,
) -> SyncResult<SeedOutcome> {
    let outcome = match store.get(source_name).await? {
        Some(previous) if previous == marker => return Ok(SeedOutcome::Unchanged),
        Some(previous) if !force => {
            return Err(SyncError::Config(format!(
                "watermark for '{}' is already set to {}; refusing to overwrite without force",
                source_name,
                previous.to_rfc3339()
            )))
        }
        Some(previous) => {
            if marker < previous {
                tracing::warn!(
                    "Moving watermark for '{}' backwards from {} to {}",
                    source_name,
                    previous.to_rfc3339(),
                    marker.to_rfc3339()
                );
            }
            SeedOutcome::Replaced { previous }
        }
        None => SeedOutcome::Created,
    };

    store.set(source_name, marker).await?;
    tracing::info!(
        "Seeded watermark for '{}' at {}",
        source_name,
        marker.to_rfc3339()
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(year: i32, month: u32, day: u32) -> Marker {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("absent.json"));
        assert_eq!(store.get("orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_creates_then_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("nested/watermarks.json"));

        store.set("orders", ts(2024, 1, 10)).await.unwrap();
        assert_eq!(store.get("orders").await.unwrap(), Some(ts(2024, 1, 10)));

        store.set("orders", ts(2024, 2, 2)).await.unwrap();
        assert_eq!(store.get("orders").await.unwrap(), Some(ts(2024, 2, 2)));

        let state = store.load().await.unwrap();
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.version, 1);
    }

    #[tokio::test]
    async fn test_entries_are_keyed_by_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("watermarks.json"));

        store.set("orders", ts(2024, 1, 1)).await.unwrap();
        store.set("payments", ts(2023, 6, 1)).await.unwrap();

        assert_eq!(store.get("orders").await.unwrap(), Some(ts(2024, 1, 1)));
        assert_eq!(store.get("payments").await.unwrap(), Some(ts(2023, 6, 1)));
        assert_eq!(store.get("refunds").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watermarks.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = FileWatermarkStore::new(&path);
        let err = store.get("orders").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidData(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_seed_refuses_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("watermarks.json"));

        assert_eq!(
            seed(&store, "orders", ts(2000, 1, 1), false).await.unwrap(),
            SeedOutcome::Created
        );
        assert_eq!(
            seed(&store, "orders", ts(2000, 1, 1), false).await.unwrap(),
            SeedOutcome::Unchanged
        );

        let err = seed(&store, "orders", ts(2024, 1, 1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert_eq!(store.get("orders").await.unwrap(), Some(ts(2000, 1, 1)));

        assert_eq!(
            seed(&store, "orders", ts(1999, 1, 1), true).await.unwrap(),
            SeedOutcome::Replaced {
                previous: ts(2000, 1, 1)
            }
        );
        assert_eq!(store.get("orders").await.unwrap(), Some(ts(1999, 1, 1)));
    }

    #[test]
    fn test_default_path() {
        assert_eq!(
            FileWatermarkStore::default_path(),
            PathBuf::from(".watermark-replicator/watermarks.json")
        );
    }
}
