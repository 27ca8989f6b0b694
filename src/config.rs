// ABOUTME: TOML configuration for one sync job
// ABOUTME: Describes source, destination, watermark store and schedule

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::lock::RunLock;
use crate::sync::daemon::DaemonConfig;
use crate::sync::{default_floor, parse_marker, FileWatermarkStore, Marker};
use crate::utils::{validate_connection_string, validate_identifier};

/// Storage engine behind a source or destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Postgres,
    Sqlite,
}

/// A table in a PostgreSQL database or SQLite file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub kind: BackendKind,
    /// PostgreSQL connection URL, or SQLite file path
    pub url: String,
    pub table: String,
    /// PostgreSQL schema; ignored for SQLite
    #[serde(default = "default_schema")]
    pub schema: String,
}

impl EndpointConfig {
    /// SQLite file path, accepting an optional `sqlite://` prefix.
    pub fn sqlite_path(&self) -> PathBuf {
        PathBuf::from(self.url.strip_prefix("sqlite://").unwrap_or(&self.url))
    }

    fn validate(&self, role: &str) -> SyncResult<()> {
        validate_identifier(&self.table)
            .map_err(|e| SyncError::Config(format!("{} table: {}", role, e)))?;
        match self.kind {
            BackendKind::Postgres => {
                validate_identifier(&self.schema)
                    .map_err(|e| SyncError::Config(format!("{} schema: {}", role, e)))?;
                validate_connection_string(&self.url)
                    .map_err(|e| SyncError::Config(format!("{} url: {}", role, e)))?;
            }
            BackendKind::Sqlite => {
                if self.url.trim().is_empty() {
                    return Err(SyncError::Config(format!(
                        "{} url must be a SQLite file path",
                        role
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether both endpoints name the same physical table.
    fn same_table(&self, other: &EndpointConfig) -> bool {
        if self.kind != other.kind || self.table != other.table {
            return false;
        }
        match self.kind {
            BackendKind::Postgres => self.url == other.url && self.schema == other.schema,
            BackendKind::Sqlite => self.sqlite_path() == other.sqlite_path(),
        }
    }
}

/// Where watermarks are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WatermarkConfig {
    /// Table in the destination database, committed together with the rows
    Table {
        #[serde(default = "default_watermark_table")]
        table: String,
    },
    /// JSON state file, written after the rows are committed
    File {
        #[serde(default = "FileWatermarkStore::default_path")]
        path: PathBuf,
    },
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        WatermarkConfig::Table {
            table: default_watermark_table(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_retries: 3,
            retry_delay_secs: 1,
        }
    }
}

impl ScheduleConfig {
    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            interval: Duration::from_secs(self.interval_secs),
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }
}

/// One sync job: a source table replicated into a destination table under a
/// `source_name` watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub source_name: String,
    /// Substituted when no watermark exists yet
    #[serde(default = "default_floor", deserialize_with = "deserialize_marker")]
    pub floor: Marker,
    #[serde(default = "RunLock::default_dir")]
    pub lock_dir: PathBuf,
    pub source: EndpointConfig,
    pub destination: EndpointConfig,
    #[serde(default)]
    pub watermark: WatermarkConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl SyncConfig {
    /// Check identifiers, URLs and table wiring before anything connects.
    pub fn validate(&self) -> SyncResult<()> {
        if self.source_name.trim().is_empty() {
            return Err(SyncError::Config("source_name must not be empty".into()));
        }
        self.source.validate("source")?;
        self.destination.validate("destination")?;

        if self.source.same_table(&self.destination) {
            return Err(SyncError::Config(format!(
                "source and destination both point at table '{}'",
                self.source.table
            )));
        }

        if let WatermarkConfig::Table { table } = &self.watermark {
            validate_identifier(table)
                .map_err(|e| SyncError::Config(format!("watermark table: {}", e)))?;
            if table == &self.destination.table {
                return Err(SyncError::Config(format!(
                    "watermark table '{}' must differ from the destination table",
                    table
                )));
            }
        }

        if self.schedule.interval_secs == 0 {
            return Err(SyncError::Config(
                "schedule.interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Replace `source_name`, e.g. from a CLI flag.
    pub fn with_source_name(mut self, source_name: Option<String>) -> Self {
        if let Some(name) = source_name {
            self.source_name = name;
        }
        self
    }
}

/// Load and validate a sync job from a TOML file.
pub fn load_sync_config_from_file(path: impl AsRef<Path>) -> Result<SyncConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    let config = parse_sync_config(&content)
        .with_context(|| format!("Invalid config file: {:?}", path))?;
    Ok(config)
}

/// Parse and validate a sync job from TOML text.
pub fn parse_sync_config(content: &str) -> Result<SyncConfig> {
    let config: SyncConfig = toml::from_str(content).context("Failed to parse TOML")?;
    config.validate()?;
    Ok(config)
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_watermark_table() -> String {
    "watermark".to_string()
}

fn deserialize_marker<'de, D>(deserializer: D) -> std::result::Result<Marker, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_marker(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!(
            "invalid timestamp '{}': expected RFC 3339 or YYYY-MM-DD",
            raw
        ))
    })
}
