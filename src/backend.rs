// ABOUTME: Builds configured sources and targets for the CLI
// ABOUTME: Dispatches over PostgreSQL, SQLite and file-backed watermark combinations

use anyhow::{Context, Result};

use crate::config::{BackendKind, EndpointConfig, SyncConfig, WatermarkConfig};
use crate::error::SyncResult;
use crate::postgres::{self, PostgresSource, PostgresTarget};
use crate::sqlite::{SqliteSource, SqliteTarget};
use crate::sync::{
    ChangeSet, ChangeSource, CommitError, CommitSummary, Destination, FileWatermarkStore, Marker,
    Sequential, SourceRecord, SyncTarget, UpsertSummary, WatermarkStore,
};
use crate::utils::redact_url;

/// Watermark table name passed to targets when markers live in a state file.
/// Nothing reads, writes or creates it.
const UNUSED_WATERMARK_TABLE: &str = "watermark";

/// Source dataset selected by configuration.
pub enum AnySource {
    Postgres(PostgresSource),
    Sqlite(SqliteSource),
}

impl AnySource {
    /// Number of rows a run starting at `since` would select.
    pub async fn count_changed_since(&self, since: Marker) -> SyncResult<i64> {
        match self {
            AnySource::Postgres(source) => source.count_changed_since(since).await,
            AnySource::Sqlite(source) => source.count_changed_since(since).await,
        }
    }
}

impl ChangeSource for AnySource {
    async fn changed_since(&self, since: Marker) -> SyncResult<Vec<SourceRecord>> {
        match self {
            AnySource::Postgres(source) => source.changed_since(since).await,
            AnySource::Sqlite(source) => source.changed_since(since).await,
        }
    }
}

/// Destination table without a co-located watermark.
pub enum AnyDestination {
    Postgres(PostgresTarget),
    Sqlite(SqliteTarget),
}

impl AnyDestination {
    async fn ensure_record_table(&self) -> SyncResult<()> {
        match self {
            AnyDestination::Postgres(target) => target.ensure_record_table().await,
            AnyDestination::Sqlite(target) => target.ensure_record_table(),
        }
    }

    async fn row_count(&self) -> SyncResult<i64> {
        match self {
            AnyDestination::Postgres(target) => target.row_count().await,
            AnyDestination::Sqlite(target) => Ok(target.row_count()? as i64),
        }
    }
}

impl Destination for AnyDestination {
    async fn upsert(&self, records: &[SourceRecord]) -> SyncResult<UpsertSummary> {
        match self {
            AnyDestination::Postgres(target) => target.upsert(records).await,
            AnyDestination::Sqlite(target) => target.upsert(records).await,
        }
    }
}

/// Destination plus watermark store selected by configuration.
///
/// `Postgres` and `Sqlite` keep the watermark table next to the destination
/// table and commit both in one transaction. `File` applies rows first and
/// then writes the marker to a JSON state file.
pub enum AnyTarget {
    Postgres(PostgresTarget),
    Sqlite(SqliteTarget),
    File(Sequential<AnyDestination, FileWatermarkStore>),
}

impl AnyTarget {
    /// Create the destination table, plus the watermark table when markers
    /// live next to it.
    pub async fn ensure_schema(&self) -> SyncResult<()> {
        match self {
            AnyTarget::Postgres(target) => target.ensure_schema().await,
            AnyTarget::Sqlite(target) => target.ensure_schema(),
            AnyTarget::File(target) => target.destination().ensure_record_table().await,
        }
    }

    /// Number of rows in the destination table.
    pub async fn row_count(&self) -> SyncResult<i64> {
        match self {
            AnyTarget::Postgres(target) => target.row_count().await,
            AnyTarget::Sqlite(target) => Ok(target.row_count()? as i64),
            AnyTarget::File(target) => target.destination().row_count().await,
        }
    }

    /// Whether apply and advance share one transaction.
    pub fn is_transactional(&self) -> bool {
        !matches!(self, AnyTarget::File(_))
    }
}

impl WatermarkStore for AnyTarget {
    async fn get(&self, source_name: &str) -> SyncResult<Option<Marker>> {
        match self {
            AnyTarget::Postgres(target) => target.get(source_name).await,
            AnyTarget::Sqlite(target) => target.get(source_name).await,
            AnyTarget::File(target) => target.get(source_name).await,
        }
    }

    async fn set(&self, source_name: &str, marker: Marker) -> SyncResult<()> {
        match self {
            AnyTarget::Postgres(target) => target.set(source_name, marker).await,
            AnyTarget::Sqlite(target) => target.set(source_name, marker).await,
            AnyTarget::File(target) => target.set(source_name, marker).await,
        }
    }
}

impl SyncTarget for AnyTarget {
    async fn commit(
        &self,
        source_name: &str,
        changeset: &ChangeSet,
    ) -> Result<CommitSummary, CommitError> {
        match self {
            AnyTarget::Postgres(target) => target.commit(source_name, changeset).await,
            AnyTarget::Sqlite(target) => target.commit(source_name, changeset).await,
            AnyTarget::File(target) => target.commit(source_name, changeset).await,
        }
    }
}

/// Open the configured source.
pub async fn open_source(endpoint: &EndpointConfig) -> Result<AnySource> {
    match endpoint.kind {
        BackendKind::Postgres => {
            let client = postgres::connect_with_retry(&endpoint.url)
                .await
                .with_context(|| {
                    format!("Failed to connect to source {}", redact_url(&endpoint.url))
                })?;
            Ok(AnySource::Postgres(PostgresSource::new(
                client,
                &endpoint.schema,
                &endpoint.table,
            )?))
        }
        BackendKind::Sqlite => {
            let path = endpoint.sqlite_path();
            let source = SqliteSource::open(&path, &endpoint.table)
                .with_context(|| format!("Failed to open source database {:?}", path))?;
            Ok(AnySource::Sqlite(source))
        }
    }
}

/// Open the configured destination together with its watermark store.
pub async fn open_target(config: &SyncConfig) -> Result<AnyTarget> {
    let endpoint = &config.destination;
    match &config.watermark {
        WatermarkConfig::Table { table } => match endpoint.kind {
            BackendKind::Postgres => Ok(AnyTarget::Postgres(
                open_postgres_target(endpoint, table).await?,
            )),
            BackendKind::Sqlite => Ok(AnyTarget::Sqlite(open_sqlite_target(endpoint, table)?)),
        },
        WatermarkConfig::File { path } => {
            let destination = match endpoint.kind {
                BackendKind::Postgres => AnyDestination::Postgres(
                    open_postgres_target(endpoint, UNUSED_WATERMARK_TABLE).await?,
                ),
                BackendKind::Sqlite => {
                    AnyDestination::Sqlite(open_sqlite_target(endpoint, UNUSED_WATERMARK_TABLE)?)
                }
            };
            Ok(AnyTarget::File(Sequential::new(
                destination,
                FileWatermarkStore::new(path.clone()),
            )))
        }
    }
}

async fn open_postgres_target(
    endpoint: &EndpointConfig,
    watermark_table: &str,
) -> Result<PostgresTarget> {
    let client = postgres::connect_with_retry(&endpoint.url)
        .await
        .with_context(|| {
            format!(
                "Failed to connect to destination {}",
                redact_url(&endpoint.url)
            )
        })?;
    Ok(PostgresTarget::new(
        client,
        &endpoint.schema,
        &endpoint.table,
        watermark_table,
    )?)
}

fn open_sqlite_target(endpoint: &EndpointConfig, watermark_table: &str) -> Result<SqliteTarget> {
    let path = endpoint.sqlite_path();
    let target = SqliteTarget::open(&path, &endpoint.table, watermark_table)
        .with_context(|| format!("Failed to open destination database {:?}", path))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_sync_config;
    use crate::sqlite::{create_record_table, open_sqlite};
    use crate::sync::{default_floor, SyncRunner};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    fn config_for(dir: &std::path::Path, watermark: &str) -> SyncConfig {
        parse_sync_config(&format!(
            r#"
            source_name = "orders"

            [source]
            kind = "sqlite"
            url = "{src}"
            table = "orders"

            [destination]
            kind = "sqlite"
            url = "{dst}"
            table = "orders_replica"

            {watermark}
        "#,
            src = dir.join("source.db").display(),
            dst = dir.join("replica.db").display(),
            watermark = watermark,
        ))
        .unwrap()
    }

    fn seed_source(dir: &std::path::Path) {
        let conn = open_sqlite(dir.join("source.db")).unwrap();
        create_record_table(&conn, "orders").unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        conn.execute(
            "INSERT INTO orders (id, amount, customer_id, last_modified) VALUES (1, '12.50', 7, ?1)",
            [ts],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_table_watermark_is_transactional() {
        let dir = tempfile::tempdir().unwrap();
        seed_source(dir.path());
        let config = config_for(dir.path(), "");

        let target = open_target(&config).await.unwrap();
        assert!(target.is_transactional());
        target.ensure_schema().await.unwrap();

        let source = open_source(&config.source).await.unwrap();
        let runner = SyncRunner::new(source, target, default_floor());
        let outcome = runner.run_sync("orders").await.unwrap();

        assert_eq!(outcome.inserted, 1);
        assert_eq!(runner.target().row_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_watermark_uses_sequential_commit() {
        let dir = tempfile::tempdir().unwrap();
        seed_source(dir.path());
        let state = dir.path().join("state/watermarks.json");
        let config = config_for(
            dir.path(),
            &format!("[watermark]\nkind = \"file\"\npath = \"{}\"", state.display()),
        );

        let target = open_target(&config).await.unwrap();
        assert!(!target.is_transactional());
        target.ensure_schema().await.unwrap();

        let source = open_source(&config.source).await.unwrap();
        let runner = SyncRunner::new(source, target, default_floor());
        runner.run_sync("orders").await.unwrap();

        let store = FileWatermarkStore::new(&state);
        assert_eq!(
            store.get("orders").await.unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap())
        );
        let row = match runner.target() {
            AnyTarget::File(target) => match target.destination() {
                AnyDestination::Sqlite(dest) => dest.fetch(1).unwrap(),
                AnyDestination::Postgres(_) => None,
            },
            _ => None,
        };
        assert_eq!(row.map(|r| r.amount), Some(Decimal::new(1250, 2)));

        // Markers live in the state file, so no watermark table is created
        let replica = open_sqlite(dir.path().join("replica.db")).unwrap();
        let watermark_tables: i64 = replica
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'watermark'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(watermark_tables, 0);
    }

    #[tokio::test]
    async fn test_source_counts_pending_changes() {
        let dir = tempfile::tempdir().unwrap();
        seed_source(dir.path());
        let config = config_for(dir.path(), "");

        let source = open_source(&config.source).await.unwrap();
        assert_eq!(source.count_changed_since(default_floor()).await.unwrap(), 1);
        let after = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        assert_eq!(source.count_changed_since(after).await.unwrap(), 0);
    }
}
