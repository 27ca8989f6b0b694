// ABOUTME: SQLite sync target - destination table plus watermark table in one file
// ABOUTME: Applies the change set and advances the marker in a single transaction

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    open_sqlite, record_table_ddl, watermark_table_ddl, with_connection, SharedConnection,
    RECORD_COLUMNS,
};
use crate::error::{SyncError, SyncResult};
use crate::sync::{
    advancer, applier, ChangeSet, CommitError, CommitSummary, Destination, Marker, SourceRecord,
    SyncTarget, UpsertSummary, WatermarkStore,
};
use crate::utils::{quote_ident, validate_identifier};

/// Destination and watermark store sharing one SQLite database.
///
/// Because both tables live in the same file, [`SyncTarget::commit`] wraps
/// the upsert and the marker write in one transaction: a failure anywhere
/// leaves both untouched. The trait methods run on tokio's blocking pool;
/// the inherent helpers (`ensure_schema`, `row_count`, `fetch`) block the
/// caller.
pub struct SqliteTarget {
    conn: SharedConnection,
    table: String,
    watermark_table: String,
}

impl SqliteTarget {
    /// Open `path`, writing rows to `table` and markers to `watermark_table`.
    pub fn open(path: impl AsRef<Path>, table: &str, watermark_table: &str) -> SyncResult<Self> {
        let conn = open_sqlite(path)?;
        Self::from_connection(conn, table, watermark_table)
    }

    pub fn from_connection(
        conn: Connection,
        table: &str,
        watermark_table: &str,
    ) -> SyncResult<Self> {
        validate_identifier(table)?;
        validate_identifier(watermark_table)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
            watermark_table: watermark_table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the destination and watermark tables if they do not exist.
    pub fn ensure_schema(&self) -> SyncResult<()> {
        self.ensure_record_table()?;
        let conn = self.lock("ensure schema")?;
        conn.execute_batch(&watermark_table_ddl(&self.watermark_table)?)
            .map_err(|e| SyncError::from_sqlite("ensure schema", e))?;
        tracing::info!("Ensured SQLite watermark table '{}'", self.watermark_table);
        Ok(())
    }

    /// Create only the destination table, for markers kept elsewhere.
    pub fn ensure_record_table(&self) -> SyncResult<()> {
        let conn = self.lock("ensure schema")?;
        conn.execute_batch(&record_table_ddl(&self.table)?)
            .map_err(|e| SyncError::from_sqlite("ensure schema", e))?;
        tracing::info!("Ensured SQLite table '{}'", self.table);
        Ok(())
    }

    /// Number of rows in the destination table.
    pub fn row_count(&self) -> SyncResult<usize> {
        let conn = self.lock("count rows")?;
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(&self.table)),
                [],
                |row| row.get(0),
            )
            .map_err(|e| SyncError::from_sqlite("count rows", e))?;
        Ok(count as usize)
    }

    /// Fetch one destination row by id.
    pub fn fetch(&self, id: i64) -> SyncResult<Option<SourceRecord>> {
        let conn = self.lock("fetch row")?;
        let query = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            RECORD_COLUMNS.join(", "),
            quote_ident(&self.table)
        );
        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| SyncError::from_sqlite("fetch row", e))?;
        let mut rows = stmt
            .query([id])
            .map_err(|e| SyncError::from_sqlite("fetch row", e))?;
        match rows
            .next()
            .map_err(|e| SyncError::from_sqlite("fetch row", e))?
        {
            Some(row) => Ok(Some(super::record_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn lock(&self, operation: &'static str) -> SyncResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::storage(operation, "connection mutex poisoned"))
    }
}

/// Upsert every record, counting inserts and updates.
///
/// The existence probe and the write run inside the caller's transaction, so
/// no intermediate state is visible to other connections.
fn upsert_in(conn: &Connection, table: &str, records: &[SourceRecord]) -> SyncResult<UpsertSummary> {
    let table = quote_ident(table);
    let mut exists = conn
        .prepare(&format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", table))
        .map_err(|e| SyncError::from_sqlite("prepare existence probe", e))?;
    let mut upsert = conn
        .prepare(&build_upsert_query(&table))
        .map_err(|e| SyncError::from_sqlite("prepare upsert", e))?;

    let mut summary = UpsertSummary::default();
    for record in records {
        let existed: bool = exists
            .query_row([record.id], |row| row.get(0))
            .map_err(|e| SyncError::from_sqlite("probe row", e))?;

        upsert
            .execute(params![
                record.id,
                record.amount.to_string(),
                record.customer_id,
                record.last_modified,
            ])
            .map_err(|e| SyncError::from_sqlite("upsert row", e).with_row_id(record.id))?;

        if existed {
            summary.updated += 1;
        } else {
            summary.inserted += 1;
        }
    }

    Ok(summary)
}

/// Take the write lock up front so contention waits on the busy timeout
/// instead of failing when a read transaction tries to upgrade.
fn begin_write(conn: &mut Connection) -> SyncResult<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| SyncError::from_sqlite("begin transaction", e))
}

/// Upsert `records` in one transaction.
fn upsert_batch(
    conn: &mut Connection,
    table: &str,
    records: &[SourceRecord],
) -> SyncResult<UpsertSummary> {
    let tx = begin_write(conn)?;
    let summary = upsert_in(&tx, table, records)?;
    tx.commit()
        .map_err(|e| SyncError::from_sqlite("commit transaction", e))?;
    Ok(summary)
}

/// Upsert `records` and, when given, write `marker` in the same transaction.
fn commit_in(
    conn: &mut Connection,
    table: &str,
    watermark_table: &str,
    source_name: &str,
    records: &[SourceRecord],
    marker: Option<Marker>,
) -> SyncResult<UpsertSummary> {
    let tx = begin_write(conn)?;

    let upsert = upsert_in(&tx, table, records)?;
    if let Some(marker) = marker {
        write_marker_in(&tx, watermark_table, source_name, marker)?;
    }

    tx.commit()
        .map_err(|e| SyncError::from_sqlite("commit transaction", e))?;
    Ok(upsert)
}

fn read_marker_in(
    conn: &Connection,
    watermark_table: &str,
    source_name: &str,
) -> SyncResult<Option<Marker>> {
    conn.query_row(
        &format!(
            "SELECT marker_value FROM {} WHERE source_name = ?1",
            quote_ident(watermark_table)
        ),
        [source_name],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| SyncError::from_sqlite("read marker", e))
}

fn write_marker_in(
    conn: &Connection,
    watermark_table: &str,
    source_name: &str,
    marker: Marker,
) -> SyncResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO {} (source_name, marker_value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(source_name) DO UPDATE SET \
                marker_value = excluded.marker_value, \
                updated_at = excluded.updated_at",
            quote_ident(watermark_table)
        ),
        params![source_name, marker, Utc::now()],
    )
    .map_err(|e| SyncError::from_sqlite("write marker", e))?;
    Ok(())
}

/// Build the single-row upsert for an already-quoted table name.
fn build_upsert_query(quoted_table: &str) -> String {
    let update_columns: Vec<String> = RECORD_COLUMNS
        .iter()
        .filter(|c| **c != "id")
        .map(|c| format!("{} = excluded.{}", c, c))
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4) ON CONFLICT(id) DO UPDATE SET {}",
        quoted_table,
        RECORD_COLUMNS.join(", "),
        update_columns.join(", ")
    )
}

impl WatermarkStore for SqliteTarget {
    async fn get(&self, source_name: &str) -> SyncResult<Option<Marker>> {
        let watermark_table = self.watermark_table.clone();
        let source_name = source_name.to_string();
        with_connection(&self.conn, "read marker", move |conn| {
            read_marker_in(conn, &watermark_table, &source_name)
        })
        .await
    }

    async fn set(&self, source_name: &str, marker: Marker) -> SyncResult<()> {
        let watermark_table = self.watermark_table.clone();
        let source_name = source_name.to_string();
        with_connection(&self.conn, "write marker", move |conn| {
            write_marker_in(conn, &watermark_table, &source_name, marker)
        })
        .await
    }
}

impl Destination for SqliteTarget {
    async fn upsert(&self, records: &[SourceRecord]) -> SyncResult<UpsertSummary> {
        let table = self.table.clone();
        let records = records.to_vec();
        with_connection(&self.conn, "apply rows", move |conn| {
            upsert_batch(conn, &table, &records)
        })
        .await
    }
}

impl SyncTarget for SqliteTarget {
    async fn commit(
        &self,
        source_name: &str,
        changeset: &ChangeSet,
    ) -> Result<CommitSummary, CommitError> {
        applier::validate_changeset(changeset).map_err(CommitError::NotApplied)?;

        // Advance inside the same transaction, only when rows were selected
        let marker = advancer::candidate_marker(changeset);
        let table = self.table.clone();
        let watermark_table = self.watermark_table.clone();
        let source_name = source_name.to_string();
        let records = changeset.records().to_vec();

        // One transaction: any failure rolls back rows and marker together
        let upsert = with_connection(&self.conn, "commit", move |conn| {
            commit_in(conn, &table, &watermark_table, &source_name, &records, marker)
        })
        .await
        .map_err(CommitError::NotApplied)?;

        Ok(CommitSummary { upsert, marker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn target() -> SqliteTarget {
        let conn = Connection::open_in_memory().unwrap();
        let target = SqliteTarget::from_connection(conn, "replica", "watermark").unwrap();
        target.ensure_schema().unwrap();
        target
    }

    fn row(id: i64, cents: i64, day: u32) -> SourceRecord {
        SourceRecord {
            id,
            amount: Decimal::new(cents, 2),
            customer_id: 9,
            last_modified: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_build_upsert_query() {
        let query = build_upsert_query("\"replica\"");
        assert!(query.starts_with("INSERT INTO \"replica\" (id, amount, customer_id, last_modified)"));
        assert!(query.contains("ON CONFLICT(id) DO UPDATE SET"));
        assert!(query.contains("amount = excluded.amount"));
        assert!(query.contains("last_modified = excluded.last_modified"));
        assert!(!query.contains("id = excluded.id"));
    }

    #[tokio::test]
    async fn test_marker_upsert() {
        let target = target();
        let first = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap();

        assert_eq!(target.get("orders").await.unwrap(), None);
        target.set("orders", first).await.unwrap();
        assert_eq!(target.get("orders").await.unwrap(), Some(first));
        target.set("orders", second).await.unwrap();
        assert_eq!(target.get("orders").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_commit_counts_inserts_and_updates() {
        let target = target();

        let first = ChangeSet::new(vec![row(1, 100, 1), row(2, 200, 5)]);
        let summary = target.commit("orders", &first).await.unwrap();
        assert_eq!(summary.upsert.inserted, 2);
        assert_eq!(summary.marker, first.max_last_modified());

        let second = ChangeSet::new(vec![row(2, 250, 6)]);
        let summary = target.commit("orders", &second).await.unwrap();
        assert_eq!(summary.upsert.updated, 1);
        assert_eq!(summary.upsert.inserted, 0);

        assert_eq!(target.fetch(2).unwrap(), Some(row(2, 250, 6)));
        assert_eq!(target.row_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_locked_database_does_not_stall_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        let target = SqliteTarget::open(&path, "replica", "watermark").unwrap();
        target.ensure_schema().unwrap();

        // Another connection holds the write lock
        let blocker = open_sqlite(&path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

        let set = ChangeSet::new(vec![row(1, 100, 1)]);
        let commit = target.commit("orders", &set);
        tokio::pin!(commit);

        // The commit waits on the busy timeout without holding this thread
        tokio::select! {
            biased;
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
            _ = &mut commit => panic!("commit finished while the database was locked"),
        }

        blocker.execute_batch("ROLLBACK").unwrap();
        let summary = commit.await.unwrap();
        assert_eq!(summary.upsert.inserted, 1);
        assert_eq!(target.get("orders").await.unwrap(), summary.marker);
    }

    #[test]
    fn test_record_table_only_skips_watermark_table() {
        let conn = Connection::open_in_memory().unwrap();
        let target = SqliteTarget::from_connection(conn, "replica", "watermark").unwrap();
        target.ensure_record_table().unwrap();

        let conn = target.lock("inspect").unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(tables, vec!["replica".to_string()]);
    }

    #[tokio::test]
    async fn test_commit_rolls_back_on_duplicate_id() {
        let target = target();
        let set = ChangeSet::new(vec![row(1, 100, 1), row(1, 150, 2)]);

        let err = target.commit("orders", &set).await.unwrap_err();
        assert!(matches!(
            err,
            CommitError::NotApplied(SyncError::ConstraintViolation { .. })
        ));
        assert_eq!(target.row_count().unwrap(), 0);
        assert_eq!(target.get("orders").await.unwrap(), None);
    }
}
