// ABOUTME: SQLite change source - reads rows modified after the marker
// ABOUTME: Filters with last_modified > ? so the boundary row is never reselected

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{open_sqlite, record_from_row, with_connection, SharedConnection, RECORD_COLUMNS};
use crate::error::{SyncError, SyncResult};
use crate::sync::{ChangeSource, Marker, SourceRecord};
use crate::utils::{quote_ident, validate_identifier};

/// Reads changed rows from a SQLite table.
///
/// The producer must write `last_modified` in the canonical
/// `YYYY-MM-DD HH:MM:SS[.fff]+00:00` form; the comparison runs on TEXT.
/// Queries run on tokio's blocking pool.
pub struct SqliteSource {
    conn: SharedConnection,
    table: String,
}

impl SqliteSource {
    /// Open `path` and read from `table`.
    pub fn open(path: impl AsRef<Path>, table: &str) -> SyncResult<Self> {
        let conn = open_sqlite(path)?;
        Self::from_connection(conn, table)
    }

    pub fn from_connection(conn: Connection, table: &str) -> SyncResult<Self> {
        validate_identifier(table)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Count rows that would be selected, without reading them.
    pub async fn count_changed_since(&self, since: Marker) -> SyncResult<i64> {
        let query = format!(
            "SELECT COUNT(*) FROM {} WHERE last_modified > ?1",
            quote_ident(&self.table)
        );
        with_connection(&self.conn, "count changes", move |conn| {
            conn.query_row(&query, [since], |row| row.get(0))
                .map_err(|e| SyncError::from_sqlite("count changes", e))
        })
        .await
    }
}

fn read_changes(conn: &Connection, table: &str, since: Marker) -> SyncResult<Vec<SourceRecord>> {
    let query = format!(
        "SELECT {} FROM {} WHERE last_modified > ?1",
        RECORD_COLUMNS.join(", "),
        quote_ident(table)
    );

    let mut stmt = conn
        .prepare(&query)
        .map_err(|e| SyncError::from_sqlite("prepare change query", e))?;
    let mut rows = stmt
        .query([since])
        .map_err(|e| SyncError::from_sqlite("read changes", e))?;

    let mut records = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|e| SyncError::from_sqlite("read changes", e))?
    {
        records.push(record_from_row(row)?);
    }

    tracing::debug!(
        "Read {} changed rows from SQLite table '{}'",
        records.len(),
        table
    );

    Ok(records)
}

impl ChangeSource for SqliteSource {
    async fn changed_since(&self, since: Marker) -> SyncResult<Vec<SourceRecord>> {
        let table = self.table.clone();
        with_connection(&self.conn, "read changes", move |conn| {
            read_changes(conn, &table, since)
        })
        .await
    }
}
