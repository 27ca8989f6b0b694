// ABOUTME: SQLite backend for watermark-driven sync
// ABOUTME: Opens databases, provisions tables and converts rows to records

pub mod source;
pub mod target;

pub use source::SqliteSource;
pub use target::SqliteTarget;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::error::{SyncError, SyncResult};
use crate::sync::SourceRecord;
use crate::utils::{quote_ident, validate_identifier};

/// Columns every record table carries, in select/insert order.
pub const RECORD_COLUMNS: [&str; 4] = ["id", "amount", "customer_id", "last_modified"];

/// Connection shared between a backend and its blocking tasks.
pub(crate) type SharedConnection = Arc<Mutex<Connection>>;

/// Run `f` with the connection locked, on tokio's blocking pool.
///
/// rusqlite calls block the calling thread, up to the busy timeout under
/// lock contention, so the async backends never make them on a worker.
pub(crate) async fn with_connection<T, F>(
    conn: &SharedConnection,
    operation: &'static str,
    f: F,
) -> SyncResult<T>
where
    F: FnOnce(&mut Connection) -> SyncResult<T> + Send + 'static,
    T: Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut conn = conn
            .lock()
            .map_err(|_| SyncError::storage(operation, "connection mutex poisoned"))?;
        f(&mut conn)
    })
    .await
    .map_err(|e| SyncError::storage(operation, e))?
}

/// Open a SQLite database file
///
/// Enables WAL so a reader in another process never blocks on, or observes
/// a partial, watermark write. A 5 second busy timeout absorbs short lock
/// contention before the operation is reported as transient.
///
/// # Examples
///
/// ```no_run
/// # use watermark_replicator::sqlite::open_sqlite;
/// let conn = open_sqlite("replica.db")?;
/// # Ok::<(), watermark_replicator::error::SyncError>(())
/// ```
pub fn open_sqlite(path: impl AsRef<Path>) -> SyncResult<Connection> {
    let path = path.as_ref();
    let conn = Connection::open(path).map_err(|e| {
        SyncError::from_sqlite("open database", e)
    })?;

    conn.pragma_update(None, "journal_mode", "wal")
        .map_err(|e| SyncError::from_sqlite("enable WAL", e))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(|e| SyncError::from_sqlite("set busy timeout", e))?;

    tracing::debug!("Opened SQLite database {}", path.display());
    Ok(conn)
}

/// DDL for a record table (source or destination).
///
/// `amount` is stored as TEXT to keep decimal precision; `last_modified` as
/// TEXT in `YYYY-MM-DD HH:MM:SS[.fff]+00:00` form, which sorts correctly as a
/// string.
pub fn record_table_ddl(table: &str) -> SyncResult<String> {
    validate_identifier(table)?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id            INTEGER PRIMARY KEY,
            amount        TEXT NOT NULL,
            customer_id   INTEGER NOT NULL,
            last_modified TEXT NOT NULL
        )",
        quote_ident(table)
    ))
}

/// DDL for the watermark table: one row per tracked source.
pub fn watermark_table_ddl(table: &str) -> SyncResult<String> {
    validate_identifier(table)?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (
            source_name   TEXT PRIMARY KEY,
            marker_value  TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        )",
        quote_ident(table)
    ))
}

/// Create a record table if it does not exist.
pub fn create_record_table(conn: &Connection, table: &str) -> SyncResult<()> {
    conn.execute_batch(&record_table_ddl(table)?)
        .map_err(|e| SyncError::from_sqlite("create record table", e))
}

/// Decode a row selected with [`RECORD_COLUMNS`] into a record.
pub(crate) fn record_from_row(row: &Row<'_>) -> SyncResult<SourceRecord> {
    let id: i64 = row
        .get(0)
        .map_err(|e| SyncError::from_sqlite("decode id", e))?;
    let amount_ref = row
        .get_ref(1)
        .map_err(|e| SyncError::from_sqlite("decode amount", e))?;
    let amount = decode_amount(amount_ref).map_err(|msg| {
        SyncError::InvalidData(format!("row {}: {}", id, msg))
    })?;
    let customer_id: i64 = row
        .get(2)
        .map_err(|e| SyncError::from_sqlite("decode customer_id", e))?;
    let last_modified = row
        .get(3)
        .map_err(|e| SyncError::from_sqlite("decode last_modified", e))?;

    Ok(SourceRecord {
        id,
        amount,
        customer_id,
        last_modified,
    })
}

/// Accept TEXT, INTEGER or REAL amounts; producers differ.
fn decode_amount(value: ValueRef<'_>) -> Result<Decimal, String> {
    match value {
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
            Decimal::from_str(text.trim())
                .map_err(|e| format!("invalid amount '{}': {}", text, e))
        }
        ValueRef::Integer(i) => Ok(Decimal::from(i)),
        ValueRef::Real(f) => {
            Decimal::try_from(f).map_err(|e| format!("invalid amount {}: {}", f, e))
        }
        ValueRef::Null => Err("amount is NULL".to_string()),
        ValueRef::Blob(_) => Err("amount is a BLOB".to_string()),
    }
}
