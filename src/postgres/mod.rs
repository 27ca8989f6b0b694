// ABOUTME: PostgreSQL backend for watermark-driven sync
// ABOUTME: Source reader, transactional target and shared row decoding

pub mod connection;
pub mod source;
pub mod target;

pub use connection::{connect, connect_with_retry, init_tls_policy};
pub use source::PostgresSource;
pub use target::PostgresTarget;

use tokio_postgres::Row;

use crate::error::{SyncError, SyncResult};
use crate::sync::SourceRecord;
use crate::utils::{quote_ident, validate_identifier};

/// Fully qualified, quoted `"schema"."table"`.
pub(crate) fn qualified_table(schema: &str, table: &str) -> SyncResult<String> {
    validate_identifier(schema)?;
    validate_identifier(table)?;
    Ok(format!("{}.{}", quote_ident(schema), quote_ident(table)))
}

/// Select list that normalizes column types, so producers using INTEGER ids
/// or `timestamp without time zone` still decode.
pub(crate) const RECORD_SELECT_LIST: &str = "\"id\"::bigint, \"amount\"::numeric, \
     \"customer_id\"::bigint, \"last_modified\"::timestamptz";

/// A column whose type does not match what we read it as.
pub(crate) fn decode_error(err: tokio_postgres::Error) -> SyncError {
    SyncError::InvalidData(err.to_string())
}

/// Decode a row selected with [`RECORD_SELECT_LIST`].
pub(crate) fn record_from_row(row: &Row) -> SyncResult<SourceRecord> {
    Ok(SourceRecord {
        id: row.try_get(0).map_err(decode_error)?,
        amount: row.try_get(1).map_err(decode_error)?,
        customer_id: row.try_get(2).map_err(decode_error)?,
        last_modified: row.try_get(3).map_err(decode_error)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_table() {
        assert_eq!(
            qualified_table("public", "orders").unwrap(),
            "\"public\".\"orders\""
        );
        assert!(qualified_table("public", "orders; --").is_err());
        assert!(qualified_table("", "orders").is_err());
    }
}
