// ABOUTME: PostgreSQL change source - reads rows modified after the marker
// ABOUTME: Uses last_modified > $1 so the boundary row is never reselected

use tokio_postgres::Client;

use super::{decode_error, qualified_table, record_from_row, RECORD_SELECT_LIST};
use crate::error::{SyncError, SyncResult};
use crate::sync::{ChangeSource, Marker, SourceRecord};

/// Reads changed rows from a PostgreSQL table.
///
/// An index on `last_modified` keeps each run proportional to the number of
/// changed rows rather than the table size.
pub struct PostgresSource {
    client: Client,
    schema: String,
    table: String,
    qualified: String,
}

impl PostgresSource {
    /// Create a PostgresSource reading `schema.table` over `client`.
    pub fn new(client: Client, schema: &str, table: &str) -> SyncResult<Self> {
        let qualified = qualified_table(schema, table)?;
        Ok(Self {
            client,
            schema: schema.to_string(),
            table: table.to_string(),
            qualified,
        })
    }

    /// Build the change query for this table.
    fn change_query(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE \"last_modified\" > $1",
            RECORD_SELECT_LIST, self.qualified
        )
    }

    /// Count rows that would be selected, without reading them.
    pub async fn count_changed_since(&self, since: Marker) -> SyncResult<i64> {
        let row = self
            .client
            .query_one(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE \"last_modified\" > $1",
                    self.qualified
                ),
                &[&since],
            )
            .await
            .map_err(|e| SyncError::from_postgres("count changes", e))?;
        row.try_get(0).map_err(decode_error)
    }
}

impl ChangeSource for PostgresSource {
    async fn changed_since(&self, since: Marker) -> SyncResult<Vec<SourceRecord>> {
        let rows = self
            .client
            .query(&self.change_query(), &[&since])
            .await
            .map_err(|e| SyncError::from_postgres("read changes", e))?;

        tracing::debug!(
            "Read {} changed rows from {}.{}",
            rows.len(),
            self.schema,
            self.table
        );

        rows.iter().map(record_from_row).collect()
    }
}
