// ABOUTME: PostgreSQL sync target - destination table plus watermark table
// ABOUTME: Uses INSERT ... ON CONFLICT DO UPDATE and one transaction per run

use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, GenericClient};

use super::{decode_error, qualified_table, record_from_row, RECORD_SELECT_LIST};
use crate::error::{SyncError, SyncResult};
use crate::sync::{
    advancer, applier, ChangeSet, CommitError, CommitSummary, Destination, Marker, SourceRecord,
    SyncTarget, UpsertSummary, WatermarkStore,
};

/// Parameters bound per row: id, amount, customer_id, last_modified.
const PARAMS_PER_ROW: usize = 4;

/// PostgreSQL has a limit of ~65535 parameters per query; leave some margin.
const MAX_PARAMS: usize = 65_000;

/// Destination table and watermark table in one PostgreSQL database.
///
/// The upsert and the marker write of a run share one transaction, so a
/// constraint violation or lost connection leaves both untouched.
pub struct PostgresTarget {
    client: Mutex<Client>,
    table: String,
    watermark_table: String,
}

impl PostgresTarget {
    /// Create a PostgresTarget writing rows to `schema.table` and markers to
    /// `schema.watermark_table`.
    pub fn new(
        client: Client,
        schema: &str,
        table: &str,
        watermark_table: &str,
    ) -> SyncResult<Self> {
        Ok(Self {
            client: Mutex::new(client),
            table: qualified_table(schema, table)?,
            watermark_table: qualified_table(schema, watermark_table)?,
        })
    }

    /// Create the destination and watermark tables if they do not exist.
    pub async fn ensure_schema(&self) -> SyncResult<()> {
        self.ensure_record_table().await?;

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                source_name   TEXT PRIMARY KEY,
                marker_value  TIMESTAMPTZ NOT NULL,
                updated_at    TIMESTAMPTZ NOT NULL DEFAULT now()
            );",
            self.watermark_table
        );
        let client = self.client.lock().await;
        client
            .batch_execute(&ddl)
            .await
            .map_err(|e| SyncError::from_postgres("ensure schema", e))?;
        tracing::info!("Ensured PostgreSQL watermark table {}", self.watermark_table);
        Ok(())
    }

    /// Create only the destination table, for markers kept elsewhere.
    pub async fn ensure_record_table(&self) -> SyncResult<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id            BIGINT PRIMARY KEY,
                amount        NUMERIC NOT NULL,
                customer_id   BIGINT NOT NULL,
                last_modified TIMESTAMPTZ NOT NULL
            );",
            self.table
        );

        let client = self.client.lock().await;
        client
            .batch_execute(&ddl)
            .await
            .map_err(|e| SyncError::from_postgres("ensure schema", e))?;
        tracing::info!("Ensured PostgreSQL table {}", self.table);
        Ok(())
    }

    /// Number of rows in the destination table.
    pub async fn row_count(&self) -> SyncResult<i64> {
        let client = self.client.lock().await;
        let row = client
            .query_one(&format!("SELECT COUNT(*) FROM {}", self.table), &[])
            .await
            .map_err(|e| SyncError::from_postgres("count rows", e))?;
        row.try_get(0).map_err(decode_error)
    }

    /// Fetch one destination row by id.
    pub async fn fetch(&self, id: i64) -> SyncResult<Option<SourceRecord>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM {} WHERE \"id\" = $1",
                    RECORD_SELECT_LIST, self.table
                ),
                &[&id],
            )
            .await
            .map_err(|e| SyncError::from_postgres("fetch row", e))?;
        row.as_ref().map(record_from_row).transpose()
    }
}

/// Upsert records in parameter-limited chunks over `client`.
///
/// Each chunk is one `INSERT ... ON CONFLICT DO UPDATE ... RETURNING` whose
/// `(xmax = 0)` column tells inserted rows from updated ones.
async fn upsert_in<C: GenericClient>(
    client: &C,
    table: &str,
    records: &[SourceRecord],
) -> SyncResult<UpsertSummary> {
    let batch_size = std::cmp::max(1, MAX_PARAMS / PARAMS_PER_ROW);
    let mut summary = UpsertSummary::default();

    for chunk in records.chunks(batch_size) {
        let query = build_upsert_query(table, chunk.len());

        let params: Vec<&(dyn ToSql + Sync)> = chunk
            .iter()
            .flat_map(|r| {
                let row: [&(dyn ToSql + Sync); PARAMS_PER_ROW] =
                    [&r.id, &r.amount, &r.customer_id, &r.last_modified];
                row
            })
            .collect();

        let rows = client
            .query(&query, &params)
            .await
            .map_err(|e| upsert_error(e, chunk))?;

        for row in &rows {
            let inserted: bool = row.try_get(0).map_err(decode_error)?;
            if inserted {
                summary.inserted += 1;
            } else {
                summary.updated += 1;
            }
        }
    }

    Ok(summary)
}

/// Classify an upsert failure; a single-row chunk pins the violation to its id.
fn upsert_error(err: tokio_postgres::Error, chunk: &[SourceRecord]) -> SyncError {
    let err = SyncError::from_postgres("upsert rows", err);
    match chunk {
        [only] => err.with_row_id(only.id),
        _ => err,
    }
}

async fn write_marker_in<C: GenericClient>(
    client: &C,
    watermark_table: &str,
    source_name: &str,
    marker: Marker,
) -> SyncResult<()> {
    client
        .execute(
            &format!(
                "INSERT INTO {} (source_name, marker_value, updated_at) VALUES ($1, $2, now()) \
                 ON CONFLICT (source_name) DO UPDATE SET \
                    marker_value = EXCLUDED.marker_value, \
                    updated_at = EXCLUDED.updated_at",
                watermark_table
            ),
            &[&source_name, &marker],
        )
        .await
        .map_err(|e| SyncError::from_postgres("write marker", e))?;
    Ok(())
}

/// Build an upsert query for `num_rows` records.
///
/// Generates a query like:
/// ```sql
/// INSERT INTO "public"."orders" ("id", "amount", "customer_id", "last_modified")
/// VALUES ($1::bigint, $2::numeric, $3::bigint, $4::timestamptz), ...
/// ON CONFLICT ("id") DO UPDATE SET
///   "amount" = EXCLUDED."amount", ...
/// RETURNING (xmax = 0) AS inserted
/// ```
fn build_upsert_query(qualified_table: &str, num_rows: usize) -> String {
    let casts = ["bigint", "numeric", "bigint", "timestamptz"];

    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = casts
                .iter()
                .enumerate()
                .map(|(col_idx, cast)| {
                    format!("${}::{}", row_idx * PARAMS_PER_ROW + col_idx + 1, cast)
                })
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} (\"id\", \"amount\", \"customer_id\", \"last_modified\") VALUES {} \
         ON CONFLICT (\"id\") DO UPDATE SET \
         \"amount\" = EXCLUDED.\"amount\", \
         \"customer_id\" = EXCLUDED.\"customer_id\", \
         \"last_modified\" = EXCLUDED.\"last_modified\" \
         RETURNING (xmax = 0) AS inserted",
        qualified_table,
        value_rows.join(", ")
    )
}

impl WatermarkStore for PostgresTarget {
    async fn get(&self, source_name: &str) -> SyncResult<Option<Marker>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "SELECT marker_value FROM {} WHERE source_name = $1",
                    self.watermark_table
                ),
                &[&source_name],
            )
            .await
            .map_err(|e| SyncError::from_postgres("read marker", e))?;
        // marker_value may have been created out of band with another type
        row.map(|r| r.try_get(0))
            .transpose()
            .map_err(|e| {
                SyncError::InvalidData(format!(
                    "{}.marker_value is not a timestamptz: {}",
                    self.watermark_table, e
                ))
            })
    }

    async fn set(&self, source_name: &str, marker: Marker) -> SyncResult<()> {
        let client = self.client.lock().await;
        write_marker_in(&*client, &self.watermark_table, source_name, marker).await
    }
}

impl Destination for PostgresTarget {
    async fn upsert(&self, records: &[SourceRecord]) -> SyncResult<UpsertSummary> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| SyncError::from_postgres("begin transaction", e))?;
        let summary = upsert_in(&tx, &self.table, records).await?;
        tx.commit()
            .await
            .map_err(|e| SyncError::from_postgres("commit transaction", e))?;
        Ok(summary)
    }
}

impl SyncTarget for PostgresTarget {
    async fn commit(
        &self,
        source_name: &str,
        changeset: &ChangeSet,
    ) -> Result<CommitSummary, CommitError> {
        applier::validate_changeset(changeset).map_err(CommitError::NotApplied)?;

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| CommitError::NotApplied(SyncError::from_postgres("begin transaction", e)))?;

        let upsert = upsert_in(&tx, &self.table, changeset.records())
            .await
            .map_err(CommitError::NotApplied)?;

        let marker = advancer::candidate_marker(changeset);
        if let Some(marker) = marker {
            write_marker_in(&tx, &self.watermark_table, source_name, marker)
                .await
                .map_err(CommitError::NotApplied)?;
        }

        // Dropping an uncommitted transaction rolls it back
        tx.commit().await.map_err(|e| {
            CommitError::NotApplied(SyncError::from_postgres("commit transaction", e))
        })?;

        Ok(CommitSummary { upsert, marker })
    }
}
