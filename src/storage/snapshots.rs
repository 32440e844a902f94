use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::{QueryBuilder, Sqlite};

use super::schema::Database;
use super::types::{EntityKind, Snapshot, StoreError};

/// Bind parameters allowed per statement. 999 is the historical SQLite
/// ceiling and stays valid for every bundled version.
const MAX_BIND_PARAMS: usize = 999;

impl Database {
    // ========================================================================
    // Snapshot Writes
    // ========================================================================

    /// Insert a batch of snapshots, ignoring rows whose
    /// `(updated_time, station_id)` key is already stored.
    ///
    /// The whole batch commits in one transaction. Returns the number of rows
    /// actually inserted; a batch made entirely of known keys returns 0 and is
    /// not an error.
    pub async fn upsert_batch<S: Snapshot>(&self, rows: &[S]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let rows_per_chunk = (MAX_BIND_PARAMS / S::ARITY).max(1);
        let mut tx = self.pool.begin().await?;
        let mut inserted: u64 = 0;

        for chunk in rows.chunks(rows_per_chunk) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO {} ({}) ",
                S::KIND.table(),
                S::COLUMNS
            ));
            builder.push_values(chunk, |mut b, row| row.push_binds(&mut b));
            builder.push(" ON CONFLICT(updated_time, station_id) DO NOTHING");

            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;

        tracing::debug!(
            entity = %S::KIND,
            rows = rows.len(),
            inserted = inserted,
            "Snapshot batch committed"
        );
        Ok(inserted)
    }

    // ========================================================================
    // Snapshot Queries
    // ========================================================================

    /// Stream every snapshot with `updated_time` in `[start, end]` (inclusive),
    /// ordered by `(updated_time ASC, station_id ASC)`.
    ///
    /// Rows are decoded one at a time as the stream is polled, so a full day
    /// of snapshots is never held in memory.
    pub fn query_window<S: Snapshot>(
        &self,
        start: i64,
        end: i64,
    ) -> BoxStream<'_, Result<S, StoreError>> {
        sqlx::query_as::<_, S>(window_query(S::KIND))
            .bind(start)
            .bind(end)
            .fetch(&self.pool)
            .map_err(StoreError::from)
            .boxed()
    }

    /// Number of stored snapshots of the given kind
    pub async fn count_snapshots(&self, kind: EntityKind) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }
}

fn window_query(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::StationStatus => {
            r#"
            SELECT updated_time, station_id, num_bikes_available, num_bikes_disabled,
                   num_docks_available, is_installed, is_renting, is_returning, last_reported
            FROM station_status
            WHERE updated_time BETWEEN ? AND ?
            ORDER BY updated_time ASC, station_id ASC
        "#
        }
        EntityKind::StationInformation => {
            r#"
            SELECT updated_time, station_id, name, lat, lon, capacity
            FROM station_information
            WHERE updated_time BETWEEN ? AND ?
            ORDER BY updated_time ASC, station_id ASC
        "#
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
