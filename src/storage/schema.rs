use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::StoreError;

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `path` is a filesystem path or `:memory:`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Migration` if the schema cannot be created and
    /// `StoreError::Other` for connection failures.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: overlapping ingestion cycles queue on the write lock
        // instead of failing with SQLITE_BUSY. WAL lets the daily export read
        // while cycles keep writing.
        let options = SqliteConnectOptions::from_str(&url)?
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate()
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        tracing::debug!(path = %path, "Snapshot store ready");
        Ok(db)
    }

    /// Create the snapshot tables atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS station_status (
                updated_time INTEGER NOT NULL,
                station_id TEXT NOT NULL,
                num_bikes_available INTEGER NOT NULL,
                num_bikes_disabled INTEGER NOT NULL,
                num_docks_available INTEGER NOT NULL,
                is_installed INTEGER NOT NULL,
                is_renting INTEGER NOT NULL,
                is_returning INTEGER NOT NULL,
                last_reported INTEGER NOT NULL,
                PRIMARY KEY (updated_time, station_id)
            ) WITHOUT ROWID
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS station_information (
                updated_time INTEGER NOT NULL,
                station_id TEXT NOT NULL,
                name TEXT NOT NULL,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                capacity INTEGER NOT NULL,
                PRIMARY KEY (updated_time, station_id)
            ) WITHOUT ROWID
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
