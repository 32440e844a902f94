use serde::{Deserialize, Serialize};
use sqlx::query_builder::Separated;
use sqlx::sqlite::SqliteRow;
use sqlx::Sqlite;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by the snapshot store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

// ============================================================================
// Entity Kinds
// ============================================================================

/// The two snapshot families recorded from the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    StationInformation,
    StationStatus,
}

impl EntityKind {
    /// Directory name used for this entity in the exported dataset
    pub fn export_dir(self) -> &'static str {
        match self {
            EntityKind::StationInformation => "stations_information",
            EntityKind::StationStatus => "stations_statuses",
        }
    }

    /// Table backing this entity
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::StationInformation => "station_information",
            EntityKind::StationStatus => "station_status",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

// ============================================================================
// Snapshot Records
// ============================================================================

/// One observation of a station's live state.
///
/// Field order is the CSV column order of the exported dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StationStatusSnapshot {
    pub updated_time: i64,
    pub station_id: String,
    pub num_bikes_available: i64,
    pub num_bikes_disabled: i64,
    pub num_docks_available: i64,
    pub is_installed: i64,
    pub is_renting: i64,
    pub is_returning: i64,
    pub last_reported: i64,
}

/// One observation of a station's metadata.
///
/// Field order is the CSV column order of the exported dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StationInformationSnapshot {
    pub updated_time: i64,
    pub station_id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub capacity: i64,
}

/// A row type stored in one of the snapshot tables, keyed by
/// `(updated_time, station_id)`.
pub trait Snapshot:
    for<'r> sqlx::FromRow<'r, SqliteRow> + Serialize + Send + Sync + Unpin + 'static
{
    const KIND: EntityKind;

    /// Comma-separated column list, in declaration order
    const COLUMNS: &'static str;

    /// Number of bound parameters per row
    const ARITY: usize;

    fn updated_time(&self) -> i64;

    fn station_id(&self) -> &str;

    /// Push one bind per column, in `COLUMNS` order
    fn push_binds(&self, b: &mut Separated<'_, '_, Sqlite, &'static str>);
}

impl Snapshot for StationStatusSnapshot {
    const KIND: EntityKind = EntityKind::StationStatus;
    const COLUMNS: &'static str = "updated_time, station_id, num_bikes_available, \
         num_bikes_disabled, num_docks_available, is_installed, is_renting, \
         is_returning, last_reported";
    const ARITY: usize = 9;

    fn updated_time(&self) -> i64 {
        self.updated_time
    }

    fn station_id(&self) -> &str {
        &self.station_id
    }

    fn push_binds(&self, b: &mut Separated<'_, '_, Sqlite, &'static str>) {
        b.push_bind(self.updated_time)
            .push_bind(self.station_id.clone())
            .push_bind(self.num_bikes_available)
            .push_bind(self.num_bikes_disabled)
            .push_bind(self.num_docks_available)
            .push_bind(self.is_installed)
            .push_bind(self.is_renting)
            .push_bind(self.is_returning)
            .push_bind(self.last_reported);
    }
}

impl Snapshot for StationInformationSnapshot {
    const KIND: EntityKind = EntityKind::StationInformation;
    const COLUMNS: &'static str = "updated_time, station_id, name, lat, lon, capacity";
    const ARITY: usize = 6;

    fn updated_time(&self) -> i64 {
        self.updated_time
    }

    fn station_id(&self) -> &str {
        &self.station_id
    }

    fn push_binds(&self, b: &mut Separated<'_, '_, Sqlite, &'static str>) {
        b.push_bind(self.updated_time)
            .push_bind(self.station_id.clone())
            .push_bind(self.name.clone())
            .push_bind(self.lat)
            .push_bind(self.lon)
            .push_bind(self.capacity);
    }
}
