//! GBFS sub-feed payloads and their mapping into snapshot rows.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

use crate::storage::{Snapshot, StationInformationSnapshot, StationStatusSnapshot};

/// A sub-feed document that maps onto one snapshot table.
pub trait SubFeed: DeserializeOwned + Send + 'static {
    type Row: Snapshot;

    /// Provider-side publication time of this document
    fn last_updated(&self) -> i64;

    fn into_snapshots(self) -> Vec<Self::Row>;
}

/// `station_status.json`
#[derive(Debug, Deserialize)]
pub struct StationStatusFeed {
    pub last_updated: i64,
    pub data: StationList<StationStatusEntry>,
}

/// `station_information.json`
#[derive(Debug, Deserialize)]
pub struct StationInformationFeed {
    pub last_updated: i64,
    pub data: StationList<StationInformationEntry>,
}

#[derive(Debug, Deserialize)]
pub struct StationList<T> {
    pub stations: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct StationStatusEntry {
    #[serde(deserialize_with = "station_id")]
    pub station_id: String,
    pub num_bikes_available: i64,
    #[serde(default)]
    pub num_bikes_disabled: i64,
    pub num_docks_available: i64,
    #[serde(deserialize_with = "flag")]
    pub is_installed: i64,
    #[serde(deserialize_with = "flag")]
    pub is_renting: i64,
    #[serde(deserialize_with = "flag")]
    pub is_returning: i64,
    pub last_reported: i64,
}

#[derive(Debug, Deserialize)]
pub struct StationInformationEntry {
    #[serde(deserialize_with = "station_id")]
    pub station_id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub capacity: i64,
}

impl SubFeed for StationStatusFeed {
    type Row = StationStatusSnapshot;

    fn last_updated(&self) -> i64 {
        self.last_updated
    }

    /// Stamp every station with the payload's own `last_updated`, so two
    /// cycles that observe the same provider update produce identical keys.
    fn into_snapshots(self) -> Vec<StationStatusSnapshot> {
        let updated_time = self.last_updated;
        self.data
            .stations
            .into_iter()
            .map(|s| StationStatusSnapshot {
                updated_time,
                station_id: s.station_id,
                num_bikes_available: s.num_bikes_available,
                num_bikes_disabled: s.num_bikes_disabled,
                num_docks_available: s.num_docks_available,
                is_installed: s.is_installed,
                is_renting: s.is_renting,
                is_returning: s.is_returning,
                last_reported: s.last_reported,
            })
            .collect()
    }
}

impl SubFeed for StationInformationFeed {
    type Row = StationInformationSnapshot;

    fn last_updated(&self) -> i64 {
        self.last_updated
    }

    fn into_snapshots(self) -> Vec<StationInformationSnapshot> {
        let updated_time = self.last_updated;
        self.data
            .stations
            .into_iter()
            .map(|s| StationInformationSnapshot {
                updated_time,
                station_id: s.station_id,
                name: s.name,
                lat: s.lat,
                lon: s.lon,
                capacity: s.capacity,
            })
            .collect()
    }
}

// GBFS 1.x publishes flags as 0/1, 2.x as booleans. Both store as 0/1.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(i64::from(b)),
        Flag::Int(0) => Ok(0),
        Flag::Int(1) => Ok(1),
        Flag::Int(other) => Err(serde::de::Error::custom(format!(
            "flag must be 0, 1 or a boolean, got {other}"
        ))),
    }
}

// Some providers publish numeric station ids.
fn station_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
