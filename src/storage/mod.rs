mod schema;
mod snapshots;
mod types;

pub use schema::Database;
pub use types::{
    EntityKind, Snapshot, StationInformationSnapshot, StationStatusSnapshot, StoreError,
};
