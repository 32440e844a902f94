//! Records GBFS bike-share station snapshots into SQLite and archives each
//! day as CSV files in a GitHub repository.

pub mod config;
pub mod export;
pub mod feed;
pub mod ingest;
pub mod scheduler;
pub mod storage;
