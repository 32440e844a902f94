//! One fetch-transform-persist cycle over the GBFS feed.
//!
//! A cycle resolves the manifest, then runs the station information and
//! station status pipelines side by side. The pipelines are joined, not
//! raced: a failure in one is logged and recorded in its outcome while the
//! other runs to completion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::Instrument;

use crate::feed::{
    fetch_json, FeedDiscoverer, FeedError, StationInformationFeed, StationStatusFeed, SubFeed,
};
use crate::storage::{Database, Snapshot, StoreError};

/// Failure of a single sub-feed pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("Failed to store snapshots: {0}")]
    Store(#[from] StoreError),
}

/// What one pipeline persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Persisted {
    /// Provider `last_updated` stamped on every row
    pub updated_time: i64,
    /// Stations present in the payload
    pub fetched: usize,
    /// Rows that were not already stored
    pub inserted: u64,
}

pub type PipelineOutcome = Result<Persisted, IngestError>;

/// Outcome of one cycle. Only used for logging and tests; the scheduler
/// never branches on it.
#[derive(Debug)]
pub enum CycleResult {
    /// Manifest could not be resolved, nothing was fetched
    DiscoveryFailed(FeedError),
    /// Both pipelines settled, each with its own outcome
    Settled {
        information: PipelineOutcome,
        status: PipelineOutcome,
    },
}

impl CycleResult {
    /// Both pipelines persisted their batch
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            CycleResult::Settled {
                information: Ok(_),
                status: Ok(_)
            }
        )
    }

    /// Exactly one pipeline failed
    pub fn is_partial(&self) -> bool {
        match self {
            CycleResult::Settled {
                information,
                status,
            } => information.is_ok() != status.is_ok(),
            CycleResult::DiscoveryFailed(_) => false,
        }
    }
}

/// Runs ingestion cycles against one manifest and one store.
pub struct Ingestor {
    discoverer: FeedDiscoverer,
    client: reqwest::Client,
    db: Database,
    timeout: Duration,
    cycles: AtomicU64,
}

impl Ingestor {
    pub fn new(
        discoverer: FeedDiscoverer,
        client: reqwest::Client,
        db: Database,
        timeout: Duration,
    ) -> Self {
        Self {
            discoverer,
            client,
            db,
            timeout,
            cycles: AtomicU64::new(0),
        }
    }

    /// Run one full cycle: discovery, then both pipelines concurrently.
    ///
    /// Never fails: every error is logged and reported in the returned
    /// [`CycleResult`].
    pub async fn run_cycle(&self) -> CycleResult {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed);
        let span = tracing::debug_span!("cycle", id = cycle);
        self.run_cycle_inner().instrument(span).await
    }

    async fn run_cycle_inner(&self) -> CycleResult {
        let urls = match self.discoverer.resolve().await {
            Ok(urls) => urls,
            Err(e) => {
                tracing::warn!(
                    manifest = %self.discoverer.manifest_url(),
                    error = %e,
                    "Feed discovery failed, skipping cycle"
                );
                return CycleResult::DiscoveryFailed(e);
            }
        };

        let (information, status) = tokio::join!(
            self.pipeline::<StationInformationFeed>(&urls.information),
            self.pipeline::<StationStatusFeed>(&urls.status),
        );

        let result = CycleResult::Settled {
            information,
            status,
        };
        if result.is_partial() {
            tracing::warn!("Partial cycle, one feed was not stored");
        }
        result
    }

    /// Fetch one sub-feed, map it into snapshots and persist them, logging
    /// the outcome.
    async fn pipeline<F: SubFeed>(&self, url: &str) -> PipelineOutcome {
        let entity = <F::Row as Snapshot>::KIND;
        let outcome = self.fetch_and_store::<F>(url).await;

        match &outcome {
            Ok(persisted) if persisted.inserted > 0 => {
                tracing::info!(
                    entity = %entity,
                    updated_time = persisted.updated_time,
                    stations = persisted.fetched,
                    inserted = persisted.inserted,
                    "Stored new snapshots"
                );
            }
            Ok(persisted) => {
                tracing::debug!(
                    entity = %entity,
                    updated_time = persisted.updated_time,
                    "Feed unchanged since last cycle"
                );
            }
            Err(e) => {
                tracing::warn!(entity = %entity, url = %url, error = %e, "Pipeline failed");
            }
        }

        outcome
    }

    async fn fetch_and_store<F: SubFeed>(&self, url: &str) -> PipelineOutcome {
        let payload: F = fetch_json(&self.client, url, self.timeout).await?;
        let updated_time = payload.last_updated();
        let rows = payload.into_snapshots();
        let inserted = self.db.upsert_batch(&rows).await?;

        Ok(Persisted {
            updated_time,
            fetched: rows.len(),
            inserted,
        })
    }
}
