use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use gbfs_recorder::config::Config;
use gbfs_recorder::export::archive::{GitHubArchive, GitHubConfig};
use gbfs_recorder::export::{ExportTarget, Exporter};
use gbfs_recorder::feed::FeedDiscoverer;
use gbfs_recorder::ingest::{CycleResult, Ingestor};
use gbfs_recorder::scheduler::Scheduler;
use gbfs_recorder::storage::{Database, EntityKind};

const USER_AGENT: &str = concat!("gbfs-recorder/", env!("CARGO_PKG_VERSION"));

#[derive(Parser, Debug)]
#[command(
    name = "gbfs-recorder",
    version,
    about = "Records GBFS bike-share snapshots and archives them daily as CSV"
)]
struct Args {
    /// Configuration file
    #[arg(long, value_name = "PATH", default_value = "gbfs-recorder.toml")]
    config: PathBuf,

    /// Run a single ingestion cycle and exit
    #[arg(long, conflicts_with = "export_date")]
    once: bool,

    /// Export the given day (DD-MM-YYYY or YYYY-MM-DD) and exit
    #[arg(long, value_name = "DATE", value_parser = parse_date)]
    export_date: Option<NaiveDate>,
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%d-%m-%Y")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .map_err(|_| format!("'{}' is not a DD-MM-YYYY or YYYY-MM-DD date", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    tracing::debug!(config = ?config, "Effective configuration");

    let db_path = config
        .database_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = Database::open(db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path))?;

    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.http_timeout())
        .build()
        .context("Failed to create HTTP client")?;
    let discoverer = FeedDiscoverer::new(
        client.clone(),
        config.manifest_url.clone(),
        config.feed_language.clone(),
        config.http_timeout(),
    );
    let ingestor = Ingestor::new(discoverer, client, db.clone(), config.http_timeout());

    if args.once {
        match ingestor.run_cycle().await {
            result if result.is_success() => {}
            CycleResult::DiscoveryFailed(e) => return Err(e).context("Feed discovery failed"),
            _ => anyhow::bail!("Ingestion cycle completed with failures"),
        }
        let information = db.count_snapshots(EntityKind::StationInformation).await?;
        let status = db.count_snapshots(EntityKind::StationStatus).await?;
        tracing::info!(
            information = information,
            status = status,
            "Ingestion cycle complete, snapshots stored"
        );
        return Ok(());
    }

    if config.archive.token.is_none() {
        tracing::warn!("No GITHUB_TOKEN configured, archive uploads will be rejected");
    }
    let archive = GitHubArchive::new(GitHubConfig {
        token: config.archive.token.clone().map(SecretString::from),
        api_url: config.archive.api_url.clone(),
        ..GitHubConfig::default()
    })
    .context("Failed to create archive client")?;
    let target = ExportTarget {
        owner: config.archive.owner.clone(),
        repo: config.archive.repo.clone(),
    };
    let exporter = Exporter::new(db, archive, target, config.timezone()?);

    if let Some(date) = args.export_date {
        let report = exporter.export_day(date).await?;
        if !report.is_success() {
            anyhow::bail!("Export of {} completed with failures", date);
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let scheduler = Scheduler::new(
        Arc::new(ingestor),
        Arc::new(exporter),
        config.schedule_settings()?,
    );
    scheduler.run(shutdown_rx).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_both_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        assert_eq!(parse_date("31-03-2024").unwrap(), expected);
        assert_eq!(parse_date("2024-03-31").unwrap(), expected);
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        assert!(parse_date("31/03/2024").is_err());
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn test_args_reject_once_with_export_date() {
        let result = Args::try_parse_from(["gbfs-recorder", "--once", "--export-date", "01-01-2024"]);
        assert!(result.is_err());
    }
}
