//! Configuration file parser for `gbfs-recorder.toml`.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos. `GITHUB_TOKEN` and `DATABASE_PATH` in the
//! environment take precedence over the file.
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::scheduler::ScheduleSettings;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
///
/// Custom Debug impl masks the archive token.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GBFS manifest (`gbfs.json`) URL. Redirects are followed.
    pub manifest_url: String,

    /// Preferred manifest language for per-language layouts.
    pub feed_language: String,

    /// SQLite database file, created if missing.
    pub database_path: PathBuf,

    /// IANA name of the publication timezone. Export days and the export
    /// schedule are evaluated in it.
    pub timezone: String,

    /// Seconds between ingestion cycles.
    pub ingest_interval_secs: u64,

    /// Six-field cron expression (seconds first) for the daily export.
    pub export_schedule: String,

    /// Timeout for each feed request, in seconds.
    pub http_timeout_secs: u64,

    pub archive: ArchiveConfig,
}

/// Where exported CSV files are committed.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub owner: String,
    pub repo: String,
    /// GitHub API base URL.
    pub api_url: String,
    /// GitHub token (alternative to GITHUB_TOKEN env var).
    pub token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manifest_url: "https://www.data.gouv.fr/fr/datasets/r/732c582d-8815-4892-98fd-4446b7ba13d5"
                .to_string(),
            feed_language: "en".to_string(),
            database_path: PathBuf::from("gbfs.db"),
            timezone: "Europe/Paris".to_string(),
            ingest_interval_secs: 1,
            export_schedule: "0 1 1 * * *".to_string(),
            http_timeout_secs: 10,
            archive: ArchiveConfig::default(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            owner: "BrokenSwing".to_string(),
            repo: "tam-velomagg-dataset".to_string(),
            api_url: "https://api.github.com".to_string(),
            token: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("manifest_url", &self.manifest_url)
            .field("feed_language", &self.feed_language)
            .field("database_path", &self.database_path)
            .field("timezone", &self.timezone)
            .field("ingest_interval_secs", &self.ingest_interval_secs)
            .field("export_schedule", &self.export_schedule)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("archive", &self.archive)
            .finish()
    }
}

impl std::fmt::Debug for ArchiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveConfig")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("api_url", &self.api_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 8] = [
        "manifest_url",
        "feed_language",
        "database_path",
        "timezone",
        "ingest_interval_secs",
        "export_schedule",
        "http_timeout_secs",
        "archive",
    ];

    const KNOWN_ARCHIVE_KEYS: [&'static str; 4] = ["owner", "repo", "api_url", "token"];

    /// Load and validate configuration from a TOML file.
    ///
    /// - Missing file → defaults
    /// - Empty file → defaults
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Bad timezone, schedule, URL or interval → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in the binary.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup("GITHUB_TOKEN").filter(|t| !t.is_empty()) {
            self.archive.token = Some(token);
        }
        if let Some(path) = lookup("DATABASE_PATH").filter(|p| !p.is_empty()) {
            self.database_path = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timezone()?;
        self.export_schedule()?;

        let url = url::Url::parse(&self.manifest_url).map_err(|e| {
            ConfigError::Invalid(format!("manifest_url '{}': {}", self.manifest_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "manifest_url must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.ingest_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "ingest_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "http_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        Tz::from_str(&self.timezone)
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone '{}'", self.timezone)))
    }

    pub fn export_schedule(&self) -> Result<cron::Schedule, ConfigError> {
        cron::Schedule::from_str(&self.export_schedule).map_err(|e| {
            ConfigError::Invalid(format!("export_schedule '{}': {}", self.export_schedule, e))
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn schedule_settings(&self) -> Result<ScheduleSettings, ConfigError> {
        Ok(ScheduleSettings {
            ingest_interval: Duration::from_secs(self.ingest_interval_secs),
            export_schedule: self.export_schedule()?,
            timezone: self.timezone()?,
        })
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for (key, value) in raw {
        if !Config::KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        }
        let Some(table) = value.as_table().filter(|_| key == "archive") else {
            continue;
        };
        for archive_key in table.keys() {
            if !Config::KNOWN_ARCHIVE_KEYS.contains(&archive_key.as_str()) {
                tracing::warn!(
                    key = %format!("archive.{archive_key}"),
                    "Unknown key in config file, ignoring"
                );
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
