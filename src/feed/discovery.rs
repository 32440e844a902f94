use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::fetcher::{fetch_json, FeedError, SchemaError};

const STATION_STATUS: &str = "station_status";
const STATION_INFORMATION: &str = "station_information";

/// URLs of the two sub-feeds recorded each cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubFeedUrls {
    /// URL of `station_status.json`
    pub status: String,
    /// URL of `station_information.json`
    pub information: String,
}

/// `gbfs.json`, the feed-of-feeds document.
#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub data: ManifestData,
}

/// GBFS 3.x lists feeds directly under `data`; earlier versions nest them
/// under a language code.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ManifestData {
    Flat { feeds: Vec<FeedEntry> },
    ByLanguage(BTreeMap<String, LanguageFeeds>),
}

#[derive(Debug, Deserialize)]
pub struct LanguageFeeds {
    pub feeds: Vec<FeedEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedEntry {
    pub name: String,
    pub url: String,
}

impl Manifest {
    /// Pick the feed list for `language`, falling back to the first language
    /// published when the preferred one is absent.
    fn feeds(&self, language: &str) -> Result<&[FeedEntry], SchemaError> {
        match &self.data {
            ManifestData::Flat { feeds } => Ok(feeds),
            ManifestData::ByLanguage(languages) => languages
                .get(language)
                .or_else(|| {
                    let fallback = languages.iter().next();
                    if let Some((code, _)) = fallback {
                        tracing::debug!(
                            preferred = %language,
                            using = %code,
                            "Preferred manifest language missing"
                        );
                    }
                    fallback.map(|(_, feeds)| feeds)
                })
                .map(|l| l.feeds.as_slice())
                .ok_or(SchemaError::NoFeeds),
        }
    }

    /// Extract the station status and station information URLs.
    pub fn sub_feeds(&self, language: &str) -> Result<SubFeedUrls, SchemaError> {
        let feeds = self.feeds(language)?;
        if feeds.is_empty() {
            return Err(SchemaError::NoFeeds);
        }
        Ok(SubFeedUrls {
            status: find_feed(feeds, STATION_STATUS)?,
            information: find_feed(feeds, STATION_INFORMATION)?,
        })
    }
}

fn find_feed(feeds: &[FeedEntry], name: &'static str) -> Result<String, SchemaError> {
    let entry = feeds
        .iter()
        .find(|f| f.name == name)
        .ok_or(SchemaError::MissingFeed(name))?;

    match url::Url::parse(&entry.url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(entry.url.clone()),
        _ => Err(SchemaError::InvalidUrl {
            name,
            url: entry.url.clone(),
        }),
    }
}

/// Resolves the stable manifest URL into this cycle's sub-feed URLs.
#[derive(Clone)]
pub struct FeedDiscoverer {
    client: reqwest::Client,
    manifest_url: String,
    language: String,
    timeout: Duration,
}

impl FeedDiscoverer {
    pub fn new(
        client: reqwest::Client,
        manifest_url: impl Into<String>,
        language: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            manifest_url: manifest_url.into(),
            language: language.into(),
            timeout,
        }
    }

    pub fn manifest_url(&self) -> &str {
        &self.manifest_url
    }

    /// Fetch the manifest and look up both sub-feeds by name.
    ///
    /// # Errors
    ///
    /// [`FeedError::Fetch`] if the manifest is unreachable or answers with a
    /// non-success status, [`FeedError::Schema`] if it is malformed or lacks
    /// either sub-feed.
    pub async fn resolve(&self) -> Result<SubFeedUrls, FeedError> {
        let manifest: Manifest =
            fetch_json(&self.client, &self.manifest_url, self.timeout).await?;
        Ok(manifest.sub_feeds(&self.language)?)
    }
}
