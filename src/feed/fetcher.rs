use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

const MAX_FEED_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Transport-level failures while retrieving a feed document.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
}

/// The document was retrieved but does not have the expected shape.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A sub-feed the pipeline depends on is not listed in the manifest
    #[error("Feed '{0}' is missing from the manifest")]
    MissingFeed(&'static str),
    /// The manifest lists no feeds at all
    #[error("Manifest does not list any feeds")]
    NoFeeds,
    /// A listed feed URL is not an absolute http(s) URL
    #[error("Feed '{name}' has an invalid URL: {url}")]
    InvalidUrl { name: &'static str, url: String },
    /// JSON body did not match the expected structure
    #[error("Malformed payload from {url}: {source}")]
    Malformed {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Any failure of a feed retrieval, split by whether the transport or the
/// payload was at fault.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Fetch `url` and decode its JSON body as `T`.
///
/// One attempt only: the next scheduler tick is the retry.
///
/// # Errors
///
/// - [`FetchError::Timeout`] - request exceeded `timeout`
/// - [`FetchError::Network`] - connection or TLS errors
/// - [`FetchError::HttpStatus`] - non-2xx response
/// - [`FetchError::ResponseTooLarge`] - body exceeded 16MB
/// - [`SchemaError::Malformed`] - body is not the expected JSON
pub async fn fetch_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<T, FeedError> {
    let response = tokio::time::timeout(timeout, client.get(url).send())
        .await
        .map_err(|_| FetchError::Timeout(timeout))?
        .map_err(FetchError::Network)?;

    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status().as_u16()).into());
    }

    let bytes = tokio::time::timeout(timeout, read_limited_bytes(response, MAX_FEED_SIZE))
        .await
        .map_err(|_| FetchError::Timeout(timeout))??;

    serde_json::from_slice(&bytes).map_err(|source| {
        SchemaError::Malformed {
            url: url.to_string(),
            source,
        }
        .into()
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
