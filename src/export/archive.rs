//! Remote archive the daily CSV files are pushed to.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("gbfs-recorder/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Network-level error, including client timeouts
    #[error("Archive request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Archive answered with a non-success status
    #[error("Archive rejected upload: status {status}: {message}")]
    HttpStatus { status: u16, message: String },
}

/// Destination for exported files.
///
/// `put_file` creates `path` or overwrites it if it already exists.
/// `content` is the base64-encoded file body.
pub trait ArchiveClient: Send + Sync {
    fn put_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        message: &str,
        content: String,
    ) -> impl Future<Output = Result<(), ArchiveError>> + Send;
}

/// GitHub connection settings
#[derive(Debug)]
pub struct GitHubConfig {
    /// API token; anonymous requests cannot write
    pub token: Option<SecretString>,
    /// API base URL (default: https://api.github.com)
    pub api_url: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: "https://api.github.com".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Commits files through the GitHub repository contents API.
pub struct GitHubArchive {
    client: reqwest::Client,
    api_url: String,
    token: Option<SecretString>,
}

#[derive(Deserialize)]
struct ContentsEntry {
    sha: String,
}

#[derive(Serialize)]
struct PutContents<'a> {
    message: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

impl GitHubArchive {
    /// # Errors
    ///
    /// Returns error if HTTP client creation fails (e.g., TLS misconfiguration)
    pub fn new(config: GitHubConfig) -> Result<Self, ArchiveError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    fn contents_url(&self, owner: &str, repo: &str, path: &str) -> String {
        format!("{}/repos/{}/{}/contents/{}", self.api_url, owner, repo, path)
    }

    /// Attach auth and API version headers
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    /// Blob sha of the file currently at `path`, if any. GitHub requires it
    /// to overwrite an existing file.
    async fn existing_sha(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<Option<String>, ArchiveError> {
        let url = self.contents_url(owner, repo, path);
        let response = self.authorize(self.client.get(&url)).send().await?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let entry: ContentsEntry = response.json().await?;
                Ok(Some(entry.sha))
            }
            _ => Err(status_error(response).await),
        }
    }
}

impl ArchiveClient for GitHubArchive {
    async fn put_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        message: &str,
        content: String,
    ) -> Result<(), ArchiveError> {
        let sha = self.existing_sha(owner, repo, path).await?;
        let replacing = sha.is_some();

        let body = PutContents {
            message,
            content: &content,
            sha,
        };
        let url = self.contents_url(owner, repo, path);
        let response = self
            .authorize(self.client.put(&url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        tracing::debug!(
            owner = %owner,
            repo = %repo,
            path = %path,
            replaced = replacing,
            "File committed to archive"
        );
        Ok(())
    }
}

async fn status_error(response: reqwest::Response) -> ArchiveError {
    #[derive(Deserialize)]
    struct GitHubMessage {
        message: String,
    }

    let status = response.status().as_u16();
    let message = match response.text().await {
        Ok(text) => serde_json::from_str::<GitHubMessage>(&text)
            .map(|m| m.message)
            .unwrap_or(text),
        Err(e) => e.to_string(),
    };
    ArchiveError::HttpStatus { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FILE: &str = "dataset/stations_statuses/01-01-2024.csv";
    const CONTENTS_PATH: &str =
        "/repos/owner/dataset/contents/dataset/stations_statuses/01-01-2024.csv";

    fn archive(server: &MockServer) -> GitHubArchive {
        GitHubArchive::new(GitHubConfig {
            token: Some(SecretString::from("test-token".to_string())),
            api_url: server.uri(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_put_creates_new_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CONTENTS_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(CONTENTS_PATH))
            .and(header("authorization", "Bearer test-token"))
            .and(body_partial_json(json!({
                "message": "chore: add dataset/stations_statuses/01-01-2024.csv",
                "content": "YQ=="
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        archive(&server)
            .put_file(
                "owner",
                "dataset",
                FILE,
                "chore: add dataset/stations_statuses/01-01-2024.csv",
                "YQ==".to_string(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_overwrites_existing_file_with_sha() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CONTENTS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sha": "abc123"})))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(CONTENTS_PATH))
            .and(body_partial_json(json!({"sha": "abc123"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        archive(&server)
            .put_file("owner", "dataset", FILE, "msg", "YQ==".to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_rejected_reports_github_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_json(json!({"message": "Invalid request."})),
            )
            .expect(1) // Single attempt, no retry
            .mount(&server)
            .await;

        let err = archive(&server)
            .put_file("owner", "dataset", FILE, "msg", "YQ==".to_string())
            .await
            .unwrap_err();

        match err {
            ArchiveError::HttpStatus { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "Invalid request.");
            }
            e => panic!("Expected HttpStatus, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_sha_lookup_failure_aborts_upload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let err = archive(&server)
            .put_file("owner", "dataset", FILE, "msg", "YQ==".to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::HttpStatus { status: 401, .. }));
    }
}
