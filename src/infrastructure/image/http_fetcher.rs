//! HTTP(S) transport for external images.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::domain::entities::ImageId;
use crate::domain::errors::{LoadError, SetupError};
use crate::domain::ports::ImageFetcher;

/// Default connect timeout for new connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches `http://` and `https://` identifiers with `reqwest`.
///
/// Overall load deadlines are enforced by the scheduler, so the client only
/// bounds connection setup.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Creates a fetcher with the default connect timeout.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new() -> Result<Self, SetupError> {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Creates a fetcher with a custom connect timeout.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, SetupError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("asyncimage/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SetupError::http_client(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn is_http(id: &ImageId) -> bool {
    let raw = id.as_str();
    raw.starts_with("http://") || raw.starts_with("https://")
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, id: &ImageId) -> Result<Bytes, LoadError> {
        if !is_http(id) {
            return Err(LoadError::transport(format!(
                "Unsupported identifier scheme: {id}"
            )));
        }

        debug!(id = %id, "Downloading image from network");

        let response = self
            .client
            .get(id.as_str())
            .send()
            .await
            .map_err(|e| LoadError::transport(format!("Request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(LoadError::not_found(id.as_str()));
        }
        if !status.is_success() {
            return Err(LoadError::transport(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| LoadError::transport(format!("Failed to read body: {e}")))
    }
}
