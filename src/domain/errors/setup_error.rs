//! Loader construction errors.

use thiserror::Error;

/// Errors raised while building a loader or its collaborators.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum SetupError {
    #[error("no tokio runtime available to run image loads")]
    NoRuntime,

    #[error("failed to create HTTP client: {message}")]
    HttpClient { message: String },
}

impl SetupError {
    /// Creates HTTP client error.
    #[must_use]
    pub fn http_client(message: impl Into<String>) -> Self {
        Self::HttpClient {
            message: message.into(),
        }
    }
}
