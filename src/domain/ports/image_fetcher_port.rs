//! Port for fetching raw image bytes from an external source.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::entities::ImageId;
use crate::domain::errors::LoadError;

/// Transport that turns an identifier into raw bytes.
///
/// Called from inside a scheduler job. Dropping the returned future is how a
/// running fetch gets interrupted.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetches the bytes named by `id`.
    async fn fetch(&self, id: &ImageId) -> Result<Bytes, LoadError>;
}
