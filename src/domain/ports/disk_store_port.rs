//! Port for reading and persisting image bytes on disk.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::errors::LoadError;

/// Byte storage addressed by filesystem paths.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiskStorePort: Send + Sync {
    /// Returns true if a file exists at `path`.
    async fn exists(&self, path: &Path) -> bool;

    /// Reads the whole file at `path`.
    async fn read(&self, path: &Path) -> Result<Bytes, LoadError>;

    /// Writes `bytes` to `path`, replacing any previous content.
    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), LoadError>;
}
