//! Filesystem-backed byte store for local images and persisted downloads.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, trace};

use crate::domain::errors::LoadError;
use crate::domain::ports::DiskStorePort;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "linuxmobile";
const APP_NAME: &str = "asyncimage";

/// Reads and writes image bytes at arbitrary filesystem paths.
///
/// Writes go to a temporary file in the destination directory and are
/// renamed into place, so readers never observe a partial image.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileDiskStore;

impl FileDiskStore {
    /// Creates a new store.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DiskStorePort for FileDiskStore {
    async fn exists(&self, path: &Path) -> bool {
        fs::metadata(path).await.is_ok_and(|m| m.is_file())
    }

    async fn read(&self, path: &Path) -> Result<Bytes, LoadError> {
        match fs::read(path).await {
            Ok(bytes) => {
                trace!(path = %path.display(), size = bytes.len(), "Read image from disk");
                Ok(Bytes::from(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LoadError::not_found(path.display().to_string()))
            }
            Err(e) => Err(LoadError::io(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), LoadError> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| LoadError::io(format!("Failed to create {}: {e}", parent.display())))?;

        let target = path.to_path_buf();
        let data = bytes.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), LoadError> {
            let mut temp_file = tempfile::NamedTempFile::new_in(&parent)
                .map_err(|e| LoadError::io(format!("Failed to create temp file: {e}")))?;
            temp_file
                .write_all(&data)
                .map_err(|e| LoadError::io(format!("Failed to write temp file: {e}")))?;
            temp_file
                .persist(&target)
                .map_err(|e| LoadError::io(format!("Failed to persist image: {}", e.error)))?;
            Ok(())
        })
        .await
        .map_err(|e| LoadError::worker(format!("Disk write task failed: {e}")))??;

        debug!(path = %path.display(), size = bytes.len(), "Stored image on disk");
        Ok(())
    }
}

/// Returns the default directory for cached image files.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME).map_or_else(
        || std::env::temp_dir().join(APP_NAME).join("cache"),
        |dirs| dirs.cache_dir().to_path_buf(),
    )
}

/// Returns the default directory for user documents.
#[must_use]
pub fn default_document_dir() -> PathBuf {
    directories::ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME).map_or_else(
        || std::env::temp_dir().join(APP_NAME).join("documents"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}
