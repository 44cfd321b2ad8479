//! Domain types for image resources and load results.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use url::Url;

use super::target::TargetId;
use crate::domain::errors::LoadError;

/// Decoded image payload. Immutable once produced.
pub type Image = image::DynamicImage;

/// Identifier of an image resource, local or remote.
/// Equality is by value; used as both cache key and request key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(String);

const FILE_SCHEME: &str = "file://";

impl ImageId {
    /// Creates a new `ImageId` from any string-like input.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a local-file identifier for `path`.
    ///
    /// Absolute paths become percent-encoded `file://` URLs.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Url::from_file_path(path).map_or_else(
            |()| Self(format!("{FILE_SCHEME}{}", path.display())),
            |url| Self(url.into()),
        )
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the identifier is empty or whitespace only.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Returns the filesystem path this identifier names, if it is local.
    ///
    /// `file://` identifiers and bare absolute paths are local; anything
    /// carrying another scheme is not. `file://` URLs are percent-decoded
    /// and may name `localhost` as their host.
    #[must_use]
    pub fn local_path(&self) -> Option<PathBuf> {
        if let Some(rest) = self.0.strip_prefix(FILE_SCHEME) {
            if rest.is_empty() {
                return None;
            }
            return Url::parse(&self.0).ok()?.to_file_path().ok();
        }
        if self.0.contains("://") {
            return None;
        }
        let path = Path::new(&self.0);
        path.is_absolute().then(|| path.to_path_buf())
    }

    /// Returns true if the identifier resolves to the local filesystem.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.local_path().is_some()
    }

    /// Stable hex digest of the identifier, usable as a file name.
    #[must_use]
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16])
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ImageId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&ImageId> for ImageId {
    fn from(id: &ImageId) -> Self {
        id.clone()
    }
}

/// Where a load was satisfied from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadLocation {
    /// Not loaded. Reported with every failure.
    #[default]
    None,
    /// Loaded from the in-memory image cache.
    Cache,
    /// Read from a file on local disk.
    LocalFile,
    /// Fetched from an external source.
    ExternalFile,
}

impl std::fmt::Display for LoadLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Cache => write!(f, "cache"),
            Self::LocalFile => write!(f, "local"),
            Self::ExternalFile => write!(f, "external"),
        }
    }
}

/// A successfully resolved image and the tier that produced it.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// Tier that satisfied the load.
    pub location: LoadLocation,
    /// The decoded image.
    pub image: Arc<Image>,
}

/// Result of one load, as delivered to one consumer.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    /// The requested identifier.
    pub id: ImageId,
    /// Tier that satisfied the load, `None` on failure.
    pub location: LoadLocation,
    /// The image, or why there is none.
    pub result: Result<Arc<Image>, LoadError>,
    /// Target the consumer registered with, if any.
    pub target: Option<TargetId>,
}

impl LoadOutcome {
    pub(crate) fn resolved(
        id: ImageId,
        resolution: &Result<ResolvedImage, LoadError>,
        target: Option<TargetId>,
    ) -> Self {
        match resolution {
            Ok(resolved) => Self {
                id,
                location: resolved.location,
                result: Ok(resolved.image.clone()),
                target,
            },
            Err(error) => Self::failure(id, error.clone(), target),
        }
    }

    pub(crate) fn failure(id: ImageId, error: LoadError, target: Option<TargetId>) -> Self {
        Self {
            id,
            location: LoadLocation::None,
            result: Err(error),
            target,
        }
    }

    /// Returns true if an image was produced.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Returns the image if the load succeeded.
    #[must_use]
    pub fn image(&self) -> Option<&Arc<Image>> {
        self.result.as_ref().ok()
    }

    /// Returns the error if the load failed.
    #[must_use]
    pub fn error(&self) -> Option<&LoadError> {
        self.result.as_ref().err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("file:///tmp/a.png", Some("/tmp/a.png") ; "file_scheme")]
    #[test_case("/var/images/b.jpg", Some("/var/images/b.jpg") ; "absolute_path")]
    #[test_case("https://example.com/c.png", None ; "http_url")]
    #[test_case("img://a", None ; "custom_scheme")]
    #[test_case("relative/d.png", None ; "relative_path")]
    #[test_case("file://", None ; "empty_file_url")]
    #[test_case("file:///tmp/a%20b.png", Some("/tmp/a b.png") ; "percent_encoded")]
    #[test_case("file://localhost/tmp/c.png", Some("/tmp/c.png") ; "localhost_host")]
    #[test_case("file://server/share/d.png", None ; "remote_host")]
    fn test_local_path(raw: &str, expected: Option<&str>) {
        let id = ImageId::new(raw);
        assert_eq!(id.local_path(), expected.map(PathBuf::from));
        assert_eq!(id.is_local(), expected.is_some());
    }

    #[test]
    fn test_from_path_round_trips_to_local_path() {
        let id = ImageId::from_path("/tmp/cache/e.png");
        assert_eq!(id.as_str(), "file:///tmp/cache/e.png");
        assert_eq!(id.local_path(), Some(PathBuf::from("/tmp/cache/e.png")));
    }

    #[test]
    fn test_from_path_encodes_special_characters() {
        let id = ImageId::from_path("/tmp/my images/f#1.png");
        assert_eq!(id.as_str(), "file:///tmp/my%20images/f%231.png");
        assert_eq!(id.local_path(), Some(PathBuf::from("/tmp/my images/f#1.png")));
    }

    #[test]
    fn test_empty_identifier() {
        assert!(ImageId::new("").is_empty());
        assert!(ImageId::new("   ").is_empty());
        assert!(!ImageId::new("img://a").is_empty());
    }

    #[test]
    fn test_digest_is_stable() {
        let a = ImageId::new("https://example.com/image.png");
        let b = ImageId::new("https://example.com/image.png");
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 32);
        assert_ne!(a.digest(), ImageId::new("img://other").digest());
    }

    #[test]
    fn test_failure_outcome_reports_no_location() {
        let outcome = LoadOutcome::failure(ImageId::new("img://x"), LoadError::Cancelled, None);
        assert!(!outcome.is_success());
        assert_eq!(outcome.location, LoadLocation::None);
        assert!(outcome.image().is_none());
    }
}
