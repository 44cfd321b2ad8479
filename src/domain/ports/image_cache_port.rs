//! Port definition for image caching.

use std::sync::Arc;

use crate::domain::entities::{Image, ImageId};

/// In-memory store of decoded images.
///
/// Implementations must be thread-safe and must not block for long: the
/// loader consults the cache synchronously on the caller's thread.
pub trait ImageCachePort: Send + Sync {
    /// Returns the cached image for `id`, if present.
    fn get(&self, id: &ImageId) -> Option<Arc<Image>>;

    /// Stores an image with an eviction cost.
    fn set(&self, id: ImageId, image: Arc<Image>, cost: usize);

    /// Removes one image.
    fn remove(&self, id: &ImageId);

    /// Removes every image.
    fn remove_all(&self);

    /// Returns the current number of cached images.
    fn len(&self) -> usize;

    /// Returns true if the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
