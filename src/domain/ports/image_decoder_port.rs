//! Port for decoding raw bytes into an image.

use crate::domain::entities::Image;
use crate::domain::errors::LoadError;

/// Turns encoded bytes into a displayable image.
/// Runs on the blocking pool; implementations may be CPU heavy.
pub trait ImageDecoder: Send + Sync {
    /// Decodes `bytes`, failing with [`LoadError::Decode`] if they are not an image.
    fn decode(&self, bytes: &[u8]) -> Result<Image, LoadError>;
}
