//! Decoder backed by the `image` crate.

use tracing::trace;

use crate::domain::entities::Image;
use crate::domain::errors::LoadError;
use crate::domain::ports::ImageDecoder;

/// Decodes PNG, JPEG and WebP by sniffing the byte signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardDecoder;

impl ImageDecoder for StandardDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Image, LoadError> {
        if bytes.is_empty() {
            return Err(LoadError::decode("empty image data"));
        }
        let image = image::load_from_memory(bytes)
            .map_err(|e| LoadError::decode(format!("Failed to decode image: {e}")))?;
        trace!(
            width = image.width(),
            height = image.height(),
            "Decoded image"
        );
        Ok(image)
    }
}

/// Estimated in-memory size of a decoded image, used as its cache cost.
#[must_use]
pub fn decoded_cost(image: &Image) -> usize {
    image.as_bytes().len()
}

#[cfg(test)]
pub(crate) fn encode_png(width: u32, height: u32) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    Image::new_rgb8(width, height)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_png() {
        let image = StandardDecoder.decode(&encode_png(4, 3)).unwrap();
        assert_eq!((image.width(), image.height()), (4, 3));
        assert_eq!(decoded_cost(&image), 4 * 3 * 3);
    }

    #[test]
    fn test_rejects_garbage() {
        let err = StandardDecoder.decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, LoadError::Decode { .. }));
    }

    #[test]
    fn test_rejects_empty() {
        assert!(StandardDecoder.decode(&[]).is_err());
    }
}
