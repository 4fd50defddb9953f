use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, ImageResult, RgbImage};

/// Quality used when the caller has no configured preference.
pub const DEFAULT_QUALITY: u8 = 75;

/// Encode an RGB image as JPEG at `quality` (1–100).
pub fn encode(image: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(image)?;
    Ok(buf)
}

/// Decode JPEG bytes into an RGB image.
pub fn decode(bytes: &[u8]) -> ImageResult<RgbImage> {
    Ok(image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?.to_rgb8())
}
