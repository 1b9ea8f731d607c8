use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageFormat};
use std::io::Cursor;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::CompressionParams;
use crate::utils::validation::normalize_mime;

/// Internal to the compressor. Every variant ends in a logged fallback to the original bytes.
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Unsupported image type: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to decode image: {0}")]
    Decode(image::ImageError),

    #[error("Failed to encode image: {0}")]
    Encode(image::ImageError),

    #[error("Compression task failed: {0}")]
    Task(String),
}

/// Result of the optional compression step
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub data: Bytes,
    pub compressed: bool,
}

impl CompressionOutcome {
    fn original(data: Bytes) -> Self {
        Self {
            data,
            compressed: false,
        }
    }
}

pub fn format_for_mime(mime_type: &str) -> Result<ImageFormat, CompressionError> {
    match normalize_mime(mime_type).as_str() {
        "image/jpeg" => Ok(ImageFormat::Jpeg),
        "image/png" => Ok(ImageFormat::Png),
        "image/gif" => Ok(ImageFormat::Gif),
        "image/webp" => Ok(ImageFormat::WebP),
        other => Err(CompressionError::UnsupportedFormat(other.to_string())),
    }
}

/// Stage 1: bytes to pixels
pub fn decode(data: &[u8], format: ImageFormat) -> Result<DynamicImage, CompressionError> {
    image::load_from_memory_with_format(data, format).map_err(CompressionError::Decode)
}

/// Stage 2: largest size that fits the bounding box while keeping the aspect ratio.
/// Never upscales.
pub fn compute_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 || (width <= max_width && height <= max_height) {
        return (width, height);
    }

    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let new_width = ((width as f64 * scale).round() as u32).clamp(1, max_width.max(1));
    let new_height = ((height as f64 * scale).round() as u32).clamp(1, max_height.max(1));
    (new_width, new_height)
}

/// Stage 3
pub fn resize(img: DynamicImage, width: u32, height: u32) -> DynamicImage {
    if img.width() == width && img.height() == height {
        return img;
    }
    img.resize_exact(width, height, FilterType::Lanczos3)
}

/// Stage 4: re-encode in the original format. Quality only applies to JPEG.
pub fn encode(img: &DynamicImage, format: ImageFormat, quality: f32) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::new();

    if format == ImageFormat::Jpeg {
        let rgb = img.to_rgb8();
        let quality = (quality * 100.0).round().clamp(1.0, 100.0) as u8;
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
            .map_err(CompressionError::Encode)?;
        return Ok(out);
    }

    // WebP and GIF have no 16-bit or float variants
    let img_8bit = match img.color() {
        ColorType::Rgba16 | ColorType::La16 | ColorType::Rgba32F => {
            DynamicImage::ImageRgba8(img.to_rgba8())
        }
        ColorType::Rgb16 | ColorType::L16 | ColorType::Rgb32F => DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img.clone(),
    };

    img_8bit
        .write_to(&mut Cursor::new(&mut out), format)
        .map_err(CompressionError::Encode)?;
    Ok(out)
}

/// decode -> compute_dimensions -> resize -> encode
pub fn compress(data: &[u8], mime_type: &str, params: &CompressionParams) -> Result<Vec<u8>, CompressionError> {
    let format = format_for_mime(mime_type)?;
    let img = decode(data, format)?;
    let (width, height) = compute_dimensions(img.width(), img.height(), params.max_width, params.max_height);
    debug!(
        "Compressing {}x{} -> {}x{} ({})",
        img.width(),
        img.height(),
        width,
        height,
        mime_type
    );
    let resized = resize(img, width, height);
    encode(&resized, format, params.quality)
}

/// Compresses inputs above the threshold, on the blocking pool.
///
/// Never fails: any error, or an output that is not smaller, falls back to the original bytes.
pub async fn maybe_compress(data: Bytes, mime_type: &str, params: CompressionParams) -> CompressionOutcome {
    if data.len() <= params.threshold {
        return CompressionOutcome::original(data);
    }

    let input = data.clone();
    let mime = mime_type.to_string();
    let result = tokio::task::spawn_blocking(move || compress(&input, &mime, &params))
        .await
        .map_err(|e| CompressionError::Task(e.to_string()))
        .and_then(|r| r);

    match result {
        Ok(out) if out.len() < data.len() => {
            debug!("🗜️  Compressed {} -> {} bytes", data.len(), out.len());
            CompressionOutcome {
                data: Bytes::from(out),
                compressed: true,
            }
        }
        Ok(out) => {
            warn!(
                "⚠️  Compression did not shrink {} ({} -> {} bytes), uploading original",
                mime_type,
                data.len(),
                out.len()
            );
            CompressionOutcome::original(data)
        }
        Err(e) => {
            warn!("⚠️  Compression failed, uploading original: {}", e);
            CompressionOutcome::original(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        DynamicImage::ImageRgb8(img)
    }

    fn params(threshold: usize, max_width: u32, max_height: u32) -> CompressionParams {
        CompressionParams {
            threshold,
            max_width,
            max_height,
            quality: 0.85,
        }
    }

    #[test]
    fn test_compute_dimensions() {
        assert_eq!(compute_dimensions(4000, 3000, 1920, 1080), (1440, 1080));
        assert_eq!(compute_dimensions(3000, 1000, 1920, 1080), (1920, 640));
        assert_eq!(compute_dimensions(800, 600, 1920, 1080), (800, 600));
        assert_eq!(compute_dimensions(1920, 1080, 1920, 1080), (1920, 1080));
        assert_eq!(compute_dimensions(10000, 1, 100, 100), (100, 1));
    }

    #[test]
    fn test_format_for_mime() {
        assert_eq!(format_for_mime("image/jpg").unwrap(), ImageFormat::Jpeg);
        assert_eq!(format_for_mime("image/webp").unwrap(), ImageFormat::WebP);
        assert!(matches!(
            format_for_mime("image/svg+xml"),
            Err(CompressionError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_compress_png_pipeline() {
        let png = encode(&gradient(64, 48), ImageFormat::Png, 0.85).unwrap();
        let out = compress(&png, "image/png", &params(0, 32, 32)).unwrap();

        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn test_compress_jpeg_keeps_format() {
        let jpeg = encode(&gradient(200, 100), ImageFormat::Jpeg, 1.0).unwrap();
        let out = compress(&jpeg, "image/jpeg", &params(0, 100, 100)).unwrap();

        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 50));
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
    }

    #[tokio::test]
    async fn test_below_threshold_untouched() {
        let data = Bytes::from_static(b"tiny");
        let outcome = maybe_compress(data.clone(), "image/png", params(1024, 10, 10)).await;
        assert!(!outcome.compressed);
        assert_eq!(outcome.data, data);
    }

    #[tokio::test]
    async fn test_corrupt_input_falls_back() {
        let data = Bytes::from(vec![0xAB; 4096]);
        let outcome = maybe_compress(data.clone(), "image/png", params(1024, 10, 10)).await;
        assert!(!outcome.compressed);
        assert_eq!(outcome.data, data);
    }
}
