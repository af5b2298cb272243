//! Data-URI image transport: `data:image/<fmt>;base64,<body>` ⇄ 8-bit RGB buffers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use thiserror::Error;

const DATA_URI_PREFIX: &str = "data:image";
const JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid image data")]
    MissingHeader,
    #[error("Image processing failed: {0}")]
    InvalidImage(String),
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Split a data URI into its MIME type and decoded bytes without decoding pixels.
pub fn payload_bytes(payload: &str) -> Result<(String, Vec<u8>), CodecError> {
    let payload = payload.trim();
    if !payload.starts_with(DATA_URI_PREFIX) {
        return Err(CodecError::MissingHeader);
    }
    let (header, body) = payload
        .split_once(',')
        .ok_or_else(|| CodecError::InvalidImage("missing ',' after data URI header".into()))?;

    let content_type = header
        .trim_start_matches("data:")
        .split(';')
        .next()
        .filter(|m| m.starts_with("image/") && m.len() > "image/".len())
        .unwrap_or("image/jpeg")
        .to_string();

    let bytes = STANDARD
        .decode(body.trim())
        .map_err(|e| CodecError::InvalidImage(format!("base64: {e}")))?;

    Ok((content_type, bytes))
}

/// Decode a data-URI payload into an 8-bit RGB buffer.
pub fn decode_data_uri(payload: &str) -> Result<RgbImage, CodecError> {
    let (_, bytes) = payload_bytes(payload)?;
    decode_bytes(&bytes)
}

/// Decode encoded image bytes (any format `image` understands) into 8-bit RGB.
pub fn decode_bytes(bytes: &[u8]) -> Result<RgbImage, CodecError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| CodecError::InvalidImage(e.to_string()))?;
    let (width, height) = (decoded.width(), decoded.height());
    if width == 0 || height == 0 {
        return Err(CodecError::InvalidImage("image has zero size".into()));
    }
    tracing::debug!(width, height, color = ?decoded.color(), "decoded image payload");
    Ok(normalize(decoded))
}

/// Collapse any channel layout and bit depth to 3-channel 8-bit RGB.
///
/// Grayscale is replicated, alpha dropped, 16-bit scaled down and float
/// images mapped from [0, 1].
pub fn normalize(image: DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => other.to_rgb8(),
    }
}

/// Encode an RGB buffer as a JPEG data URI.
pub fn encode_data_uri(image: &RgbImage) -> Result<String, CodecError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(image)?;
    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(&buf)))
}

/// Wrap already-encoded image bytes as a data URI, sniffing the MIME type.
pub fn to_data_uri(bytes: &[u8]) -> Result<String, CodecError> {
    let format = image::guess_format(bytes).map_err(|e| CodecError::InvalidImage(e.to_string()))?;
    Ok(format!(
        "data:{};base64,{}",
        format.to_mime_type(),
        STANDARD.encode(bytes)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageBuffer, ImageFormat, Luma, Rgb, Rgba, RgbaImage};
    use std::io::Cursor;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 4) as u8, (y * 5) as u8, 128])
        })
    }

    fn png_data_uri(image: &DynamicImage) -> String {
        let mut buf = Vec::new();
        image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        format!("data:image/png;base64,{}", STANDARD.encode(&buf))
    }

    #[test]
    fn test_roundtrip_preserves_dimensions_and_content() {
        let original = gradient(64, 48);
        let uri = encode_data_uri(&original).unwrap();
        assert!(uri.starts_with("data:image/jpeg;base64,"));

        let decoded = decode_data_uri(&uri).unwrap();
        assert_eq!(decoded.dimensions(), original.dimensions());

        let total: u64 = original
            .as_raw()
            .iter()
            .zip(decoded.as_raw())
            .map(|(a, b)| (*a as i32 - *b as i32).unsigned_abs() as u64)
            .sum();
        let mean = total as f64 / original.as_raw().len() as f64;
        assert!(mean < 6.0, "mean abs error too high for lossy roundtrip: {mean}");
    }

    #[test]
    fn test_rejects_missing_header() {
        let err = decode_data_uri("aGVsbG8=").unwrap_err();
        assert!(matches!(err, CodecError::MissingHeader));
        assert_eq!(err.to_string(), "Invalid image data");
    }

    #[test]
    fn test_rejects_missing_comma() {
        let err = decode_data_uri("data:image/png;base64").unwrap_err();
        assert!(matches!(err, CodecError::InvalidImage(_)));
    }

    #[test]
    fn test_rejects_bad_base64() {
        let err = decode_data_uri("data:image/png;base64,@@@not-base64@@@").unwrap_err();
        assert!(matches!(err, CodecError::InvalidImage(_)));
    }

    #[test]
    fn test_rejects_non_image_bytes() {
        let uri = format!("data:image/png;base64,{}", STANDARD.encode(b"definitely not a png"));
        assert!(matches!(decode_data_uri(&uri), Err(CodecError::InvalidImage(_))));
    }

    #[test]
    fn test_grayscale_becomes_rgb() {
        let gray = GrayImage::from_pixel(8, 6, Luma([77]));
        let rgb = decode_data_uri(&png_data_uri(&DynamicImage::ImageLuma8(gray))).unwrap();
        assert_eq!(rgb.dimensions(), (8, 6));
        assert_eq!(rgb.get_pixel(3, 3), &Rgb([77, 77, 77]));
    }

    #[test]
    fn test_sixteen_bit_becomes_eight_bit() {
        let deep: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_pixel(4, 4, Luma([u16::MAX]));
        let rgb = decode_data_uri(&png_data_uri(&DynamicImage::ImageLuma16(deep))).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_alpha_is_dropped() {
        let rgba = RgbaImage::from_pixel(5, 5, Rgba([10, 20, 30, 0]));
        let rgb = decode_data_uri(&png_data_uri(&DynamicImage::ImageRgba8(rgba))).unwrap();
        assert_eq!(rgb.get_pixel(2, 2), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_payload_bytes_content_type() {
        let uri = png_data_uri(&DynamicImage::ImageRgb8(gradient(4, 4)));
        let (mime, bytes) = payload_bytes(&uri).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn test_to_data_uri_sniffs_format() {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(gradient(4, 4))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        let uri = to_data_uri(&buf).unwrap();
        assert!(uri.starts_with("data:image/png;base64,"));
        assert_eq!(decode_data_uri(&uri).unwrap().dimensions(), (4, 4));
    }
}
