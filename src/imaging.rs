//! PNG capture to JPEG upload payload.

use std::io::Cursor;

use image::{codecs::jpeg::JpegEncoder, DynamicImage, ImageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("capture could not be decoded: {0}")]
    Decode(#[source] ImageError),
    #[error("jpeg encoding failed: {0}")]
    Encode(#[source] ImageError),
}

pub fn decode_capture(bytes: &[u8]) -> Result<DynamicImage, ConversionError> {
    image::load_from_memory(bytes).map_err(ConversionError::Decode)
}

/// Alpha is dropped, not composited: JPEG has no transparency channel.
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, ConversionError> {
    let rgb = image.to_rgb8();
    let mut out = Cursor::new(Vec::with_capacity(rgb.as_raw().len() / 8));
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode_image(&rgb)
        .map_err(ConversionError::Encode)?;
    Ok(out.into_inner())
}

pub fn convert_to_jpeg(bytes: &[u8], quality: u8) -> Result<Vec<u8>, ConversionError> {
    encode_jpeg(&decode_capture(bytes)?, quality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};

    fn png_with_alpha() -> Vec<u8> {
        let mut image = RgbaImage::new(48, 32);
        for (x, _, pixel) in image.enumerate_pixels_mut() {
            *pixel = Rgba([(x * 5) as u8, 90, 200, if x % 2 == 0 { 0 } else { 255 }]);
        }
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn rgba_png_becomes_jpeg_with_same_dimensions() {
        let jpeg = convert_to_jpeg(&png_with_alpha(), 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (48, 32));
        assert!(!decoded.color().has_alpha());
    }

    #[test]
    fn lower_quality_produces_smaller_output() {
        let mut image = RgbaImage::new(128, 128);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            *pixel = Rgba([(x * 7 ^ y * 3) as u8, (x * y) as u8, (y * 11) as u8, 255]);
        }
        let image = DynamicImage::ImageRgba8(image);
        let high = encode_jpeg(&image, 95).unwrap();
        let low = encode_jpeg(&image, 10).unwrap();
        assert!(low.len() < high.len());
    }

    #[test]
    fn corrupt_input_is_a_decode_error() {
        let mut png = png_with_alpha();
        png.truncate(40);
        assert!(matches!(
            convert_to_jpeg(&png, 85),
            Err(ConversionError::Decode(_))
        ));
        assert!(matches!(
            convert_to_jpeg(b"not an image", 85),
            Err(ConversionError::Decode(_))
        ));
    }
}
