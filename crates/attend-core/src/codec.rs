//! Decoding of uploaded photos into RGB and luma buffers.
//!
//! Only JPEG and PNG are accepted. The format is sniffed from the bytes, never
//! taken from the upload's file name.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("image upload is empty")]
    Empty,
    #[error("unsupported image format: {0} (expected JPEG or PNG)")]
    UnsupportedFormat(String),
    #[error("corrupt image data: {0}")]
    Decode(#[from] image::ImageError),
}

/// A decoded photo, possibly downscaled.
pub struct DecodedImage {
    pub rgb: RgbImage,
    pub gray: GrayImage,
    /// Dimensions before any downscaling.
    pub original_width: u32,
    pub original_height: u32,
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }
}

/// Decode JPEG or PNG bytes.
///
/// Images larger than `max_dimension` on either side are shrunk to fit,
/// preserving aspect ratio. A `max_dimension` of 0 disables the limit.
pub fn decode(bytes: &[u8], max_dimension: u32) -> Result<DecodedImage, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }

    let format = image::guess_format(bytes)
        .map_err(|_| CodecError::UnsupportedFormat("unrecognized".into()))?;
    match format {
        ImageFormat::Jpeg | ImageFormat::Png => {}
        other => return Err(CodecError::UnsupportedFormat(format!("{other:?}"))),
    }

    let image = image::load_from_memory_with_format(bytes, format)?;
    let (original_width, original_height) = (image.width(), image.height());

    let image = if max_dimension > 0
        && (original_width > max_dimension || original_height > max_dimension)
    {
        let resized = image.resize(max_dimension, max_dimension, FilterType::Triangle);
        tracing::debug!(
            from = ?(original_width, original_height),
            to = ?(resized.width(), resized.height()),
            "downscaled upload"
        );
        resized
    } else {
        image
    };

    Ok(DecodedImage {
        rgb: image.to_rgb8(),
        gray: image.to_luma8(),
        original_width,
        original_height,
    })
}

/// Encode a grayscale buffer as PNG.
pub fn encode_gray_png(gray: &GrayImage) -> Result<Vec<u8>, CodecError> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(gray.clone()).write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Decode PNG bytes previously produced by [`encode_gray_png`].
pub fn decode_gray_png(bytes: &[u8]) -> Result<GrayImage, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    let image = image::load_from_memory_with_format(bytes, ImageFormat::Png)?;
    Ok(image.to_luma8())
}
