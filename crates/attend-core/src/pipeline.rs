//! Photo bytes → single aligned face crop.

use crate::alignment::FaceCrop;
use crate::codec::{self, CodecError};
use crate::detector::{DetectorError, FaceDetector};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to read image: {0}")]
    Decode(#[from] CodecError),
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("multiple faces detected ({0}); upload a photo with a single face")]
    MultipleFaces(usize),
    #[error("face detection failed: {0}")]
    Detector(#[from] DetectorError),
}

/// Decode, detect and crop, enforcing the single-face policy.
///
/// Secondary detections smaller than `ambiguity_ratio` × the largest face are
/// treated as background and ignored.
#[derive(Clone)]
pub struct FacePipeline {
    detector: Arc<dyn FaceDetector>,
    ambiguity_ratio: f32,
    max_dimension: u32,
}

impl FacePipeline {
    pub fn new(detector: Arc<dyn FaceDetector>, ambiguity_ratio: f32, max_dimension: u32) -> Self {
        Self {
            detector,
            ambiguity_ratio,
            max_dimension,
        }
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    pub fn extract(&self, bytes: &[u8]) -> Result<FaceCrop, PipelineError> {
        let image = codec::decode(bytes, self.max_dimension)?;
        let faces = self.detector.detect(&image)?;

        let Some(primary) = faces.first() else {
            return Err(PipelineError::NoFaceDetected);
        };

        let cutoff = primary.area() * self.ambiguity_ratio;
        let competing = faces.iter().filter(|f| f.area() >= cutoff).count();
        if competing > 1 {
            tracing::debug!(faces = faces.len(), competing, "ambiguous photo rejected");
            return Err(PipelineError::MultipleFaces(competing));
        }
        if faces.len() > 1 {
            tracing::debug!(ignored = faces.len() - 1, "ignoring small background faces");
        }

        Ok(FaceCrop::from_detection(&image.gray, primary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::FACE_SIZE;
    use crate::skin::SkinRegionDetector;
    use crate::testing::{encode, face_photo, png_photo, FaceSpec};
    use image::ImageFormat;

    fn pipeline() -> FacePipeline {
        FacePipeline::new(Arc::new(SkinRegionDetector::default()), 0.25, 1024)
    }

    #[test]
    fn test_single_face() {
        let crop = pipeline().extract(&png_photo(&[FaceSpec::centred(80, 80, 2)])).unwrap();
        assert_eq!(crop.pixels.dimensions(), (FACE_SIZE, FACE_SIZE));
        assert!(crop.bbox.width > 60.0);
    }

    #[test]
    fn test_jpeg_accepted() {
        let rgb = face_photo(160, 160, &[FaceSpec::centred(80, 80, 4)]);
        assert!(pipeline().extract(&encode(&rgb, ImageFormat::Jpeg)).is_ok());
    }

    #[test]
    fn test_no_face() {
        let result = pipeline().extract(&png_photo(&[]));
        assert!(matches!(result, Err(PipelineError::NoFaceDetected)));
    }

    #[test]
    fn test_two_similar_faces_rejected() {
        let rgb = face_photo(
            320,
            160,
            &[FaceSpec::centred(80, 80, 1), FaceSpec::centred(240, 80, 2)],
        );
        let result = pipeline().extract(&encode(&rgb, ImageFormat::Png));
        assert!(matches!(result, Err(PipelineError::MultipleFaces(2))));
    }

    #[test]
    fn test_small_background_face_ignored() {
        let rgb = face_photo(
            320,
            240,
            &[
                FaceSpec { cx: 110, cy: 120, rx: 60, ry: 78, pattern: 3 },
                FaceSpec { cx: 270, cy: 50, rx: 24, ry: 32, pattern: 5 },
            ],
        );
        let crop = pipeline().extract(&encode(&rgb, ImageFormat::Png)).unwrap();
        assert!(crop.bbox.x < 160.0);
    }

    #[test]
    fn test_garbage_bytes() {
        let result = pipeline().extract(b"definitely not an image");
        assert!(matches!(result, Err(PipelineError::Decode(_))));
    }

    #[test]
    fn test_same_photo_same_crop() {
        let bytes = png_photo(&[FaceSpec::centred(80, 80, 7)]);
        let a = pipeline().extract(&bytes).unwrap();
        let b = pipeline().extract(&bytes).unwrap();
        assert_eq!(a.pixels, b.pixels);
    }
}
