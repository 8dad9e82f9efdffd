//! Face detection seam.
//!
//! Two detectors implement [`FaceDetector`]: the classical
//! [`SkinRegionDetector`](crate::skin::SkinRegionDetector), which needs no model
//! files, and the SCRFD ONNX detector (feature `onnx`), which also returns
//! five-point landmarks for alignment.

use crate::codec::DecodedImage;
use crate::types::BoundingBox;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector '{0}' is not available in this build")]
    Unavailable(String),
    #[cfg(feature = "onnx")]
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds face regions in a decoded photo.
///
/// Implementations return boxes in image pixel coordinates, largest area first.
pub trait FaceDetector: Send + Sync {
    /// Short name used in logs and the status endpoint.
    fn name(&self) -> &'static str;

    fn detect(&self, image: &DecodedImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Sort detections by area, largest first.
pub fn sort_by_area(boxes: &mut [BoundingBox]) {
    boxes.sort_by(|a, b| {
        b.area()
            .partial_cmp(&a.area())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Non-maximum suppression: keep the most confident box of every overlapping group.
pub fn suppress_overlaps(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x, y, width: w, height: h, confidence: conf, landmarks: None,
        }
    }

    #[test]
    fn test_suppress_overlapping() {
        let detections = vec![
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = suppress_overlaps(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_suppress_keeps_disjoint() {
        let detections = vec![
            make_bbox(0.0, 0.0, 10.0, 10.0, 0.9),
            make_bbox(50.0, 50.0, 10.0, 10.0, 0.8),
        ];
        assert_eq!(suppress_overlaps(detections, 0.4).len(), 2);
        assert!(suppress_overlaps(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_sort_by_area() {
        let mut boxes = vec![
            make_bbox(0.0, 0.0, 10.0, 10.0, 0.9),
            make_bbox(0.0, 0.0, 30.0, 30.0, 0.1),
            make_bbox(0.0, 0.0, 20.0, 20.0, 0.5),
        ];
        sort_by_area(&mut boxes);
        let widths: Vec<f32> = boxes.iter().map(|b| b.width).collect();
        assert_eq!(widths, vec![30.0, 20.0, 10.0]);
    }
}
