//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides with five-point landmarks, followed by
//! non-maximum suppression. Input photos are letterboxed into a 640×640 RGB tensor.

use crate::codec::DecodedImage;
use crate::detector::{sort_by_area, suppress_overlaps, DetectorError, FaceDetector};
use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

// --- Named constants ---
const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Mapping from letterboxed tensor coordinates back to image coordinates.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    offset_x: f32,
    offset_y: f32,
}

impl Letterbox {
    fn to_image(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.offset_x) / self.scale, (y - self.offset_y) / self.scale)
    }
}

/// Output tensor positions (score, bbox, kps) for one stride.
type StrideSlots = (usize, usize, usize);

/// Raw network outputs for one stride level.
struct StrideOutputs<'a> {
    stride: usize,
    scores: &'a [f32],
    boxes: &'a [f32],
    keypoints: &'a [f32],
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    /// `Session::run` needs `&mut`, so concurrent requests take turns.
    session: Mutex<Session>,
    slots: [StrideSlots; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps for 3 strides), model has {}",
                output_names.len()
            )));
        }

        let slots = output_slots(&output_names);
        tracing::info!(path = %model_path.display(), outputs = ?output_names, ?slots, "loaded SCRFD model");

        Ok(Self {
            session: Mutex::new(session),
            slots,
        })
    }
}

impl FaceDetector for ScrfdDetector {
    fn name(&self) -> &'static str {
        "scrfd"
    }

    fn detect(&self, image: &DecodedImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = letterbox_tensor(&image.rgb);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("SCRFD session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_slot, bbox_slot, kps_slot) = self.slots[level];
            let extract = |slot: usize, what: &'static str| {
                outputs[slot]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };

            let level_outputs = StrideOutputs {
                stride,
                scores: extract(score_slot, "scores")?,
                boxes: extract(bbox_slot, "boxes")?,
                keypoints: extract(kps_slot, "keypoints")?,
            };
            candidates.extend(decode_level(&level_outputs, &letterbox, SCRFD_SCORE_THRESHOLD));
        }

        let mut faces = suppress_overlaps(candidates, SCRFD_NMS_THRESHOLD);
        sort_by_area(&mut faces);
        Ok(faces)
    }
}

/// Letterbox an RGB photo into a normalised 1×3×640×640 tensor.
///
/// Padding is left at zero, which is what the mean pixel normalises to.
fn letterbox_tensor(rgb: &RgbImage) -> (Array4<f32>, Letterbox) {
    let size = SCRFD_INPUT_SIZE;
    let (width, height) = rgb.dimensions();
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let offset_x = (size - new_w) / 2;
    let offset_y = (size - new_h) / 2;

    let resized = image::imageops::resize(rgb, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + offset_x) as usize;
        let ty = (y + offset_y) as usize;
        for channel in 0..3 {
            tensor[[0, channel, ty, tx]] = (pixel[channel] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    let letterbox = Letterbox {
        scale,
        offset_x: offset_x as f32,
        offset_y: offset_y as f32,
    };
    (tensor, letterbox)
}

/// Locate the score/bbox/kps tensors of each stride.
///
/// Exports either name them `score_8`, `bbox_16`, ... or use opaque numeric
/// names, in which case the conventional order applies: scores 0-2, boxes 3-5,
/// keypoints 6-8.
fn output_slots(names: &[String]) -> [StrideSlots; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut slots = [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
    for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (position("score", stride), position("bbox", stride), position("kps", stride)) {
            (Some(s), Some(b), Some(k)) => slots[level] = (s, b, k),
            _ => {
                tracing::debug!(?names, "SCRFD output names not recognised, using positional order");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    slots
}

/// Turn one stride's anchors into boxes in image coordinates.
fn decode_level(level: &StrideOutputs<'_>, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
    let stride = level.stride;
    let cells_per_row = SCRFD_INPUT_SIZE as usize / stride;
    let rows = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = rows * cells_per_row * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|anchor| {
            let score = *level.scores.get(anchor)?;
            if score <= threshold {
                return None;
            }

            let cell = anchor / SCRFD_ANCHORS_PER_CELL;
            let centre_x = (cell % cells_per_row) as f32 * step;
            let centre_y = (cell / cells_per_row) as f32 * step;

            let offsets = level.boxes.get(anchor * 4..anchor * 4 + 4)?;
            let (x1, y1) = letterbox.to_image(centre_x - offsets[0] * step, centre_y - offsets[1] * step);
            let (x2, y2) = letterbox.to_image(centre_x + offsets[2] * step, centre_y + offsets[3] * step);

            let landmarks = level.keypoints.get(anchor * 10..anchor * 10 + 10).map(|kps| {
                std::array::from_fn(|i| {
                    letterbox.to_image(centre_x + kps[i * 2] * step, centre_y + kps[i * 2 + 1] * step)
                })
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_load_missing_model() {
        let result = ScrfdDetector::load(Path::new("/nonexistent/det_10g.onnx"));
        assert!(matches!(result, Err(DetectorError::ModelNotFound(_))));
    }

    #[test]
    fn test_letterbox_tensor_shape_and_padding() {
        let rgb = RgbImage::from_pixel(320, 160, Rgb([255, 255, 255]));
        let (tensor, letterbox) = letterbox_tensor(&rgb);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((letterbox.scale - 2.0).abs() < 1e-6);
        assert_eq!(letterbox.offset_x, 0.0);
        assert_eq!(letterbox.offset_y, 160.0);

        // Padding rows stay at the normalised mean, image rows carry pixel data.
        assert_eq!(tensor[[0, 0, 10, 10]], 0.0);
        let expected = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 2, 320, 320]] - expected).abs() < 1e-3);
    }

    #[test]
    fn test_letterbox_maps_back_to_image() {
        let letterbox = Letterbox { scale: 2.0, offset_x: 0.0, offset_y: 160.0 };
        let (x, y) = letterbox.to_image(200.0, 260.0);
        assert!((x - 100.0).abs() < 1e-6);
        assert!((y - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_output_slots_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let slots = output_slots(&names);
        assert_eq!(slots[0], (2, 0, 1));
        assert_eq!(slots[1], (5, 3, 4));
        assert_eq!(slots[2], (8, 6, 7));
    }

    #[test]
    fn test_output_slots_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (i + 400).to_string()).collect();
        assert_eq!(output_slots(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_level_single_anchor() {
        let stride = 32usize;
        let cells = (640 / stride) * (640 / stride) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; cells];
        let mut boxes = vec![0.0f32; cells * 4];
        let mut keypoints = vec![0.0f32; cells * 10];

        // Anchor 2 is the first anchor of cell 1: centre (32, 0).
        scores[2] = 0.9;
        boxes[8..12].copy_from_slice(&[0.5, 0.0, 0.5, 1.0]);
        keypoints[20] = 0.25;

        let level = StrideOutputs { stride, scores: &scores, boxes: &boxes, keypoints: &keypoints };
        let letterbox = Letterbox { scale: 1.0, offset_x: 0.0, offset_y: 0.0 };
        let faces = decode_level(&level, &letterbox, 0.5);

        assert_eq!(faces.len(), 1);
        let face = &faces[0];
        assert!((face.x - 16.0).abs() < 1e-4);
        assert!((face.width - 32.0).abs() < 1e-4);
        assert!((face.height - 32.0).abs() < 1e-4);
        let landmarks = face.landmarks.expect("landmarks decoded");
        assert!((landmarks[0].0 - 40.0).abs() < 1e-4);
    }
}
