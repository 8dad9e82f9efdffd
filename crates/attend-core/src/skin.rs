//! Classical face-region detector based on skin chrominance.
//!
//! Pixels are classified with the YCbCr skin rule, pooled into small cells and
//! grouped into 4-connected regions. Regions that are too small, too elongated
//! or too sparse are discarded. Needs no model files.

use crate::codec::DecodedImage;
use crate::detector::{sort_by_area, DetectorError, FaceDetector};
use crate::types::BoundingBox;
use image::RgbImage;
use std::collections::VecDeque;

// --- Named constants ---
const CELL_SIZE: u32 = 4;
const CB_RANGE: (f32, f32) = (77.0, 127.0);
const CR_RANGE: (f32, f32) = (133.0, 173.0);
/// Fraction of skin pixels for a cell to count as skin.
const CELL_SKIN_FRACTION: f32 = 0.5;

/// Tunables for region filtering.
#[derive(Debug, Clone)]
pub struct SkinRegionParams {
    /// Minimum region area as a fraction of the image.
    pub min_area_fraction: f32,
    /// Accepted height / width range of the region's bounding box.
    pub aspect_range: (f32, f32),
    /// Minimum share of the bounding box covered by the region.
    pub min_fill: f32,
}

impl Default for SkinRegionParams {
    fn default() -> Self {
        Self {
            min_area_fraction: 0.02,
            aspect_range: (0.8, 2.2),
            min_fill: 0.4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SkinRegionDetector {
    params: SkinRegionParams,
}

impl SkinRegionDetector {
    pub fn new(params: SkinRegionParams) -> Self {
        Self { params }
    }
}

impl FaceDetector for SkinRegionDetector {
    fn name(&self) -> &'static str {
        "skin"
    }

    fn detect(&self, image: &DecodedImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let mask = CellMask::from_rgb(&image.rgb);
        let image_area = (image.width() * image.height()) as f32;
        let cell_area = (CELL_SIZE * CELL_SIZE) as f32;

        let mut faces: Vec<BoundingBox> = mask
            .regions()
            .into_iter()
            .filter_map(|region| {
                let area = region.cells as f32 * cell_area;
                if area < self.params.min_area_fraction * image_area {
                    return None;
                }
                let aspect = region.rows() as f32 / region.cols() as f32;
                let (min_aspect, max_aspect) = self.params.aspect_range;
                if aspect < min_aspect || aspect > max_aspect {
                    return None;
                }
                let fill = region.cells as f32 / (region.rows() * region.cols()) as f32;
                if fill < self.params.min_fill {
                    return None;
                }
                Some(BoundingBox {
                    x: (region.min_col * CELL_SIZE as usize) as f32,
                    y: (region.min_row * CELL_SIZE as usize) as f32,
                    width: (region.cols() * CELL_SIZE as usize) as f32,
                    height: (region.rows() * CELL_SIZE as usize) as f32,
                    confidence: fill,
                    landmarks: None,
                })
            })
            .collect();

        sort_by_area(&mut faces);
        tracing::debug!(faces = faces.len(), "skin-region detection");
        Ok(faces)
    }
}

/// YCbCr (ITU-R BT.601) skin rule on chrominance only.
pub fn is_skin(r: u8, g: u8, b: u8) -> bool {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (CB_RANGE.0..=CB_RANGE.1).contains(&cb) && (CR_RANGE.0..=CR_RANGE.1).contains(&cr)
}

/// Connected skin region in cell coordinates.
#[derive(Debug)]
struct Region {
    min_col: usize,
    max_col: usize,
    min_row: usize,
    max_row: usize,
    cells: usize,
}

impl Region {
    fn cols(&self) -> usize {
        self.max_col - self.min_col + 1
    }

    fn rows(&self) -> usize {
        self.max_row - self.min_row + 1
    }
}

/// Skin classification pooled over `CELL_SIZE`-square cells. Partial cells at
/// the right and bottom edges are dropped.
struct CellMask {
    cols: usize,
    rows: usize,
    skin: Vec<bool>,
}

impl CellMask {
    fn from_rgb(rgb: &RgbImage) -> Self {
        let cols = (rgb.width() / CELL_SIZE) as usize;
        let rows = (rgb.height() / CELL_SIZE) as usize;
        let needed = (CELL_SKIN_FRACTION * (CELL_SIZE * CELL_SIZE) as f32).ceil() as u32;

        let mut skin = vec![false; cols * rows];
        for row in 0..rows {
            for col in 0..cols {
                let mut count = 0u32;
                for dy in 0..CELL_SIZE {
                    for dx in 0..CELL_SIZE {
                        let x = col as u32 * CELL_SIZE + dx;
                        let y = row as u32 * CELL_SIZE + dy;
                        let [r, g, b] = rgb.get_pixel(x, y).0;
                        if is_skin(r, g, b) {
                            count += 1;
                        }
                    }
                }
                skin[row * cols + col] = count >= needed;
            }
        }

        Self { cols, rows, skin }
    }

    /// 4-connected components of skin cells, in scan order.
    fn regions(&self) -> Vec<Region> {
        let mut visited = vec![false; self.skin.len()];
        let mut regions = Vec::new();
        let mut queue = VecDeque::new();

        for start in 0..self.skin.len() {
            if !self.skin[start] || visited[start] {
                continue;
            }

            visited[start] = true;
            queue.push_back(start);
            let mut region = Region {
                min_col: usize::MAX,
                max_col: 0,
                min_row: usize::MAX,
                max_row: 0,
                cells: 0,
            };

            while let Some(idx) = queue.pop_front() {
                let (row, col) = (idx / self.cols, idx % self.cols);
                region.min_col = region.min_col.min(col);
                region.max_col = region.max_col.max(col);
                region.min_row = region.min_row.min(row);
                region.max_row = region.max_row.max(row);
                region.cells += 1;

                let mut visit = |neighbour: usize| {
                    if self.skin[neighbour] && !visited[neighbour] {
                        visited[neighbour] = true;
                        queue.push_back(neighbour);
                    }
                };
                if col > 0 {
                    visit(idx - 1);
                }
                if col + 1 < self.cols {
                    visit(idx + 1);
                }
                if row > 0 {
                    visit(idx - self.cols);
                }
                if row + 1 < self.rows {
                    visit(idx + self.cols);
                }
            }

            regions.push(region);
        }

        regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face_photo, FaceSpec, BACKGROUND, SKIN};
    use image::Rgb;

    fn detect(rgb: RgbImage) -> Vec<BoundingBox> {
        let image = DecodedImage {
            gray: image::DynamicImage::ImageRgb8(rgb.clone()).to_luma8(),
            original_width: rgb.width(),
            original_height: rgb.height(),
            rgb,
        };
        SkinRegionDetector::default().detect(&image).unwrap()
    }

    #[test]
    fn test_skin_rule() {
        assert!(is_skin(SKIN[0], SKIN[1], SKIN[2]));
        assert!(!is_skin(BACKGROUND[0], BACKGROUND[1], BACKGROUND[2]));
        assert!(!is_skin(255, 255, 255));
        assert!(!is_skin(0, 0, 0));
    }

    #[test]
    fn test_no_skin_no_faces() {
        let rgb = RgbImage::from_pixel(160, 160, Rgb(BACKGROUND));
        assert!(detect(rgb).is_empty());
    }

    #[test]
    fn test_single_face_box() {
        let rgb = face_photo(160, 160, &[FaceSpec::centred(80, 80, 0)]);
        let faces = detect(rgb);
        assert_eq!(faces.len(), 1);

        let face = &faces[0];
        // Ellipse radii are 40 x 52 around (80, 80).
        assert!((face.x - 40.0).abs() <= 8.0, "x = {}", face.x);
        assert!((face.y - 28.0).abs() <= 8.0, "y = {}", face.y);
        assert!((face.width - 80.0).abs() <= 8.0, "w = {}", face.width);
        assert!((face.height - 104.0).abs() <= 8.0, "h = {}", face.height);
        assert!(face.confidence > 0.6);
        assert!(face.landmarks.is_none());
    }

    #[test]
    fn test_two_faces_sorted_by_area() {
        let rgb = face_photo(
            320,
            160,
            &[
                FaceSpec { cx: 80, cy: 80, rx: 30, ry: 40, pattern: 1 },
                FaceSpec::centred(240, 80, 2),
            ],
        );
        let faces = detect(rgb);
        assert_eq!(faces.len(), 2);
        assert!(faces[0].area() > faces[1].area());
        assert!(faces[0].x > 160.0);
    }

    #[test]
    fn test_small_region_ignored() {
        let rgb = face_photo(400, 400, &[FaceSpec { cx: 50, cy: 50, rx: 6, ry: 8, pattern: 0 }]);
        assert!(detect(rgb).is_empty());
    }

    #[test]
    fn test_elongated_region_ignored() {
        let mut rgb = RgbImage::from_pixel(200, 200, Rgb(BACKGROUND));
        for y in 90..110 {
            for x in 0..200 {
                rgb.put_pixel(x, y, Rgb(SKIN));
            }
        }
        assert!(detect(rgb).is_empty());
    }
}
