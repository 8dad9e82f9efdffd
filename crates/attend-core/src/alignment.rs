//! Face alignment and cropping.
//!
//! Every detected face becomes a 64×64 grayscale [`FaceCrop`]. Faces with
//! landmarks are aligned with a 4-DOF similarity transform onto the InsightFace
//! reference positions; faces without landmarks are cropped as a square around
//! the box. Both paths share the same bilinear warp.

use crate::codec::{self, CodecError};
use crate::types::BoundingBox;
use image::{GrayImage, Luma};

/// Side length of every face crop.
pub const FACE_SIZE: u32 = 64;

/// Margin around a landmark-less box, relative to its longer side.
const BOX_MARGIN: f32 = 1.1;

/// InsightFace reference landmarks, defined for 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// A similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Map a destination pixel back into the source image.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

/// An aligned 64×64 grayscale face.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub pixels: GrayImage,
    /// Detection the crop was taken from, in source image coordinates.
    pub bbox: BoundingBox,
}

impl FaceCrop {
    /// Crop a detection out of a grayscale photo.
    pub fn from_detection(gray: &GrayImage, bbox: &BoundingBox) -> Self {
        let transform = match &bbox.landmarks {
            Some(landmarks) => landmark_transform(landmarks),
            None => box_transform(bbox),
        };
        Self {
            pixels: warp(gray, &transform, FACE_SIZE),
            bbox: bbox.clone(),
        }
    }

    /// Wrap stored crop pixels. Crops of another size are resampled.
    pub fn from_pixels(pixels: GrayImage) -> Self {
        let pixels = if pixels.dimensions() == (FACE_SIZE, FACE_SIZE) {
            pixels
        } else {
            image::imageops::resize(&pixels, FACE_SIZE, FACE_SIZE, image::imageops::FilterType::Triangle)
        };
        Self {
            pixels,
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: FACE_SIZE as f32,
                height: FACE_SIZE as f32,
                confidence: 1.0,
                landmarks: None,
            },
        }
    }

    pub fn to_png(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode_gray_png(&self.pixels)
    }

    pub fn from_png(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(Self::from_pixels(codec::decode_gray_png(bytes)?))
    }
}

fn reference_landmarks(size: u32) -> [(f32, f32); 5] {
    let scale = size as f32 / 112.0;
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * scale, y * scale))
}

/// Least-squares similarity transform from detected landmarks to the reference set.
fn landmark_transform(landmarks: &[(f32, f32); 5]) -> Similarity {
    estimate_similarity(landmarks, &reference_landmarks(FACE_SIZE))
}

/// Scale-and-translate transform mapping a square around the box onto the crop.
fn box_transform(bbox: &BoundingBox) -> Similarity {
    let side = bbox.width.max(bbox.height).max(1.0) * BOX_MARGIN;
    let left = bbox.x + bbox.width / 2.0 - side / 2.0;
    let top = bbox.y + bbox.height / 2.0 - side / 2.0;
    let a = FACE_SIZE as f32 / side;
    Similarity {
        a,
        b: 0.0,
        tx: -left * a,
        ty: -top * a,
    }
}

/// Solve the normal equations of the overdetermined system
/// `a*sx - b*sy + tx = dx`, `b*sx + a*sy + ty = dy` over all point pairs.
fn estimate_similarity(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Similarity {
    let mut normal = [[0.0f64; 5]; 4]; // [AᵀA | Aᵀb]

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
        let (sx, sy, dx, dy) = (sx as f64, sy as f64, dx as f64, dy as f64);
        for (row, rhs) in [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)] {
            for i in 0..4 {
                for j in 0..4 {
                    normal[i][j] += row[i] * row[j];
                }
                normal[i][4] += row[i] * rhs;
            }
        }
    }

    match gauss_solve(normal) {
        Some([a, b, tx, ty]) => Similarity {
            a: a as f32,
            b: b as f32,
            tx: tx as f32,
            ty: ty as f32,
        },
        None => Similarity { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 },
    }
}

/// Gaussian elimination with partial pivoting on an augmented 4×5 system.
fn gauss_solve(mut m: [[f64; 5]; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&r1, &r2| {
            m[r1][col]
                .abs()
                .partial_cmp(&m[r2][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if m[pivot_row][col].abs() < 1e-9 {
            return None;
        }
        m.swap(col, pivot_row);

        for row in col + 1..4 {
            let factor = m[row][col] / m[col][col];
            for k in col..5 {
                m[row][k] -= factor * m[col][k];
            }
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        let tail: f64 = (i + 1..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (m[i][4] - tail) / m[i][i];
    }
    Some(x)
}

/// Bilinear warp of `source` into a `size`×`size` output. Samples outside the
/// source are black.
fn warp(source: &GrayImage, transform: &Similarity, size: u32) -> GrayImage {
    let (width, height) = (source.width() as i64, source.height() as i64);
    let sample = |x: i64, y: i64| -> f32 {
        if x >= 0 && x < width && y >= 0 && y < height {
            source.get_pixel(x as u32, y as u32)[0] as f32
        } else {
            0.0
        }
    };

    let mut out = GrayImage::new(size, size);
    for (ox, oy, pixel) in out.enumerate_pixels_mut() {
        let Some((sx, sy)) = transform.invert_point(ox as f32, oy as f32) else {
            continue;
        };
        let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
        let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);

        let value = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + sample(x0 + 1, y0) * fx * (1.0 - fy)
            + sample(x0, y0 + 1) * (1.0 - fx) * fy
            + sample(x0 + 1, y0 + 1) * fx * fy;
        *pixel = Luma([value.round().clamp(0.0, 255.0) as u8]);
    }
    out
}
