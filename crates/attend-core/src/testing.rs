//! Synthetic face photos for unit tests.

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

pub const BACKGROUND: [u8; 3] = [40, 60, 160];
pub const SKIN: [u8; 3] = [224, 172, 140];
/// Dark facial features; chrominance still inside the skin rule.
pub const FEATURE: [u8; 3] = [90, 50, 40];

/// Skin-toned ellipse with pattern-dependent eyes, mouth and brow.
#[derive(Debug, Clone, Copy)]
pub struct FaceSpec {
    pub cx: u32,
    pub cy: u32,
    pub rx: u32,
    pub ry: u32,
    pub pattern: u8,
}

impl FaceSpec {
    pub fn centred(cx: u32, cy: u32, pattern: u8) -> Self {
        Self { cx, cy, rx: 40, ry: 52, pattern }
    }
}

pub fn face_photo(width: u32, height: u32, faces: &[FaceSpec]) -> RgbImage {
    let mut rgb = RgbImage::from_pixel(width, height, Rgb(BACKGROUND));
    for face in faces {
        draw_face(&mut rgb, face);
    }
    rgb
}

fn draw_face(rgb: &mut RgbImage, face: &FaceSpec) {
    let (cx, cy) = (face.cx as f32, face.cy as f32);
    let (rx, ry) = (face.rx as f32, face.ry as f32);
    let p = face.pattern as u32;

    let eye_radius = (3 + p % 4) as f32 * rx / 40.0;
    let eye_dx = rx * (35 + 5 * (p % 3)) as f32 / 100.0;
    let eye_dy = ry * (20 + 5 * ((p / 4) % 3)) as f32 / 100.0;
    let mouth_half_w = rx * (25 + 10 * ((p / 2) % 3)) as f32 / 100.0;
    let mouth_half_h = (2 + p % 2) as f32;
    let mouth_y = cy + ry * 0.45;
    let brow = p & 8 != 0;

    for y in 0..rgb.height() {
        for x in 0..rgb.width() {
            let (fx, fy) = (x as f32, y as f32);
            let nx = (fx - cx) / rx;
            let ny = (fy - cy) / ry;
            if nx * nx + ny * ny > 1.0 {
                continue;
            }

            let in_eye = [cx - eye_dx, cx + eye_dx].iter().any(|&ex| {
                let (dx, dy) = (fx - ex, fy - (cy - eye_dy));
                dx * dx + dy * dy <= eye_radius * eye_radius
            });
            let in_mouth = (fx - cx).abs() <= mouth_half_w && (fy - mouth_y).abs() <= mouth_half_h;
            let in_brow = brow && (fy - (cy - ry * 0.55)).abs() <= 1.5 && (fx - cx).abs() <= rx * 0.6;

            let colour = if in_eye || in_mouth || in_brow { FEATURE } else { SKIN };
            rgb.put_pixel(x, y, Rgb(colour));
        }
    }
}

pub fn encode(rgb: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(rgb.clone())
        .write_to(&mut out, format)
        .expect("encode test image");
    out.into_inner()
}

pub fn png_photo(faces: &[FaceSpec]) -> Vec<u8> {
    encode(&face_photo(160, 160, faces), ImageFormat::Png)
}
