//! Uniform local binary pattern (LBP) descriptors.
//!
//! Each interior pixel is coded by thresholding its 8 neighbours (radius 1)
//! against it. Codes with at most two 0/1 transitions around the circle are
//! "uniform" and get their own bin; all others share one bin. Histograms are
//! computed per cell of a 4×4 grid and concatenated.

use crate::types::l2_normalize;
use image::GrayImage;
use std::sync::OnceLock;

/// 58 uniform patterns plus one shared bin.
pub const LBP_BINS: usize = 59;
/// Cells per side of the histogram grid.
pub const LBP_GRID: usize = 4;
/// Length of the descriptor returned by [`lbp_features`].
pub const LBP_FEATURE_DIM: usize = LBP_GRID * LBP_GRID * LBP_BINS;

/// Neighbour offsets, walking clockwise from the top-left.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

fn transitions(code: u8) -> u32 {
    (code ^ code.rotate_left(1)).count_ones()
}

/// Bin index for every 8-bit code.
fn uniform_bins() -> &'static [u8; 256] {
    static TABLE: OnceLock<[u8; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [(LBP_BINS - 1) as u8; 256];
        let mut next = 0u8;
        for code in 0..=255u8 {
            if transitions(code) <= 2 {
                table[code as usize] = next;
                next += 1;
            }
        }
        table
    })
}

/// LBP code of the pixel at (x, y). The caller keeps (x, y) off the border.
fn code_at(gray: &GrayImage, x: u32, y: u32) -> u8 {
    let centre = gray.get_pixel(x, y)[0];
    NEIGHBOURS.iter().enumerate().fold(0u8, |code, (bit, &(dx, dy))| {
        let nx = (x as i32 + dx) as u32;
        let ny = (y as i32 + dy) as u32;
        if gray.get_pixel(nx, ny)[0] >= centre {
            code | (1 << bit)
        } else {
            code
        }
    })
}

/// Grid of uniform-LBP histograms, square-rooted and L2-normalised.
///
/// Each cell histogram is normalised by its pixel count before the square root,
/// so cells contribute equally regardless of size. Images smaller than 3×3
/// produce an all-zero descriptor.
pub fn lbp_features(gray: &GrayImage) -> Vec<f32> {
    let mut histogram = vec![0.0f32; LBP_FEATURE_DIM];
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return histogram;
    }

    let bins = uniform_bins();
    let mut cell_counts = [0u32; LBP_GRID * LBP_GRID];

    for y in 1..height - 1 {
        let cell_row = (y as usize * LBP_GRID) / height as usize;
        for x in 1..width - 1 {
            let cell_col = (x as usize * LBP_GRID) / width as usize;
            let cell = cell_row * LBP_GRID + cell_col;
            let bin = bins[code_at(gray, x, y) as usize] as usize;
            histogram[cell * LBP_BINS + bin] += 1.0;
            cell_counts[cell] += 1;
        }
    }

    for (cell, &count) in cell_counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        for value in &mut histogram[cell * LBP_BINS..(cell + 1) * LBP_BINS] {
            *value = (*value / count as f32).sqrt();
        }
    }

    l2_normalize(&mut histogram);
    histogram
}
