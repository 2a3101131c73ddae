//! Background colour harmonization.
//!
//! Statistics are taken from two thin bands on either side of the product
//! boundary: the product's rim and the background right next to it. The
//! background is then shifted (and its contrast scaled) so that its rim
//! statistics move toward the product's, per channel in a luma /
//! colour-difference space.

use image::{GrayImage, Luma, Rgb, Rgb32FImage};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, erode};
use tracing::debug;

use super::color_space::{luminance, LUMA_WEIGHTS};
use crate::raster::AlphaMask;
use crate::refine::binarize;

const MIN_STD_RATIO: f32 = 0.25;
const MAX_STD_RATIO: f32 = 4.0;
const FLAT_STD: f64 = 1e-6;

/// RGB to (Y, B-Y, R-Y).
pub fn to_opponent(rgb: [f32; 3]) -> [f32; 3] {
    let y = luminance(rgb);
    [y, rgb[2] - y, rgb[0] - y]
}

pub fn from_opponent([y, cb, cr]: [f32; 3]) -> [f32; 3] {
    let r = cr + y;
    let b = cb + y;
    let g = (y - LUMA_WEIGHTS[0] * r - LUMA_WEIGHTS[2] * b) / LUMA_WEIGHTS[1];
    [r, g, b]
}

/// Inner rim of the foreground and outer ring of background, both `band_px` wide.
pub fn boundary_bands(mask: &AlphaMask, band_px: u8) -> (GrayImage, GrayImage) {
    let binary = binarize(mask, 0.5);
    let shrunk = erode(&binary, Norm::LInf, band_px);
    let grown = dilate(&binary, Norm::LInf, band_px);

    let inner = GrayImage::from_fn(binary.width(), binary.height(), |x, y| {
        let on = binary.get_pixel(x, y)[0] > 0 && shrunk.get_pixel(x, y)[0] == 0;
        Luma([if on { 255 } else { 0 }])
    });
    let outer = GrayImage::from_fn(binary.width(), binary.height(), |x, y| {
        let on = grown.get_pixel(x, y)[0] > 0 && binary.get_pixel(x, y)[0] == 0;
        Luma([if on { 255 } else { 0 }])
    });
    (inner, outer)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandStatistics {
    pub mean: [f32; 3],
    pub std_dev: [f32; 3],
    pub count: usize,
}

/// Opponent-space mean and standard deviation over the selected pixels.
///
/// Pixels with any non-finite channel are skipped. Returns `None` when
/// nothing usable is selected.
pub fn band_statistics(image: &Rgb32FImage, band: &GrayImage) -> Option<BandStatistics> {
    let mut sum = [0f64; 3];
    let mut sum_sq = [0f64; 3];
    let mut count = 0usize;

    for (Rgb(rgb), Luma([selected])) in image.pixels().zip(band.pixels()) {
        if *selected == 0 || !rgb.iter().all(|v| v.is_finite()) {
            continue;
        }
        let opponent = to_opponent(*rgb);
        for c in 0..3 {
            let v = f64::from(opponent[c]);
            sum[c] += v;
            sum_sq[c] += v * v;
        }
        count += 1;
    }

    if count == 0 {
        return None;
    }

    let n = count as f64;
    let mut mean = [0f32; 3];
    let mut std_dev = [0f32; 3];
    for c in 0..3 {
        let m = sum[c] / n;
        let variance = (sum_sq[c] / n - m * m).max(0.0);
        mean[c] = m as f32;
        std_dev[c] = variance.sqrt() as f32;
    }
    Some(BandStatistics {
        mean,
        std_dev,
        count,
    })
}

/// Affine per-channel map taking background statistics toward foreground statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTransfer {
    source_mean: [f32; 3],
    target_mean: [f32; 3],
    scale: [f32; 3],
}

impl ColorTransfer {
    pub fn between(source: &BandStatistics, target: &BandStatistics) -> Self {
        let mut scale = [1f32; 3];
        for c in 0..3 {
            if f64::from(source.std_dev[c]) > FLAT_STD {
                scale[c] = (target.std_dev[c] / source.std_dev[c]).clamp(MIN_STD_RATIO, MAX_STD_RATIO);
            }
        }
        Self {
            source_mean: source.mean,
            target_mean: target.mean,
            scale,
        }
    }

    /// `strength` 0 leaves the colour alone, 1 applies the full transfer.
    pub fn apply(&self, rgb: [f32; 3], strength: f32) -> [f32; 3] {
        let opponent = to_opponent(rgb);
        let mut moved = [0f32; 3];
        for c in 0..3 {
            let full = (opponent[c] - self.source_mean[c]) * self.scale[c] + self.target_mean[c];
            moved[c] = opponent[c] + strength * (full - opponent[c]);
        }
        from_opponent(moved)
    }
}

/// Harmonizes `background` in place. Returns the transfer that was applied, if any.
pub fn match_colors(
    background: &mut Rgb32FImage,
    foreground: &Rgb32FImage,
    mask: &AlphaMask,
    band_px: u8,
    strength: f32,
) -> Option<ColorTransfer> {
    let (inner, outer) = boundary_bands(mask, band_px);
    let target = band_statistics(foreground, &inner)?;
    let source = band_statistics(background, &outer)?;
    debug!(
        foreground_samples = target.count,
        background_samples = source.count,
        "Matching background colours"
    );

    let transfer = ColorTransfer::between(&source, &target);
    for Rgb(rgb) in background.pixels_mut() {
        *rgb = transfer.apply(*rgb, strength);
    }
    Some(transfer)
}
