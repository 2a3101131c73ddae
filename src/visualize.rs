//! Debug images for the intermediate pipeline stages.

use std::path::{Path, PathBuf};

use image::{imageops, DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use tracing::{debug, warn};

use crate::loader::save_image;
use crate::raster::{AlphaMask, RasterImage};

/// Tints the foreground region of `image` with `color`.
pub fn mask_overlay(image: &RasterImage, mask: &AlphaMask, color: [u8; 3], opacity: f32) -> RgbImage {
    let rgb = image.as_dynamic().to_rgb8();
    let opacity = opacity.clamp(0.0, 1.0);
    RgbImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let weight = opacity * mask.get(x, y);
        let Rgb(base) = *rgb.get_pixel(x, y);
        let mut out = [0u8; 3];
        for c in 0..3 {
            let mixed = f32::from(base[c]) * (1.0 - weight) + f32::from(color[c]) * weight;
            out[c] = mixed.round() as u8;
        }
        Rgb(out)
    })
}

/// White where the mask is partially transparent.
pub fn edge_map(mask: &AlphaMask) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let alpha = mask.get(x, y);
        Luma([if alpha > 0.0 && alpha < 1.0 { 255 } else { 0 }])
    })
}

/// `left` and `right` next to each other, both scaled to the taller height.
pub fn side_by_side(left: &RasterImage, right: &RasterImage) -> RgbImage {
    let height = left.height().max(right.height());
    let fit = |image: &RasterImage| {
        let rgb = image.as_dynamic().to_rgb8();
        if rgb.height() == height {
            rgb
        } else {
            let width = (u64::from(rgb.width()) * u64::from(height) / u64::from(rgb.height())).max(1) as u32;
            imageops::resize(&rgb, width, height, imageops::FilterType::Triangle)
        }
    };

    let (left, right) = (fit(left), fit(right));
    let mut canvas = RgbImage::new(left.width() + right.width(), height);
    imageops::replace(&mut canvas, &left, 0, 0);
    imageops::replace(&mut canvas, &right, i64::from(left.width()), 0);
    canvas
}

/// Saves named stage images under `<dir>/<stem>_<stage>.png`.
///
/// Failures are logged and swallowed: stage output never fails a request.
#[derive(Debug, Clone)]
pub struct StageWriter {
    dir: PathBuf,
}

impl StageWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, stem: &str, stage: &str) -> PathBuf {
        self.dir.join(format!("{stem}_{stage}.png"))
    }

    /// Returns whether the image was written.
    pub fn save(&self, stem: &str, stage: &str, image: &DynamicImage) -> bool {
        let path = self.path_for(stem, stage);
        match save_image(image, &path) {
            Ok(()) => {
                debug!(path = %path.display(), "Saved stage image");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not save stage image");
                false
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
