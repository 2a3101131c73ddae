use image::{imageops, imageops::FilterType, Luma, RgbaImage};
use tracing::{debug, info};

use crate::errors::{CompositeError, Result};
use crate::imageops::mask;
use crate::raster::{AlphaMask, RasterImage};
use crate::traits::{AcceleratorAccess, RawAlpha, SegmentationBackend};

/// Turns a decoded photo into a soft alpha mask at the photo's resolution.
pub struct ForegroundExtractor<B: SegmentationBackend> {
    backend: B,
}

impl<B: SegmentationBackend> ForegroundExtractor<B> {
    pub const fn new(backend: B) -> Self {
        Self { backend }
    }

    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// What the backend needs from the accelerator, so callers can serialize access.
    pub fn accelerator(&self) -> AcceleratorAccess {
        self.backend.accelerator()
    }

    pub fn extract(&self, image: &RasterImage) -> Result<AlphaMask> {
        let (width, height) = image.dimensions();
        if width < 1 || height < 1 {
            return Err(CompositeError::invalid_input(format!(
                "cannot segment a {width}x{height} image"
            )));
        }

        info!(backend = self.backend.name(), width, height, "Extracting foreground");
        let raw = self.backend.segment(image)?;
        let (raw_width, raw_height) = raw.dimensions();
        if raw_width == 0 || raw_height == 0 {
            return Err(CompositeError::Model {
                operation: format!("{} segmentation output", self.backend.name()),
                source: "backend returned an empty confidence map".into(),
            });
        }

        let raw = sanitize(raw);
        let resized = if (raw_width, raw_height) == (width, height) {
            raw
        } else {
            debug!(raw_width, raw_height, width, height, "Upsampling confidence map");
            imageops::resize(&raw, width, height, FilterType::Triangle)
        };

        AlphaMask::new(resized)
    }
}

/// Non-finite confidences become 0 before interpolation so they cannot bleed into neighbours.
fn sanitize(mut raw: RawAlpha) -> RawAlpha {
    for Luma([value]) in raw.pixels_mut() {
        if !value.is_finite() {
            *value = 0.0;
        }
    }
    raw
}

/// RGBA product layer: the photo's colours with the mask as alpha.
pub fn cutout(image: &RasterImage, alpha: &AlphaMask) -> Result<RgbaImage> {
    let rgb = image.as_dynamic().to_rgb8();
    mask::apply(&rgb, alpha.as_buffer(), false)
}

/// Like [`cutout`] with colours scaled by alpha, so viewers that ignore the
/// alpha channel show the product on black.
pub fn premultiplied_cutout(image: &RasterImage, alpha: &AlphaMask) -> Result<RgbaImage> {
    let rgb = image.as_dynamic().to_rgb8();
    mask::apply(&rgb, alpha.as_buffer(), true)
}
