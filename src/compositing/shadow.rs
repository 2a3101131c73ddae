use image::{Luma, Rgb32FImage};

use crate::imageops::gaussian_blur;
use crate::raster::{AlphaMask, MaskBuffer};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowParams {
    pub opacity: f32,
    pub offset_px: u32,
    pub blur_px: f32,
}

/// Silhouette pushed down by `offset_px` and softened by `blur_px`.
pub fn shadow_map(mask: &AlphaMask, offset_px: u32, blur_px: f32) -> MaskBuffer {
    let (width, height) = mask.dimensions();
    let shifted = MaskBuffer::from_fn(width, height, |x, y| {
        if y >= offset_px {
            Luma([mask.get(x, y - offset_px)])
        } else {
            Luma([0.0])
        }
    });
    gaussian_blur(&shifted, blur_px)
}

/// Darkens `background` under the product's footprint, in whatever space the buffer is in.
pub fn cast_contact_shadow(background: &mut Rgb32FImage, mask: &AlphaMask, params: &ShadowParams) {
    let shadow = shadow_map(mask, params.offset_px, params.blur_px);
    for (pixel, Luma([strength])) in background.pixels_mut().zip(shadow.pixels()) {
        let factor = 1.0 - params.opacity * strength;
        for channel in pixel.0.iter_mut() {
            *channel *= factor;
        }
    }
}
