//! Mask-driven fusion of the untouched product layer with a background.

mod color_match;
mod color_space;
mod shadow;

use image::{DynamicImage, GrayImage, ImageBuffer, Rgb, Rgb32FImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use color_match::{band_statistics, boundary_bands, match_colors, BandStatistics, ColorTransfer};
pub use color_space::{linear_to_srgb, luminance, srgb_to_linear, BlendSpace};
pub use shadow::{cast_contact_shadow, shadow_map, ShadowParams};

use crate::errors::{CompositeError, Result};
use crate::raster::{AlphaMask, RasterImage, SampleDepth};
use crate::visualize::edge_map;
use color_space::{quantize_u16, quantize_u8, sanitize};

/// Options for [`composite`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendOptions {
    /// Blend in linear light instead of on the stored gamma-encoded samples.
    pub linearize: bool,
    pub color_match: bool,
    /// Width of the boundary bands sampled for colour statistics.
    pub color_match_band_px: u32,
    pub color_match_strength: f32,
    pub shadow: bool,
    pub shadow_opacity: f32,
    pub shadow_offset_px: u32,
    pub shadow_blur_px: f32,
    /// Also return a mask preview and an edge map.
    pub emit_byproducts: bool,
}

impl Default for BlendOptions {
    fn default() -> Self {
        Self {
            linearize: true,
            color_match: false,
            color_match_band_px: 8,
            color_match_strength: 0.5,
            shadow: false,
            shadow_opacity: 0.3,
            shadow_offset_px: 20,
            shadow_blur_px: 15.0,
            emit_byproducts: false,
        }
    }
}

impl BlendOptions {
    pub const fn with_linearize(mut self, linearize: bool) -> Self {
        self.linearize = linearize;
        self
    }

    pub const fn with_color_match(mut self, strength: f32) -> Self {
        self.color_match = true;
        self.color_match_strength = strength;
        self
    }

    pub const fn with_shadow(mut self, opacity: f32, offset_px: u32, blur_px: f32) -> Self {
        self.shadow = true;
        self.shadow_opacity = opacity;
        self.shadow_offset_px = offset_px;
        self.shadow_blur_px = blur_px;
        self
    }

    pub const fn with_byproducts(mut self) -> Self {
        self.emit_byproducts = true;
        self
    }

    pub const fn blend_space(&self) -> BlendSpace {
        if self.linearize {
            BlendSpace::Linear
        } else {
            BlendSpace::Gamma
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=255).contains(&self.color_match_band_px) {
            return Err(CompositeError::invalid_options(
                "color_match_band_px",
                format!("must be within 1..=255, got {}", self.color_match_band_px),
            ));
        }
        unit_interval("color_match_strength", self.color_match_strength)?;
        unit_interval("shadow_opacity", self.shadow_opacity)?;
        if !self.shadow_blur_px.is_finite() || self.shadow_blur_px < 0.0 {
            return Err(CompositeError::invalid_options(
                "shadow_blur_px",
                format!("must be a non-negative number, got {}", self.shadow_blur_px),
            ));
        }
        Ok(())
    }
}

fn unit_interval(field: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CompositeError::invalid_options(
            field,
            format!("must be within [0,1], got {value}"),
        ))
    }
}

/// Inputs of one fusion. All three buffers must share the same dimensions.
#[derive(Debug, Clone)]
pub struct CompositeRequest<'a> {
    pub foreground: &'a RasterImage,
    pub mask: &'a AlphaMask,
    pub background: &'a RasterImage,
    pub options: BlendOptions,
}

impl<'a> CompositeRequest<'a> {
    pub fn new(foreground: &'a RasterImage, mask: &'a AlphaMask, background: &'a RasterImage) -> Self {
        Self {
            foreground,
            mask,
            background,
            options: BlendOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BlendOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompositeDiagnostics {
    /// At least one output sample was non-finite or out of range before clamping.
    pub numeric_anomaly: bool,
    pub clamped_samples: u64,
    pub color_matched: bool,
    pub shadow_applied: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeByproducts {
    pub mask_preview: GrayImage,
    /// 255 wherever the mask is strictly between 0 and 1.
    pub edge_map: GrayImage,
}

#[derive(Debug, Clone)]
pub struct CompositeResult {
    pub image: RasterImage,
    pub diagnostics: CompositeDiagnostics,
    pub byproducts: Option<CompositeByproducts>,
}

/// `α·F + (1−α)·B` per sample, with optional background adjustments first.
///
/// Where `α` is exactly 1 (or 0) the foreground (or background) sample is
/// copied without passing through the transfer functions, so fully opaque
/// product pixels come out bit-identical.
pub fn composite(request: &CompositeRequest<'_>) -> Result<CompositeResult> {
    let CompositeRequest {
        foreground,
        mask,
        background,
        options,
    } = request;

    let expected = foreground.dimensions();
    if mask.dimensions() != expected {
        return Err(CompositeError::dimension_mismatch("mask", expected, mask.dimensions()));
    }
    if background.dimensions() != expected {
        return Err(CompositeError::dimension_mismatch(
            "background",
            expected,
            background.dimensions(),
        ));
    }
    options.validate()?;

    let (width, height) = expected;
    let space = options.blend_space();
    info!(width, height, ?space, "Compositing");

    let fg = foreground.to_rgb32f();
    let bg = background.to_rgb32f();

    let mut diagnostics = CompositeDiagnostics::default();
    let adjusted = adjust_background(&fg, &bg, mask, options, &mut diagnostics);

    let mut blended = Rgb32FImage::new(width, height);
    for (x, y, Rgb(out)) in blended.enumerate_pixels_mut() {
        let alpha = mask.get(x, y);
        let f = fg.get_pixel(x, y).0;
        let b = bg.get_pixel(x, y).0;
        let working = adjusted.as_ref().map(|image| image.get_pixel(x, y).0);

        for c in 0..3 {
            let value = if alpha >= 1.0 {
                f[c]
            } else if alpha <= 0.0 {
                working.map_or(b[c], |w| space.encode(w[c]))
            } else {
                let under = working.map_or_else(|| space.decode(b[c]), |w| w[c]);
                space.encode(alpha * space.decode(f[c]) + (1.0 - alpha) * under)
            };

            let (value, clamped) = sanitize(value);
            if clamped {
                diagnostics.clamped_samples += 1;
            }
            out[c] = value;
        }
    }

    diagnostics.numeric_anomaly = diagnostics.clamped_samples > 0;
    if diagnostics.numeric_anomaly {
        warn!(
            clamped_samples = diagnostics.clamped_samples,
            "Clamped non-finite or out-of-range samples"
        );
    }

    let image = RasterImage::new(quantize(blended, foreground.depth()))?;
    let byproducts = options.emit_byproducts.then(|| build_byproducts(mask));

    Ok(CompositeResult {
        image,
        diagnostics,
        byproducts,
    })
}

/// Background in the blend space after colour matching and shadow, or `None` if neither is enabled.
fn adjust_background(
    fg: &Rgb32FImage,
    bg: &Rgb32FImage,
    mask: &AlphaMask,
    options: &BlendOptions,
    diagnostics: &mut CompositeDiagnostics,
) -> Option<Rgb32FImage> {
    if !options.color_match && !options.shadow {
        return None;
    }

    let space = options.blend_space();
    let mut working = space.decode_image(bg);

    if options.color_match {
        let product = space.decode_image(fg);
        let transfer = match_colors(
            &mut working,
            &product,
            mask,
            options.color_match_band_px as u8,
            options.color_match_strength,
        );
        diagnostics.color_matched = transfer.is_some();
        if transfer.is_none() {
            debug!("No boundary to sample, colour matching skipped");
        }
    }

    if options.shadow {
        let params = ShadowParams {
            opacity: options.shadow_opacity,
            offset_px: options.shadow_offset_px,
            blur_px: options.shadow_blur_px,
        };
        debug!(?params, "Casting contact shadow");
        cast_contact_shadow(&mut working, mask, &params);
        diagnostics.shadow_applied = true;
    }

    Some(working)
}

fn quantize(image: Rgb32FImage, depth: SampleDepth) -> DynamicImage {
    let (width, height) = image.dimensions();
    match depth {
        SampleDepth::U8 => DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
            Rgb(image.get_pixel(x, y).0.map(quantize_u8))
        })),
        SampleDepth::U16 => DynamicImage::ImageRgb16(ImageBuffer::from_fn(width, height, |x, y| {
            Rgb(image.get_pixel(x, y).0.map(quantize_u16))
        })),
        SampleDepth::F32 => DynamicImage::ImageRgb32F(image),
    }
}

fn build_byproducts(mask: &AlphaMask) -> CompositeByproducts {
    CompositeByproducts {
        mask_preview: mask.to_gray(),
        edge_map: edge_map(mask),
    }
}
