//! Mask refinement: binarize, open, fill holes, feather.
//!
//! Every step consumes the previous step's output and the whole chain is a
//! pure function of `(mask, options)`. Morphology works on 8-bit binary
//! masks; feathering returns to float so the alpha ramp is not quantized.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, erode};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{CompositeError, Result};
use crate::imageops::gaussian_blur;
use crate::raster::{AlphaMask, Degenerate, MaskBuffer};

const FOREGROUND: u8 = 255;
const BACKGROUND: u8 = 0;
const SNAP_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineOptions {
    /// Confidence above which a pixel counts as foreground when binarizing.
    pub threshold: f32,
    /// Erosion radius applied first; trims halos from the raw boundary.
    pub erode_px: i32,
    /// Dilation radius applied after erosion; recovers thin product features.
    pub dilate_px: i32,
    /// Interior holes with fewer pixels than this are filled. 0 disables filling.
    pub min_hole_area: u32,
    /// Width of the feathered alpha ramp in whole pixels. 0 keeps a hard edge.
    pub feather_radius: i32,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            erode_px: 0,
            dilate_px: 0,
            min_hole_area: 0,
            feather_radius: 0,
        }
    }
}

impl RefineOptions {
    pub const fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub const fn with_morphology(mut self, erode_px: i32, dilate_px: i32) -> Self {
        self.erode_px = erode_px;
        self.dilate_px = dilate_px;
        self
    }

    pub const fn with_min_hole_area(mut self, min_hole_area: u32) -> Self {
        self.min_hole_area = min_hole_area;
        self
    }

    pub const fn with_feather_radius(mut self, feather_radius: i32) -> Self {
        self.feather_radius = feather_radius;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(CompositeError::invalid_options(
                "threshold",
                format!("must lie in [0, 1], got {}", self.threshold),
            ));
        }
        validate_radius("erode_px", self.erode_px)?;
        validate_radius("dilate_px", self.dilate_px)?;
        validate_radius("feather_radius", self.feather_radius)
    }
}

fn validate_radius(field: &str, value: i32) -> Result<()> {
    if !(0..=i32::from(u8::MAX)).contains(&value) {
        return Err(CompositeError::invalid_options(
            field,
            format!("must lie in [0, 255], got {value}"),
        ));
    }
    Ok(())
}

/// Output of [`refine`].
#[derive(Debug, Clone, PartialEq)]
pub struct RefinedMask {
    pub mask: AlphaMask,
    /// Set when the mask had no boundary to refine; the caller decides whether that is fatal.
    pub degenerate: Option<Degenerate>,
}

pub fn refine(mask: &AlphaMask, options: &RefineOptions) -> Result<RefinedMask> {
    options.validate()?;

    let binary = binarize(mask, options.threshold);
    if let Some(kind) = uniform(&binary) {
        warn!(?kind, "Mask is uniform, skipping refinement");
        return Ok(RefinedMask {
            mask: AlphaMask::from_gray(&binary)?,
            degenerate: Some(kind),
        });
    }

    let opened = open(&binary, options.erode_px as u8, options.dilate_px as u8);
    if let Some(kind) = uniform(&opened) {
        warn!(
            ?kind,
            erode_px = options.erode_px,
            dilate_px = options.dilate_px,
            "Morphology removed the whole boundary"
        );
        return Ok(RefinedMask {
            mask: AlphaMask::from_gray(&opened)?,
            degenerate: Some(kind),
        });
    }

    let filled = fill_holes(&opened, options.min_hole_area);
    let feathered = feather(&AlphaMask::from_gray(&filled)?, options.feather_radius as f32)?;

    Ok(RefinedMask {
        mask: pin_to_silhouette(feathered, &filled, options.threshold)?,
        degenerate: None,
    })
}

/// Keeps the feathered ramp on the right side of `threshold`: foreground
/// pixels stay above it and background pixels at or below it, so binarizing
/// the result at `threshold` gives back `silhouette`.
///
/// The blur alone does not guarantee this near corners, where a convex
/// foreground pixel falls below one half and a concave background pixel
/// rises above it.
fn pin_to_silhouette(feathered: AlphaMask, silhouette: &GrayImage, threshold: f32) -> Result<AlphaMask> {
    if feathered.is_binary() {
        return Ok(feathered);
    }

    let floor = above(threshold);
    let mut buffer = feathered.into_buffer();
    for (value, Luma([side])) in buffer.iter_mut().zip(silhouette.pixels()) {
        *value = if *side == FOREGROUND {
            value.max(floor)
        } else {
            value.min(threshold)
        };
    }
    AlphaMask::new(buffer)
}

/// Smallest `f32` strictly greater than a non-negative `value`.
fn above(value: f32) -> f32 {
    f32::from_bits(value.to_bits() + 1)
}

/// 0/255 mask. Already-binary masks are converted without thresholding.
pub fn binarize(mask: &AlphaMask, threshold: f32) -> GrayImage {
    let binary = mask.is_binary();
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let value = mask.get(x, y);
        let on = if binary { value == 1.0 } else { value > threshold };
        Luma([if on { FOREGROUND } else { BACKGROUND }])
    })
}

fn uniform(binary: &GrayImage) -> Option<Degenerate> {
    let raw = binary.as_raw();
    if raw.iter().all(|&v| v == BACKGROUND) {
        Some(Degenerate::NoForeground)
    } else if raw.iter().all(|&v| v == FOREGROUND) {
        Some(Degenerate::NoBackground)
    } else {
        None
    }
}

fn open(binary: &GrayImage, erode_px: u8, dilate_px: u8) -> GrayImage {
    let eroded = if erode_px > 0 {
        erode(binary, Norm::LInf, erode_px)
    } else {
        binary.clone()
    };
    if dilate_px > 0 {
        dilate(&eroded, Norm::LInf, dilate_px)
    } else {
        eroded
    }
}

/// Fills 4-connected background regions that do not touch the frame and
/// have fewer than `min_area` pixels.
pub fn fill_holes(binary: &GrayImage, min_area: u32) -> GrayImage {
    if min_area == 0 {
        return binary.clone();
    }

    // Labelling the background: foreground pixels act as the separator.
    let labels = connected_components(binary, Connectivity::Four, Luma([FOREGROUND]));
    let (width, height) = binary.dimensions();
    let label_count = labels.iter().copied().max().unwrap_or(0) as usize;

    let mut areas = vec![0u32; label_count + 1];
    let mut touches_frame = vec![false; label_count + 1];
    for (x, y, Luma([label])) in labels.enumerate_pixels() {
        let label = *label as usize;
        if label == 0 {
            continue;
        }
        areas[label] += 1;
        if x == 0 || y == 0 || x == width - 1 || y == height - 1 {
            touches_frame[label] = true;
        }
    }

    let mut filled = binary.clone();
    let mut filled_pixels = 0usize;
    for (pixel, Luma([label])) in filled.pixels_mut().zip(labels.pixels()) {
        let label = *label as usize;
        if label != 0 && !touches_frame[label] && areas[label] < min_area {
            *pixel = Luma([FOREGROUND]);
            filled_pixels += 1;
        }
    }
    debug!(min_area, filled_pixels, "Hole filling done");
    filled
}

/// Gaussian ramp of width `radius` around the boundary, snapped and clamped to `[0,1]`.
pub fn feather(mask: &AlphaMask, radius: f32) -> Result<AlphaMask> {
    if radius <= 0.0 {
        return Ok(mask.clone());
    }

    let mut blurred: MaskBuffer = gaussian_blur(mask.as_buffer(), radius);
    for value in blurred.iter_mut() {
        if *value < SNAP_EPSILON {
            *value = 0.0;
        } else if *value > 1.0 - SNAP_EPSILON {
            *value = 1.0;
        }
    }
    AlphaMask::new(blurred)
}

/// Options for the mask handed to an inpainting delegate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InpaintMaskOptions {
    /// Dilation protecting the product edge from the generator.
    pub expand_px: i32,
    pub feather_px: f32,
}

impl Default for InpaintMaskOptions {
    fn default() -> Self {
        Self {
            expand_px: 10,
            feather_px: 3.0,
        }
    }
}

impl InpaintMaskOptions {
    pub fn validate(&self) -> Result<()> {
        validate_radius("expand_px", self.expand_px)?;
        if !self.feather_px.is_finite() || self.feather_px < 0.0 {
            return Err(CompositeError::invalid_options(
                "feather_px",
                format!("must be a non-negative number, got {}", self.feather_px),
            ));
        }
        Ok(())
    }
}

/// Inverted, expanded mask for inpainting: 1 where the generator may paint, 0 over the product.
pub fn prepare_inpainting_mask(mask: &AlphaMask, options: &InpaintMaskOptions) -> Result<AlphaMask> {
    options.validate()?;

    let binary = binarize(mask, 0.5);
    let expanded = if options.expand_px > 0 {
        dilate(&binary, Norm::LInf, options.expand_px as u8)
    } else {
        binary
    };
    let feathered = feather(&AlphaMask::from_gray(&expanded)?, options.feather_px)?;
    Ok(feathered.invert())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(size: u32, start: u32, side: u32) -> AlphaMask {
        AlphaMask::from_fn(size, size, |x, y| {
            let inside = (start..start + side).contains(&x) && (start..start + side).contains(&y);
            if inside {
                1.0
            } else {
                0.0
            }
        })
        .unwrap()
    }

    fn soft_band_width(mask: &AlphaMask) -> usize {
        mask.values().iter().filter(|&&v| v > 0.0 && v < 1.0).count()
    }

    #[test]
    fn test_negative_options_are_rejected() {
        let mask = square_mask(10, 2, 5);
        let cases = [
            RefineOptions::default().with_feather_radius(-1),
            RefineOptions::default().with_morphology(-1, 0),
            RefineOptions::default().with_morphology(0, -3),
            RefineOptions::default().with_threshold(-0.1),
            RefineOptions::default().with_threshold(f32::NAN),
            RefineOptions::default().with_morphology(300, 0),
        ];
        for options in cases {
            assert!(matches!(
                refine(&mask, &options),
                Err(CompositeError::InvalidOptions { .. })
            ));
        }
    }

    #[test]
    fn test_soft_mask_is_binarized_at_threshold() -> Result<()> {
        let mask = AlphaMask::from_fn(4, 1, |x, _| [0.2, 0.5, 0.51, 0.9][x as usize])?;
        let refined = refine(&mask, &RefineOptions::default())?;
        assert_eq!(refined.mask.values(), &[0.0, 0.0, 1.0, 1.0]);
        assert_eq!(refined.degenerate, None);
        Ok(())
    }

    #[test]
    fn test_binary_mask_ignores_threshold() -> Result<()> {
        let mask = square_mask(8, 2, 4);
        let refined = refine(&mask, &RefineOptions::default().with_threshold(1.0))?;
        assert_eq!(refined.mask, mask);
        Ok(())
    }

    #[test]
    fn test_uniform_masks_are_flagged_and_unchanged() -> Result<()> {
        let options = RefineOptions::default()
            .with_feather_radius(4)
            .with_min_hole_area(10);

        let empty = AlphaMask::filled(12, 12, 0.0)?;
        let refined = refine(&empty, &options)?;
        assert_eq!(refined.mask, empty);
        assert_eq!(refined.degenerate, Some(Degenerate::NoForeground));

        let full = AlphaMask::filled(12, 12, 1.0)?;
        let refined = refine(&full, &options)?;
        assert_eq!(refined.mask, full);
        assert_eq!(refined.degenerate, Some(Degenerate::NoBackground));
        Ok(())
    }

    #[test]
    fn test_erosion_removing_everything_is_flagged() -> Result<()> {
        let mask = square_mask(20, 9, 2);
        let refined = refine(&mask, &RefineOptions::default().with_morphology(3, 3))?;
        assert_eq!(refined.degenerate, Some(Degenerate::NoForeground));
        Ok(())
    }

    #[test]
    fn test_opening_removes_specks_but_keeps_silhouette() -> Result<()> {
        let mut values = square_mask(30, 8, 12).into_buffer();
        values.put_pixel(2, 2, Luma([1.0]));
        let mask = AlphaMask::new(values)?;

        let refined = refine(&mask, &RefineOptions::default().with_morphology(1, 1))?;
        assert_eq!(refined.mask.get(2, 2), 0.0);
        assert_eq!(refined.mask, square_mask(30, 8, 12));
        Ok(())
    }

    #[test]
    fn test_hole_smaller_than_threshold_is_filled() -> Result<()> {
        let mut values = square_mask(20, 4, 12).into_buffer();
        for (x, y) in [(9, 9), (10, 9), (9, 10), (10, 10)] {
            values.put_pixel(x, y, Luma([0.0]));
        }
        let mask = AlphaMask::new(values)?;

        let filled = refine(&mask, &RefineOptions::default().with_min_hole_area(10))?;
        assert_eq!(filled.mask.get(9, 9), 1.0);
        assert_eq!(filled.mask.get(10, 10), 1.0);

        let kept = refine(&mask, &RefineOptions::default().with_min_hole_area(2))?;
        assert_eq!(kept.mask.get(9, 9), 0.0);
        assert_eq!(kept.mask.get(10, 10), 0.0);
        Ok(())
    }

    #[test]
    fn test_background_touching_frame_is_never_filled() -> Result<()> {
        let mask = square_mask(6, 1, 4);
        let refined = refine(&mask, &RefineOptions::default().with_min_hole_area(1000))?;
        assert_eq!(refined.mask.get(0, 0), 0.0);
        assert_eq!(refined.mask.get(5, 5), 0.0);
        Ok(())
    }

    #[test]
    fn test_zero_feather_keeps_hard_edge() -> Result<()> {
        let mask = square_mask(40, 10, 20);
        let refined = refine(&mask, &RefineOptions::default())?;
        assert!(refined.mask.is_binary());
        assert_eq!(refined.mask, mask);
        Ok(())
    }

    #[test]
    fn test_larger_feather_radius_widens_band() -> Result<()> {
        let mask = square_mask(100, 30, 40);
        let mut previous = 0usize;
        for radius in 1..=8 {
            let refined = refine(&mask, &RefineOptions::default().with_feather_radius(radius))?;
            let band = soft_band_width(&refined.mask);
            assert!(
                band > previous,
                "radius {radius}: band {band} not wider than {previous}"
            );
            previous = band;
        }
        Ok(())
    }

    #[test]
    fn test_refinement_is_idempotent_on_refined_output() -> Result<()> {
        let mask = AlphaMask::from_fn(64, 48, |_, y| if y >= 20 { 1.0 } else { 0.0 })?;
        let options = RefineOptions::default()
            .with_morphology(1, 1)
            .with_min_hole_area(8)
            .with_feather_radius(3);

        let once = refine(&mask, &options)?;
        let twice = refine(&once.mask, &options)?;
        for (a, b) in once.mask.values().iter().zip(twice.mask.values()) {
            assert!((a - b).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_refinement_is_idempotent_around_corners() -> Result<()> {
        let square = square_mask(64, 17, 30);
        // L-shaped silhouette: three convex corners and one concave corner.
        let l_shape = AlphaMask::from_fn(64, 64, |x, y| {
            let upright = (12..24).contains(&x) && (10..50).contains(&y);
            let foot = (12..50).contains(&x) && (38..50).contains(&y);
            if upright || foot {
                1.0
            } else {
                0.0
            }
        })?;
        let options = RefineOptions::default()
            .with_morphology(1, 1)
            .with_min_hole_area(8)
            .with_feather_radius(3);

        for mask in [square, l_shape] {
            let once = refine(&mask, &options)?;
            let twice = refine(&once.mask, &options)?;
            assert_eq!(twice.degenerate, None);
            assert_eq!(binarize(&once.mask, options.threshold), binarize(&mask, 0.5));
            for (a, b) in once.mask.values().iter().zip(twice.mask.values()) {
                assert!((a - b).abs() < 1e-6, "{a} vs {b}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_feathered_corner_stays_foreground() -> Result<()> {
        let mask = square_mask(64, 17, 30);
        let refined = refine(&mask, &RefineOptions::default().with_feather_radius(3))?;
        assert!(refined.mask.get(17, 17) > 0.5);
        assert!(refined.mask.get(16, 16) <= 0.5);
        assert!(refined.mask.get(16, 16) > 0.0);
        Ok(())
    }

    #[test]
    fn test_consecutive_radii_each_widen_band() -> Result<()> {
        let mask = square_mask(60, 20, 20);
        let bands: Vec<usize> = (0..=5)
            .map(|radius| {
                refine(&mask, &RefineOptions::default().with_feather_radius(radius))
                    .map(|refined| soft_band_width(&refined.mask))
            })
            .collect::<Result<_>>()?;
        assert_eq!(bands[0], 0);
        assert!(bands.windows(2).all(|w| w[1] > w[0]), "{bands:?}");
        Ok(())
    }

    #[test]
    fn test_feathered_values_stay_in_unit_range() -> Result<()> {
        let mask = square_mask(50, 5, 30);
        let refined = refine(&mask, &RefineOptions::default().with_feather_radius(6))?;
        assert!(refined.mask.values().iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(refined.mask.get(20, 20), 1.0);
        assert_eq!(refined.mask.get(45, 45), 0.0);
        Ok(())
    }

    #[test]
    fn test_inpainting_mask_protects_expanded_product() -> Result<()> {
        let mask = square_mask(40, 15, 10);
        let options = InpaintMaskOptions {
            expand_px: 3,
            feather_px: 0.0,
        };
        let inpaint = prepare_inpainting_mask(&mask, &options)?;

        assert_eq!(inpaint.get(20, 20), 0.0);
        assert_eq!(inpaint.get(13, 20), 0.0);
        assert_eq!(inpaint.get(11, 20), 1.0);
        assert_eq!(inpaint.get(0, 0), 1.0);
        Ok(())
    }
}
