//! Background sources that need no generative model.

use std::path::{Path, PathBuf};

use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use tracing::debug;

use crate::errors::{CompositeError, Result};
use crate::loader::load_image;
use crate::raster::{AlphaMask, RasterImage};
use crate::traits::{BackgroundGenerator, GenerateOptions, InpaintingDelegate};

/// Resizes `background` to exactly `width`x`height`, cropping to keep its aspect ratio.
pub fn align_background(background: &RasterImage, width: u32, height: u32) -> Result<RasterImage> {
    if background.dimensions() == (width, height) {
        return Ok(background.clone());
    }
    debug!(
        from = ?background.dimensions(),
        to = ?(width, height),
        "Aligning background plate"
    );
    RasterImage::new(
        background
            .as_dynamic()
            .resize_to_fill(width, height, FilterType::Lanczos3),
    )
}

/// Flat studio backdrop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolidColorBackground {
    pub color: [u8; 3],
}

impl SolidColorBackground {
    pub const fn new(color: [u8; 3]) -> Self {
        Self { color }
    }
}

impl Default for SolidColorBackground {
    fn default() -> Self {
        Self::new([255, 255, 255])
    }
}

impl BackgroundGenerator for SolidColorBackground {
    fn generate(
        &self,
        _prompt: &str,
        _mask: Option<&AlphaMask>,
        options: &GenerateOptions,
    ) -> Result<RasterImage> {
        RasterImage::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            options.width,
            options.height,
            Rgb(self.color),
        )))
    }
}

/// Background plate loaded from disk once and fitted to each request.
#[derive(Debug, Clone)]
pub struct ImageFileBackground {
    path: PathBuf,
    plate: RasterImage,
}

impl ImageFileBackground {
    pub fn open(path: &Path) -> Result<Self> {
        let plate = load_image(path, 0).map_err(|e| CompositeError::BackgroundUnavailable {
            operation: format!("loading background plate {}", path.display()),
            source: Box::new(e),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            plate,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackgroundGenerator for ImageFileBackground {
    fn generate(
        &self,
        _prompt: &str,
        _mask: Option<&AlphaMask>,
        options: &GenerateOptions,
    ) -> Result<RasterImage> {
        align_background(&self.plate, options.width, options.height)
    }
}

/// Paints the region to regenerate with a flat colour, feathered by the inpainting mask.
///
/// A local stand-in for a generative inpainting service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolidFillInpainter {
    pub color: [u8; 3],
}

impl InpaintingDelegate for SolidFillInpainter {
    fn inpaint(
        &self,
        image: &RasterImage,
        inpaint_mask: &AlphaMask,
        _prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<RasterImage> {
        if inpaint_mask.dimensions() != image.dimensions() {
            return Err(CompositeError::dimension_mismatch(
                "inpainting mask",
                image.dimensions(),
                inpaint_mask.dimensions(),
            ));
        }

        let source = image.as_dynamic().to_rgb8();
        let painted = RgbImage::from_fn(source.width(), source.height(), |x, y| {
            let weight = inpaint_mask.get(x, y);
            let Rgb(original) = *source.get_pixel(x, y);
            let mut out = [0u8; 3];
            for c in 0..3 {
                let mixed = f32::from(original[c]) * (1.0 - weight) + f32::from(self.color[c]) * weight;
                out[c] = mixed.round().clamp(0.0, 255.0) as u8;
            }
            Rgb(out)
        });
        RasterImage::new(DynamicImage::ImageRgb8(painted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::save_image;
    use tempfile::TempDir;

    fn raster(width: u32, height: u32) -> RasterImage {
        RasterImage::new(DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, _| {
            Rgb([(x % 256) as u8, 0, 0])
        })))
        .unwrap()
    }

    #[test]
    fn test_align_keeps_matching_size() -> Result<()> {
        let plate = raster(8, 6);
        assert_eq!(align_background(&plate, 8, 6)?, plate);
        Ok(())
    }

    #[test]
    fn test_align_fills_requested_size() -> Result<()> {
        let plate = raster(40, 10);
        let aligned = align_background(&plate, 20, 20)?;
        assert_eq!(aligned.dimensions(), (20, 20));
        Ok(())
    }

    #[test]
    fn test_solid_background_matches_request() -> Result<()> {
        let generator = SolidColorBackground::new([10, 20, 30]);
        let image = generator.generate("ignored", None, &GenerateOptions::new(5, 3))?;
        assert_eq!(image.dimensions(), (5, 3));
        assert_eq!(image.as_dynamic().to_rgb8().get_pixel(4, 2).0, [10, 20, 30]);
        Ok(())
    }

    #[test]
    fn test_image_file_background() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("plate.png");
        save_image(raster(64, 32).as_dynamic(), &path)?;

        let generator = ImageFileBackground::open(&path)?;
        assert_eq!(generator.path(), path.as_path());
        let image = generator.generate("", None, &GenerateOptions::new(16, 16))?;
        assert_eq!(image.dimensions(), (16, 16));
        Ok(())
    }

    #[test]
    fn test_missing_plate_is_background_unavailable() {
        assert!(matches!(
            ImageFileBackground::open(Path::new("/nonexistent/plate.png")),
            Err(CompositeError::BackgroundUnavailable { .. })
        ));
    }

    #[test]
    fn test_solid_fill_respects_mask() -> Result<()> {
        let image = raster(4, 1);
        let mask = AlphaMask::from_fn(4, 1, |x, _| if x < 2 { 0.0 } else { 1.0 })?;
        let filler = SolidFillInpainter { color: [0, 255, 0] };

        let painted = filler
            .inpaint(&image, &mask, "", &GenerateOptions::new(4, 1))?.as_dynamic().to_rgb8();
        assert_eq!(painted.get_pixel(1, 0).0, [1, 0, 0]);
        assert_eq!(painted.get_pixel(3, 0).0, [0, 255, 0]);
        Ok(())
    }
}
