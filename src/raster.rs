use image::{ColorType, DynamicImage, GrayImage, ImageBuffer, Luma, Rgb32FImage};

use crate::errors::{CompositeError, Result};

/// Single-channel float buffer used for every alpha map in the crate.
pub type MaskBuffer = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Sample precision of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDepth {
    U8,
    U16,
    F32,
}

/// Validated, decoded raster.
///
/// Width and height are non-zero and the channel count is 1, 3 or 4. The
/// buffer is never handed out mutably; stages that change pixels work on their
/// own copies.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImage {
    inner: DynamicImage,
    depth: SampleDepth,
}

impl RasterImage {
    pub fn new(image: DynamicImage) -> Result<Self> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(CompositeError::invalid_input(format!(
                "image has degenerate dimensions {width}x{height}"
            )));
        }

        let depth = match image.color() {
            ColorType::L8 | ColorType::Rgb8 | ColorType::Rgba8 => SampleDepth::U8,
            ColorType::L16 | ColorType::Rgb16 | ColorType::Rgba16 => SampleDepth::U16,
            ColorType::Rgb32F | ColorType::Rgba32F => SampleDepth::F32,
            other => {
                return Err(CompositeError::invalid_input(format!(
                    "unsupported channel layout {other:?} (expected 1, 3 or 4 channels)"
                )))
            }
        };

        Ok(Self {
            inner: image,
            depth,
        })
    }

    pub fn width(&self) -> u32 {
        self.inner.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.inner.width(), self.inner.height())
    }

    pub fn channel_count(&self) -> u8 {
        self.inner.color().channel_count()
    }

    pub const fn depth(&self) -> SampleDepth {
        self.depth
    }

    pub const fn as_dynamic(&self) -> &DynamicImage {
        &self.inner
    }

    pub fn into_dynamic(self) -> DynamicImage {
        self.inner
    }

    /// Gamma-encoded RGB samples normalized to `[0,1]` (float sources are passed through as-is).
    pub fn to_rgb32f(&self) -> Rgb32FImage {
        match &self.inner {
            DynamicImage::ImageRgb32F(buffer) => buffer.clone(),
            other => other.to_rgb32f(),
        }
    }
}

/// Why a mask carried no boundary to refine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degenerate {
    /// Every pixel is background.
    NoForeground,
    /// Every pixel is foreground.
    NoBackground,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }
}

/// Per-pixel foreground opacity in `[0,1]`: 0 is pure background, 1 pure foreground.
#[derive(Debug, Clone, PartialEq)]
pub struct AlphaMask {
    buffer: MaskBuffer,
}

impl AlphaMask {
    /// Wraps a buffer, replacing non-finite values with 0 and clamping the rest to `[0,1]`.
    pub fn new(mut buffer: MaskBuffer) -> Result<Self> {
        if buffer.width() == 0 || buffer.height() == 0 {
            return Err(CompositeError::invalid_input(format!(
                "mask has degenerate dimensions {}x{}",
                buffer.width(),
                buffer.height()
            )));
        }
        for value in buffer.iter_mut() {
            *value = if value.is_finite() {
                value.clamp(0.0, 1.0)
            } else {
                0.0
            };
        }
        Ok(Self { buffer })
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Result<Self> {
        Self::new(ImageBuffer::from_pixel(width, height, Luma([value])))
    }

    pub fn from_fn<F>(width: u32, height: u32, f: F) -> Result<Self>
    where
        F: Fn(u32, u32) -> f32,
    {
        Self::new(ImageBuffer::from_fn(width, height, |x, y| Luma([f(x, y)])))
    }

    pub fn from_gray(gray: &GrayImage) -> Result<Self> {
        Self::new(ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
            Luma([f32::from(gray.get_pixel(x, y)[0]) / 255.0])
        }))
    }

    pub fn to_gray(&self) -> GrayImage {
        ImageBuffer::from_fn(self.width(), self.height(), |x, y| {
            Luma([(self.get(x, y) * 255.0).round() as u8])
        })
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.buffer.dimensions()
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.buffer.get_pixel(x, y)[0]
    }

    pub fn values(&self) -> &[f32] {
        self.buffer.as_raw()
    }

    pub const fn as_buffer(&self) -> &MaskBuffer {
        &self.buffer
    }

    pub fn into_buffer(self) -> MaskBuffer {
        self.buffer
    }

    pub fn is_binary(&self) -> bool {
        self.values().iter().all(|&v| v == 0.0 || v == 1.0)
    }

    /// `Some` when every pixel is exactly 0 or every pixel is exactly 1.
    pub fn degenerate(&self) -> Option<Degenerate> {
        let values = self.values();
        if values.iter().all(|&v| v == 0.0) {
            Some(Degenerate::NoForeground)
        } else if values.iter().all(|&v| v == 1.0) {
            Some(Degenerate::NoBackground)
        } else {
            None
        }
    }

    /// Smallest rectangle holding every pixel with non-zero alpha.
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let mut bounds: Option<[u32; 4]> = None;
        for (x, y, pixel) in self.buffer.enumerate_pixels() {
            if pixel[0] <= 0.0 {
                continue;
            }
            let b = bounds.get_or_insert([x, y, x, y]);
            b[0] = b[0].min(x);
            b[1] = b[1].min(y);
            b[2] = b[2].max(x);
            b[3] = b[3].max(y);
        }

        bounds.map(|[x1, y1, x2, y2]| BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1 + 1,
            height: y2 - y1 + 1,
        })
    }

    /// Fraction of the frame covered by foreground, weighted by alpha.
    pub fn coverage(&self) -> f32 {
        let values = self.values();
        values.iter().map(|&v| f64::from(v)).sum::<f64>() as f32 / values.len() as f32
    }

    pub fn invert(&self) -> Self {
        let mut buffer = self.buffer.clone();
        for value in buffer.iter_mut() {
            *value = 1.0 - *value;
        }
        Self { buffer }
    }
}
