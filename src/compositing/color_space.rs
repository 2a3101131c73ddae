//! sRGB transfer functions and sample quantization.
//!
//! Blending gamma-encoded samples darkens (or lightens) every partially
//! transparent pixel, which shows up as a halo along the mask boundary. All
//! blending arithmetic therefore goes through these functions.

use image::{ImageBuffer, Rgb, Rgb32FImage};
use serde::{Deserialize, Serialize};

/// Rec. 709 / sRGB luma weights, applied to linear samples.
pub const LUMA_WEIGHTS: [f32; 3] = [0.2126, 0.7152, 0.0722];

pub fn srgb_to_linear(encoded: f32) -> f32 {
    if encoded <= 0.04045 {
        encoded / 12.92
    } else {
        ((encoded + 0.055) / 1.055).powf(2.4)
    }
}

pub fn linear_to_srgb(linear: f32) -> f32 {
    if linear <= 0.003_130_8 {
        linear * 12.92
    } else {
        1.055 * linear.powf(1.0 / 2.4) - 0.055
    }
}

/// Space in which blend arithmetic happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendSpace {
    /// Decode sRGB before blending, re-encode afterwards.
    Linear,
    /// Blend the stored samples directly.
    Gamma,
}

impl BlendSpace {
    pub fn decode(self, encoded: f32) -> f32 {
        match self {
            Self::Linear => srgb_to_linear(encoded),
            Self::Gamma => encoded,
        }
    }

    pub fn encode(self, value: f32) -> f32 {
        match self {
            Self::Linear => linear_to_srgb(value),
            Self::Gamma => value,
        }
    }

    pub fn decode_image(self, image: &Rgb32FImage) -> Rgb32FImage {
        match self {
            Self::Linear => ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
                Rgb(image.get_pixel(x, y).0.map(srgb_to_linear))
            }),
            Self::Gamma => image.clone(),
        }
    }
}

pub fn luminance([r, g, b]: [f32; 3]) -> f32 {
    LUMA_WEIGHTS[0] * r + LUMA_WEIGHTS[1] * g + LUMA_WEIGHTS[2] * b
}

pub fn quantize_u8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub fn quantize_u16(value: f32) -> u16 {
    (value.clamp(0.0, 1.0) * 65535.0).round() as u16
}

/// Replaces non-finite and out-of-range values; the flag reports whether anything changed.
pub fn sanitize(value: f32) -> (f32, bool) {
    if value.is_nan() {
        (0.0, true)
    } else if value < 0.0 {
        (0.0, true)
    } else if value > 1.0 {
        (1.0, true)
    } else {
        (value, false)
    }
}
