use imageproc::filter::separable_filter_equal;

use crate::raster::MaskBuffer;

/// Normalized 1-D Gaussian kernel covering `ceil(radius)` pixels on each side.
///
/// σ is `radius / 2`, so the kernel support ends at 2σ and the width of the
/// softened band grows by exactly one pixel per unit of radius.
pub fn gaussian_kernel(radius: f32) -> Vec<f32> {
    if radius <= 0.0 || !radius.is_finite() {
        return vec![1.0];
    }

    let extent = radius.ceil() as i64;
    let sigma = radius / 2.0;
    let denominator = 2.0 * sigma * sigma;

    let mut kernel: Vec<f32> = (-extent..=extent)
        .map(|i| (-((i * i) as f32) / denominator).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= sum);
    kernel
}

/// Separable Gaussian blur with clamp-to-edge sampling.
pub fn gaussian_blur(buffer: &MaskBuffer, radius: f32) -> MaskBuffer {
    let kernel = gaussian_kernel(radius);
    if kernel.len() == 1 {
        return buffer.clone();
    }
    separable_filter_equal(buffer, &kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_kernel_is_normalized_and_symmetric() {
        for radius in [0.5f32, 1.0, 3.0, 7.5] {
            let kernel = gaussian_kernel(radius);
            assert_eq!(kernel.len(), 2 * radius.ceil() as usize + 1);
            let sum: f32 = kernel.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            let n = kernel.len();
            for i in 0..n / 2 {
                assert!((kernel[i] - kernel[n - 1 - i]).abs() < 1e-7);
            }
        }
    }

    #[test]
    fn test_zero_radius_is_identity() {
        let buffer = MaskBuffer::from_fn(5, 5, |x, _| Luma([x as f32 / 4.0]));
        assert_eq!(gaussian_blur(&buffer, 0.0), buffer);
    }

    #[test]
    fn test_blur_preserves_constant_image() {
        let buffer = MaskBuffer::from_pixel(9, 7, Luma([0.75]));
        let blurred = gaussian_blur(&buffer, 3.0);
        for value in blurred.iter() {
            assert!((value - 0.75).abs() < 1e-5);
        }
    }

    #[test]
    fn test_blur_spreads_a_step_by_its_radius() {
        let buffer = MaskBuffer::from_fn(40, 1, |x, _| Luma([if x < 20 { 1.0 } else { 0.0 }]));
        let blurred = gaussian_blur(&buffer, 4.0);

        assert!(blurred.get_pixel(15, 0)[0] >= 1.0 - 1e-5);
        assert!(blurred.get_pixel(16, 0)[0] < 1.0);
        assert!(blurred.get_pixel(23, 0)[0] > 0.0);
        assert_eq!(blurred.get_pixel(24, 0)[0], 0.0);
    }
}
