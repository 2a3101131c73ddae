use image::{GenericImageView, ImageBuffer, Luma, Pixel, Primitive, Rgb, Rgba};
use num_traits::AsPrimitive;

use crate::errors::{CompositeError, Result};
use crate::imageops::get_max_value;

/// Attaches `mask` as the alpha channel of `image`.
///
/// With `premultiply` the colour channels are scaled by alpha as well, which
/// is what a cut-out preview wants; without it colours are kept untouched.
pub fn apply<I, M, SI, SM>(
    image: &I,
    mask: &M,
    premultiply: bool,
) -> Result<ImageBuffer<Rgba<SI>, Vec<SI>>>
where
    I: GenericImageView<Pixel = Rgb<SI>>,
    M: GenericImageView<Pixel = Luma<SM>>,
    Rgba<SI>: Pixel<Subpixel = SI>,
    SI: Primitive + 'static + AsPrimitive<f32>,
    SM: Primitive + 'static + AsPrimitive<f32>,
    f32: AsPrimitive<SI>,
    f32: AsPrimitive<SM>,
{
    if image.dimensions() != mask.dimensions() {
        return Err(CompositeError::dimension_mismatch(
            "mask",
            image.dimensions(),
            mask.dimensions(),
        ));
    }

    let sm_max: f32 = get_max_value::<SM>().as_();
    let si_max: f32 = get_max_value::<SI>().as_();

    let processed_pixels = image
        .pixels()
        .zip(mask.pixels())
        .flat_map(|(image_pixel, mask_pixel)| {
            let Rgb([red, green, blue]) = image_pixel.2;
            let coverage = mask_pixel.2 .0[0].as_() / sm_max;
            let alpha: SI = (coverage * si_max).as_();

            if premultiply {
                [red, green, blue]
                    .iter()
                    .map(|&c| (c.as_() * coverage).as_())
                    .chain(std::iter::once(alpha))
                    .collect::<Vec<SI>>()
            } else {
                vec![red, green, blue, alpha]
            }
        })
        .collect::<Vec<SI>>();

    ImageBuffer::from_raw(image.width(), image.height(), processed_pixels).ok_or_else(|| {
        CompositeError::invalid_input("processed pixel count does not match image dimensions")
    })
}
