use image::{imageops, GenericImageView, ImageBuffer, Pixel, Primitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    TopLeft,
    Center,
}

/// Offset that places a `width`x`height` image inside a `pad_width`x`pad_height` canvas.
pub fn to_position(
    width: u32,
    height: u32,
    pad_width: u32,
    pad_height: u32,
    position: Position,
) -> Option<(u32, u32)> {
    if width > pad_width || height > pad_height {
        return None;
    }

    Some(match position {
        Position::TopLeft => (0, 0),
        Position::Center => ((pad_width - width) / 2, (pad_height - height) / 2),
    })
}

pub fn padding<I, P, S>(
    image: &I,
    pad_width: u32,
    pad_height: u32,
    position: Position,
    color: P,
) -> Option<(ImageBuffer<P, Vec<S>>, (u32, u32))>
where
    I: GenericImageView<Pixel = P>,
    P: Pixel<Subpixel = S>,
    S: Primitive,
{
    let (width, height) = image.dimensions();

    to_position(width, height, pad_width, pad_height, position).map(|(x, y)| {
        let mut canvas = ImageBuffer::from_pixel(pad_width, pad_height, color);
        imageops::overlay(&mut canvas, image, i64::from(x), i64::from(y));
        (canvas, (x, y))
    })
}

/// Pads to a square whose side is the longer image side; returns the canvas and the image offset.
pub fn square<I, P, S>(
    image: &I,
    position: Position,
    color: P,
) -> Option<(ImageBuffer<P, Vec<S>>, (u32, u32))>
where
    I: GenericImageView<Pixel = P>,
    P: Pixel<Subpixel = S>,
    S: Primitive,
{
    let (width, height) = image.dimensions();
    let side = width.max(height);
    padding(image, side, side, position, color)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_square_centers_image() {
        let image = RgbImage::from_pixel(4, 2, Rgb([9, 9, 9]));
        let (canvas, offset) = square(&image, Position::Center, Rgb([0, 0, 0])).unwrap();

        assert_eq!(canvas.dimensions(), (4, 4));
        assert_eq!(offset, (0, 1));
        assert_eq!(canvas.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(canvas.get_pixel(0, 1).0, [9, 9, 9]);
        assert_eq!(canvas.get_pixel(3, 2).0, [9, 9, 9]);
        assert_eq!(canvas.get_pixel(3, 3).0, [0, 0, 0]);
    }

    #[test]
    fn test_padding_rejects_smaller_canvas() {
        let image = RgbImage::new(5, 5);
        assert!(padding(&image, 4, 8, Position::TopLeft, Rgb([0, 0, 0])).is_none());
    }
}
