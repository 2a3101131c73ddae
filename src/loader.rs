//! Image ingestion and output.

use std::fs;
use std::path::Path;

use image::{
    imageops::FilterType, DynamicImage, ImageDecoder, ImageFormat, ImageReader, Rgb, RgbImage,
};
use tracing::debug;

use crate::errors::{CompositeError, Result};
use crate::raster::RasterImage;

pub const DEFAULT_MAX_DIMENSION: u32 = 2048;

const SUPPORTED_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "webp", "bmp", "gif", "tiff", "avif"];

pub fn is_supported_format(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Decodes `path` into an upright, opaque 8-bit RGB raster whose longest side is at most `max_dimension`.
///
/// Transparent pixels are composited onto white. A `max_dimension` of 0 disables downscaling.
pub fn load_image(path: &Path, max_dimension: u32) -> Result<RasterImage> {
    let image_error = |operation: &str, source: image::ImageError| CompositeError::ImageProcessing {
        path: path.display().to_string(),
        operation: operation.to_string(),
        source: Box::new(source),
    };

    let reader = ImageReader::open(path)
        .map_err(|e| CompositeError::FileSystem {
            path: path.to_path_buf(),
            operation: "画像ファイルを開く".to_string(),
            source: e,
        })?
        .with_guessed_format()
        .map_err(|e| CompositeError::FileSystem {
            path: path.to_path_buf(),
            operation: "画像形式の判定".to_string(),
            source: e,
        })?;

    let mut decoder = reader
        .into_decoder()
        .map_err(|e| image_error("デコーダー作成", e))?;
    let orientation = decoder
        .orientation()
        .map_err(|e| image_error("EXIF 向き取得", e))?;
    let mut image = DynamicImage::from_decoder(decoder).map_err(|e| image_error("画像デコード", e))?;
    image.apply_orientation(orientation);

    let rgb = flatten_onto_white(&image);
    let rgb = downscale(rgb, max_dimension);
    debug!(path = %path.display(), width = rgb.width(), height = rgb.height(), "Loaded image");

    RasterImage::new(DynamicImage::ImageRgb8(rgb))
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = f32::from(a) / 255.0;
        let over = |c: u8| (f32::from(c) * alpha + 255.0 * (1.0 - alpha)).round() as u8;
        Rgb([over(r), over(g), over(b)])
    })
}

fn downscale(image: RgbImage, max_dimension: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let longest = width.max(height);
    if max_dimension == 0 || longest <= max_dimension {
        return image;
    }

    let scale = max_dimension as f64 / longest as f64;
    let new_width = ((width as f64 * scale).round() as u32).max(1);
    let new_height = ((height as f64 * scale).round() as u32).max(1);
    debug!(width, height, new_width, new_height, "Downscaling oversized image");
    image::imageops::resize(&image, new_width, new_height, FilterType::Lanczos3)
}

/// Output format for `path`'s extension; unknown or read-only formats fall back to PNG.
pub fn output_format(path: &Path) -> ImageFormat {
    ImageFormat::from_path(path)
        .ok()
        .filter(|format| format.writing_enabled())
        .unwrap_or(ImageFormat::Png)
}

/// Saves `image` next to any missing parent directories.
///
/// Float images are written as 16-bit when the format cannot hold floats.
pub fn save_image(image: &DynamicImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| CompositeError::FileSystem {
            path: parent.to_path_buf(),
            operation: "出力ディレクトリ作成".to_string(),
            source: e,
        })?;
    }

    let format = output_format(path);
    let encodable = match (format, image) {
        (ImageFormat::Jpeg, _) => DynamicImage::ImageRgb8(image.to_rgb8()),
        (ImageFormat::Png, DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_)) => {
            DynamicImage::ImageRgb16(image.to_rgb16())
        }
        (ImageFormat::Png, _) => image.clone(),
        _ => DynamicImage::ImageRgb8(image.to_rgb8()),
    };

    encodable
        .save_with_format(path, format)
        .map_err(|e| CompositeError::ImageProcessing {
            path: path.display().to_string(),
            operation: "画像保存".to_string(),
            source: Box::new(e),
        })
}
