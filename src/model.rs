use std::path::Path;

use image::{imageops, imageops::FilterType, Luma, Rgb, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    errors::{CompositeError, Result},
    imageops::padding::{self, Position},
    raster::{MaskBuffer, RasterImage},
    traits::{AcceleratorAccess, RawAlpha, SegmentationBackend},
};

/// 入力形状が動的なモデルで使う正方形の一辺
pub const DEFAULT_IMAGE_SIZE: u32 = 1024;

/// 推論デバイス
///
/// グローバル状態ではなく、バックエンド構築時に渡す
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda { device_id: i32 },
}

impl Device {
    pub const fn accelerator(self) -> AcceleratorAccess {
        match self {
            Self::Cpu => AcceleratorAccess::None,
            Self::Cuda { device_id } => AcceleratorAccess::Exclusive { device_id },
        }
    }
}

/// モデル内の正方形キャンバス上で画像が占める領域 `[x, y, w, h]`
pub type Crop = [u32; 4];

/// ONNX Runtime によるセグメンテーション
///
/// 入力 NCHW `[1,3,S,S]`（RGB, `[0,1]`）、出力は単一の `[1,1,S,S]` 確信度マップ
pub struct OnnxSegmentationBackend {
    pub image_size: u32,
    device: Device,
    output_name: String,
    session: Mutex<Session>,
}

impl OnnxSegmentationBackend {
    pub fn new(model_path: &Path, device: Device) -> Result<Self> {
        if !model_path.is_file() {
            return Err(CompositeError::ExtractionUnavailable {
                backend: "onnx".to_string(),
                source: Some(Box::new(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("モデルファイルが存在しません: {}", model_path.display()),
                ))),
            });
        }

        let mut session = build_session(model_path, device).map_err(|e| {
            CompositeError::ExtractionUnavailable {
                backend: "onnx".to_string(),
                source: Some(Box::new(e)),
            }
        })?;

        let image_size = session.inputs[0]
            .input_type
            .tensor_shape()
            .and_then(|shape| shape.get(2).copied())
            .filter(|&side| side > 0)
            .map_or(DEFAULT_IMAGE_SIZE, |side| side as u32);
        let output_name = session.outputs[0].name.clone();

        // initialize model
        let data = Array4::<f32>::zeros((1, 3, image_size as usize, image_size as usize));
        session
            .run(ort::inputs![TensorRef::from_array_view(&data)?])
            .map_err(|e| CompositeError::Model {
                operation: "モデル初期化実行".to_string(),
                source: Box::new(e),
            })?;

        info!(
            model = %model_path.display(),
            ?device,
            image_size,
            output = %output_name,
            "Segmentation model loaded"
        );

        Ok(Self {
            image_size,
            device,
            output_name,
            session: Mutex::new(session),
        })
    }

    pub fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![TensorRef::from_array_view(
            &tensor.as_standard_layout()
        )?])?;
        Ok(outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }
}

fn build_session(model_path: &Path, device: Device) -> ort::Result<Session> {
    let builder = SessionBuilder::new()?;
    let builder = match device {
        Device::Cpu => builder,
        Device::Cuda { device_id } => builder.with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
        ])?,
    };
    builder.with_memory_pattern(true)?.commit_from_file(model_path)
}

impl SegmentationBackend for OnnxSegmentationBackend {
    fn segment(&self, image: &RasterImage) -> Result<RawAlpha> {
        let rgb = image.as_dynamic().to_rgb8();
        let (tensor, crop) = preprocess(&rgb, self.image_size)?;
        let mask = self.predict(tensor.view())?;
        postprocess_mask(mask, self.image_size, crop)
    }

    fn name(&self) -> &str {
        "onnx"
    }

    fn accelerator(&self) -> AcceleratorAccess {
        self.device.accelerator()
    }
}

/// アスペクト比を保ったまま縮小し、黒で中央パディングした NCHW テンソル
pub fn preprocess(image: &RgbImage, image_size: u32) -> Result<(Array4<f32>, Crop)> {
    let (width, height) = image.dimensions();
    let scale = image_size as f32 / width.max(height) as f32;
    let w = ((width as f32 * scale).round() as u32).clamp(1, image_size);
    let h = ((height as f32 * scale).round() as u32).clamp(1, image_size);

    let resized = imageops::resize(image, w, h, FilterType::Lanczos3);
    let (canvas, (x, y)) = padding::padding(
        &resized,
        image_size,
        image_size,
        Position::Center,
        Rgb([0, 0, 0]),
    )
    .ok_or_else(|| CompositeError::ImageProcessing {
        path: "unknown".to_string(),
        operation: "パディング追加".to_string(),
        source: format!("{w}x{h} does not fit a {image_size} canvas").into(),
    })?;

    let tensor = canvas
        .as_ndarray3()
        .slice_move(s![NewAxis, .., .., ..])
        .mapv(|v| f32::from(v) / 255.0);
    debug!(x, y, w, h, "Preprocessed segmentation input");

    Ok((tensor, [x, y, w, h]))
}

/// パディング部分を切り落とした確信度マップ（元画像サイズへの拡大は呼び出し側）
pub fn postprocess_mask(mask: Array4<f32>, image_size: u32, crop: Crop) -> Result<MaskBuffer> {
    let [x, y, w, h] = crop;
    let shape = mask.shape().to_vec();
    if shape[2] != image_size as usize || shape[3] != image_size as usize {
        return Err(CompositeError::Model {
            operation: "モデル出力形状確認".to_string(),
            source: format!("unexpected output shape {shape:?}").into(),
        });
    }

    let plane: Vec<f32> = mask.slice(s![0, 0, .., ..]).iter().copied().collect();
    let full = MaskBuffer::from_raw(image_size, image_size, plane).ok_or_else(|| {
        CompositeError::Model {
            operation: "マスクバッファ作成".to_string(),
            source: "output plane has the wrong length".into(),
        }
    })?;
    Ok(imageops::crop_imm(&full, x, y, w, h).to_image())
}

/// 背景色との距離による決定的なセグメンテーション
///
/// 四隅の平均色を背景色とみなす。単色背景のスタジオ写真向け
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdSegmentationBackend {
    tolerance: f32,
    softness: f32,
}

impl Default for ThresholdSegmentationBackend {
    fn default() -> Self {
        Self {
            tolerance: 0.1,
            softness: 0.1,
        }
    }
}

impl ThresholdSegmentationBackend {
    /// `tolerance` 以下の距離は背景、さらに `softness` かけて前景へ移行する
    pub fn new(tolerance: f32, softness: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&tolerance) {
            return Err(CompositeError::invalid_options(
                "tolerance",
                format!("must be within [0,1], got {tolerance}"),
            ));
        }
        if !softness.is_finite() || softness < 0.0 {
            return Err(CompositeError::invalid_options(
                "softness",
                format!("must be a non-negative number, got {softness}"),
            ));
        }
        Ok(Self {
            tolerance,
            softness,
        })
    }

    fn confidence(&self, distance: f32) -> f32 {
        if self.softness == 0.0 {
            return if distance > self.tolerance { 1.0 } else { 0.0 };
        }
        ((distance - self.tolerance) / self.softness).clamp(0.0, 1.0)
    }
}

/// 四隅のパッチ（短辺の 1/20、最低 1px）の平均色
pub fn estimate_backdrop(image: &RgbImage) -> [f32; 3] {
    let (width, height) = image.dimensions();
    let patch = (width.min(height) / 20).max(1);
    let corners = [
        (0, 0),
        (width - patch, 0),
        (0, height - patch),
        (width - patch, height - patch),
    ];

    let mut sum = [0f64; 3];
    let mut count = 0u64;
    for (cx, cy) in corners {
        for y in cy..cy + patch {
            for x in cx..cx + patch {
                let Rgb(rgb) = image.get_pixel(x, y);
                for c in 0..3 {
                    sum[c] += f64::from(rgb[c]);
                }
                count += 1;
            }
        }
    }
    sum.map(|s| (s / count as f64 / 255.0) as f32)
}

impl SegmentationBackend for ThresholdSegmentationBackend {
    fn segment(&self, image: &RasterImage) -> Result<RawAlpha> {
        let rgb = image.as_dynamic().to_rgb8();
        let backdrop = estimate_backdrop(&rgb);
        debug!(?backdrop, tolerance = self.tolerance, "Estimated backdrop colour");

        Ok(RawAlpha::from_fn(rgb.width(), rgb.height(), |x, y| {
            let Rgb(pixel) = rgb.get_pixel(x, y);
            let squared: f32 = (0..3)
                .map(|c| (f32::from(pixel[c]) / 255.0 - backdrop[c]).powi(2))
                .sum();
            let distance = (squared / 3.0).sqrt();
            Luma([self.confidence(distance)])
        }))
    }

    fn name(&self) -> &str {
        "threshold"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;

    fn studio_shot() -> RasterImage {
        RasterImage::new(DynamicImage::ImageRgb8(RgbImage::from_fn(40, 30, |x, y| {
            if (10..30).contains(&x) && (8..22).contains(&y) {
                Rgb([200, 30, 30])
            } else {
                Rgb([245, 245, 245])
            }
        })))
        .unwrap()
    }

    #[test]
    fn test_missing_model_is_unavailable() {
        let result = OnnxSegmentationBackend::new(Path::new("does/not/exist.onnx"), Device::Cpu);
        assert!(matches!(
            result,
            Err(CompositeError::ExtractionUnavailable { .. })
        ));
    }

    #[test]
    fn test_device_accelerator_mapping() {
        assert_eq!(Device::Cpu.accelerator(), AcceleratorAccess::None);
        assert_eq!(
            Device::Cuda { device_id: 2 }.accelerator(),
            AcceleratorAccess::Exclusive { device_id: 2 }
        );
    }

    #[test]
    fn test_preprocess_pads_to_square() -> Result<()> {
        let image = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));
        let (tensor, crop) = preprocess(&image, 64)?;

        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
        assert_eq!(crop, [0, 16, 64, 32]);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert!((tensor[[0, 1, 32, 32]] - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_postprocess_crops_padding() -> Result<()> {
        let mut output = Array4::<f32>::zeros((1, 1, 8, 8));
        output.slice_mut(s![0, 0, 2..6, ..]).fill(1.0);

        let mask = postprocess_mask(output, 8, [0, 2, 8, 4])?;
        assert_eq!(mask.dimensions(), (8, 4));
        assert!(mask.pixels().all(|p| p[0] == 1.0));
        Ok(())
    }

    #[test]
    fn test_postprocess_rejects_wrong_shape() {
        let output = Array4::<f32>::zeros((1, 1, 4, 4));
        assert!(postprocess_mask(output, 8, [0, 0, 8, 8]).is_err());
    }

    #[test]
    fn test_backdrop_estimate_uses_corners() {
        let image = studio_shot().as_dynamic().to_rgb8();
        let backdrop = estimate_backdrop(&image);
        for channel in backdrop {
            assert!((channel - 245.0 / 255.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_threshold_backend_separates_product() -> Result<()> {
        let backend = ThresholdSegmentationBackend::default();
        let raw = backend.segment(&studio_shot())?;

        assert_eq!(raw.dimensions(), (40, 30));
        assert_eq!(raw.get_pixel(20, 15)[0], 1.0);
        assert_eq!(raw.get_pixel(2, 2)[0], 0.0);
        assert_eq!(raw.get_pixel(35, 25)[0], 0.0);
        Ok(())
    }

    #[test]
    fn test_threshold_backend_hard_edge() -> Result<()> {
        let backend = ThresholdSegmentationBackend::new(0.05, 0.0)?;
        let raw = backend.segment(&studio_shot())?;
        assert!(raw.pixels().all(|p| p[0] == 0.0 || p[0] == 1.0));
        Ok(())
    }

    #[test]
    fn test_threshold_backend_rejects_bad_parameters() {
        assert!(ThresholdSegmentationBackend::new(1.5, 0.1).is_err());
        assert!(ThresholdSegmentationBackend::new(0.1, -1.0).is_err());
        assert!(ThresholdSegmentationBackend::new(0.1, f32::NAN).is_err());
    }
}
