use image::{DynamicImage, Rgb, RgbImage};
use parking_lot::Mutex;

use crate::errors::{CompositeError, Result};
use crate::raster::{AlphaMask, RasterImage};
use crate::traits::{
    AcceleratorAccess, BackgroundGenerator, GenerateOptions, InpaintingDelegate, RawAlpha,
    SegmentationBackend,
};

/// テスト用のモックセグメンテーションバックエンド
///
/// 入力画像に関係なく、あらかじめ与えた確信度マップを返す
#[derive(Debug, Clone)]
pub struct MockSegmentationBackend {
    raw: Option<RawAlpha>,
    accelerator: AcceleratorAccess,
}

impl MockSegmentationBackend {
    pub const fn new(raw: RawAlpha) -> Self {
        Self {
            raw: Some(raw),
            accelerator: AcceleratorAccess::None,
        }
    }

    /// 常に `ExtractionUnavailable` を返すバックエンド
    pub const fn unavailable() -> Self {
        Self {
            raw: None,
            accelerator: AcceleratorAccess::None,
        }
    }

    pub const fn with_accelerator(mut self, accelerator: AcceleratorAccess) -> Self {
        self.accelerator = accelerator;
        self
    }
}

impl SegmentationBackend for MockSegmentationBackend {
    fn segment(&self, _image: &RasterImage) -> Result<RawAlpha> {
        self.raw
            .clone()
            .ok_or_else(|| CompositeError::unavailable(self.name()))
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn accelerator(&self) -> AcceleratorAccess {
        self.accelerator
    }
}

/// テスト用の単色背景ジェネレーター
///
/// 受け取ったプロンプトを記録する
#[derive(Debug, Default)]
pub struct MockBackgroundGenerator {
    color: Option<[u8; 3]>,
    prompts: Mutex<Vec<String>>,
    seeds: Mutex<Vec<Option<u64>>>,
}

impl MockBackgroundGenerator {
    pub fn new(color: [u8; 3]) -> Self {
        Self {
            color: Some(color),
            prompts: Mutex::new(Vec::new()),
            seeds: Mutex::new(Vec::new()),
        }
    }

    /// 常に `BackgroundUnavailable` を返すジェネレーター
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// 受け取ったシード（呼び出し順）
    pub fn seeds(&self) -> Vec<Option<u64>> {
        self.seeds.lock().clone()
    }
}

impl BackgroundGenerator for MockBackgroundGenerator {
    fn generate(
        &self,
        prompt: &str,
        _mask: Option<&AlphaMask>,
        options: &GenerateOptions,
    ) -> Result<RasterImage> {
        self.prompts.lock().push(prompt.to_string());
        self.seeds.lock().push(options.seed);
        let color = self.color.ok_or_else(|| CompositeError::BackgroundUnavailable {
            operation: "mock background generation".to_string(),
            source: "generator configured to fail".into(),
        })?;
        RasterImage::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            options.width,
            options.height,
            Rgb(color),
        )))
    }
}

/// テスト用のインペインティング
///
/// 生成領域（マスク > 0.5）を単色で塗りつぶし、それ以外は入力をそのまま残す
#[derive(Debug, Default)]
pub struct MockInpaintingDelegate {
    color: Option<[u8; 3]>,
}

impl MockInpaintingDelegate {
    pub const fn new(color: [u8; 3]) -> Self {
        Self { color: Some(color) }
    }

    pub const fn failing() -> Self {
        Self { color: None }
    }
}

impl InpaintingDelegate for MockInpaintingDelegate {
    fn inpaint(
        &self,
        image: &RasterImage,
        inpaint_mask: &AlphaMask,
        _prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<RasterImage> {
        let color = self.color.ok_or_else(|| CompositeError::BackgroundUnavailable {
            operation: "mock inpainting".to_string(),
            source: "delegate configured to fail".into(),
        })?;
        let mut painted = image.as_dynamic().to_rgb8();
        for (x, y, pixel) in painted.enumerate_pixels_mut() {
            if inpaint_mask.get(x, y) > 0.5 {
                *pixel = Rgb(color);
            }
        }
        RasterImage::new(DynamicImage::ImageRgb8(painted))
    }
}

/// テスト用のファクトリー関数：中央に正方形の前景があるバックエンド
pub fn create_mock_backend(size: u32, side: u32) -> MockSegmentationBackend {
    let start = size.saturating_sub(side) / 2;
    let inside = start..start + side;
    MockSegmentationBackend::new(RawAlpha::from_fn(size, size, |x, y| {
        image::Luma([if inside.contains(&x) && inside.contains(&y) {
            1.0
        } else {
            0.0
        }])
    }))
}
