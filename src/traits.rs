use crate::errors::Result;
use crate::raster::{AlphaMask, MaskBuffer, RasterImage};

/// セグメンテーションバックエンドが返す生の前景確信度マップ
///
/// 値は `[0,1]`。入力より低解像度でもよい（`ForegroundExtractor` が拡大する）。
pub type RawAlpha = MaskBuffer;

/// アクセラレータ（GPU）へのアクセス要件
///
/// 呼び出し側が同一デバイスへの同時呼び出しを直列化できるように公開する
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceleratorAccess {
    /// CPU のみで動作する
    #[default]
    None,
    /// デバイスを共有しても安全
    Shared,
    /// デバイスごとに同時に一つの呼び出しのみ
    Exclusive { device_id: i32 },
}

/// 前景セグメンテーションの抽象化
///
/// 依存関係逆転原則（DIP）に従い、具象モデルではなく抽象に依存する
pub trait SegmentationBackend: Send + Sync {
    /// 画像の各画素について前景確信度を返す
    fn segment(&self, image: &RasterImage) -> Result<RawAlpha>;

    /// ログ・エラー表示用の名前
    fn name(&self) -> &str;

    fn accelerator(&self) -> AcceleratorAccess {
        AcceleratorAccess::None
    }
}

impl<T: SegmentationBackend + ?Sized> SegmentationBackend for Box<T> {
    fn segment(&self, image: &RasterImage) -> Result<RawAlpha> {
        (**self).segment(image)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn accelerator(&self) -> AcceleratorAccess {
        (**self).accelerator()
    }
}

/// 背景生成のパラメータ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    pub width: u32,
    pub height: u32,
    pub seed: Option<u64>,
}

impl GenerateOptions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            seed: None,
        }
    }

    /// 乱数シード（バリエーション生成時に画像ごとに変える）
    pub const fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
}

/// 背景画像生成の抽象化（生成モデル・API はブラックボックス）
pub trait BackgroundGenerator: Send + Sync {
    fn generate(
        &self,
        prompt: &str,
        mask: Option<&AlphaMask>,
        options: &GenerateOptions,
    ) -> Result<RasterImage>;

    fn accelerator(&self) -> AcceleratorAccess {
        AcceleratorAccess::None
    }
}

impl<T: BackgroundGenerator + ?Sized> BackgroundGenerator for Box<T> {
    fn generate(
        &self,
        prompt: &str,
        mask: Option<&AlphaMask>,
        options: &GenerateOptions,
    ) -> Result<RasterImage> {
        (**self).generate(prompt, mask, options)
    }

    fn accelerator(&self) -> AcceleratorAccess {
        (**self).accelerator()
    }
}

/// マスクを尊重したインペインティングの抽象化
///
/// `inpaint_mask` は 1 = 生成する領域、0 = 保持する製品領域
pub trait InpaintingDelegate: Send + Sync {
    fn inpaint(
        &self,
        image: &RasterImage,
        inpaint_mask: &AlphaMask,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<RasterImage>;

    fn accelerator(&self) -> AcceleratorAccess {
        AcceleratorAccess::None
    }
}

impl<T: InpaintingDelegate + ?Sized> InpaintingDelegate for Box<T> {
    fn inpaint(
        &self,
        image: &RasterImage,
        inpaint_mask: &AlphaMask,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<RasterImage> {
        (**self).inpaint(image, inpaint_mask, prompt, options)
    }

    fn accelerator(&self) -> AcceleratorAccess {
        (**self).accelerator()
    }
}
