use std::fs;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use image::ImageFormat;
use serde::{Deserialize, Serialize};

use crate::compositing::BlendOptions;
use crate::errors::{CompositeError, Result};
use crate::loader::DEFAULT_MAX_DIMENSION;
use crate::model::Device;
use crate::pipeline::{Method, PipelineOptions};
use crate::prompt::PromptSettings;
use crate::refine::{InpaintMaskOptions, RefineOptions};

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    pub input_dir: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = Method::Composite)]
    pub method: Method,

    /// ONNX segmentation model; without it a backdrop-colour threshold is used
    #[arg(short, long)]
    pub model_path: Option<PathBuf>,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    /// CUDA device for the segmentation model; CPU when omitted
    #[arg(short, long)]
    pub device_id: Option<i32>,

    #[arg(short, long)]
    pub num_threads: Option<usize>,

    /// Background plate, fitted to each photo
    #[arg(long, conflicts_with = "background_color")]
    pub background_image: Option<PathBuf>,

    /// Flat background colour as `#rrggbb`
    #[arg(long, value_parser = parse_hex_color, default_value = "#ffffff")]
    pub background_color: [u8; 3],

    /// Scene description handed to the background source
    #[arg(short, long, default_value = "a clean studio backdrop")]
    pub prompt: String,

    /// Product description used by inpainting prompts
    #[arg(long)]
    pub product: Option<String>,

    /// JSON settings document
    #[arg(short, long)]
    pub settings: Option<PathBuf>,

    /// Style preset from the settings document's `prompt.presets`
    #[arg(long)]
    pub style: Option<String>,

    /// Backgrounds to generate per photo
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub variations: u32,

    /// Also write mask, cut-out, overlay and comparison images
    #[arg(long)]
    pub save_stages: bool,

    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Config {
    pub const fn device(&self) -> Device {
        match self.device_id {
            Some(device_id) => Device::Cuda { device_id },
            None => Device::Cpu,
        }
    }

    /// Settings document if one was given, defaults otherwise; `--style` overrides
    /// the document's preset choice.
    pub fn load_settings(&self) -> Result<PipelineSettings> {
        let mut settings = match &self.settings {
            Some(path) => PipelineSettings::load(path)?,
            None => PipelineSettings::default(),
        };
        if let Some(style) = &self.style {
            settings.prompt.style = Some(style.clone());
            settings.validate()?;
        }
        Ok(settings)
    }
}

fn check_format(s: &str) -> std::result::Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}

pub fn parse_hex_color(s: &str) -> std::result::Result<[u8; 3], String> {
    let hex = s.trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return Err(format!("{s} is not a #rrggbb colour"));
    }
    let channel = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| format!("{s} is not a #rrggbb colour"))
    };
    Ok([channel(0)?, channel(2)?, channel(4)?])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageProcessingSettings {
    /// Longest side after loading; 0 keeps the original size.
    pub max_dimension: u32,
}

impl Default for ImageProcessingSettings {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }
}

/// 設定ファイル（JSON）
///
/// すべての項目にデフォルト値があるため、部分的な記述でもよい
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    pub mask_processing: RefineOptions,
    pub compositing: BlendOptions,
    pub inpainting: InpaintMaskOptions,
    pub image_processing: ImageProcessingSettings,
    pub prompt: PromptSettings,
}

impl PipelineSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| CompositeError::FileSystem {
            path: path.to_path_buf(),
            operation: "設定ファイル読み込み".to_string(),
            source: e,
        })?;
        Self::from_json_str(&text).map_err(|e| CompositeError::Configuration {
            message: format!("{}: {e}", path.display()),
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(text).map_err(|e| CompositeError::Configuration {
            message: format!("invalid settings document: {e}"),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let section = |name: &str, result: Result<()>| {
            result.map_err(|e| CompositeError::Configuration {
                message: format!("{name}: {e}"),
            })
        };
        section("mask_processing", self.mask_processing.validate())?;
        section("compositing", self.compositing.validate())?;
        section("inpainting", self.inpainting.validate())?;
        section("prompt", self.prompt.validate())
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            refine: self.mask_processing.clone(),
            blend: self.compositing.clone(),
            inpaint: self.inpainting.clone(),
            prompt: self.prompt.clone(),
        }
    }
}
