//! Text prompts for background generators and inpainting delegates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{CompositeError, Result};
use crate::raster::AlphaMask;

const DEFAULT_STYLE: &str = "vibrant, creative";
const DEFAULT_INPAINT_STYLE: &str = "clean, professional, and visually appealing";

/// Where the product sits in the frame, so a generator can leave room for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementHint {
    pub vertical: Band,
    pub horizontal: Band,
    /// Fraction of the frame covered by the product's bounding box.
    pub coverage: f32,
}

/// One third of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Start,
    Middle,
    End,
}

impl Band {
    fn from_fraction(fraction: f32) -> Self {
        if fraction < 1.0 / 3.0 {
            Self::Start
        } else if fraction < 2.0 / 3.0 {
            Self::Middle
        } else {
            Self::End
        }
    }
}

impl PlacementHint {
    /// Bounding-box centre mapped onto a 3x3 grid. `None` when the mask has no foreground.
    pub fn from_mask(mask: &AlphaMask) -> Option<Self> {
        let bbox = mask.bounding_box()?;
        let (cx, cy) = bbox.center();
        let (width, height) = mask.dimensions();
        Some(Self {
            horizontal: Band::from_fraction(cx / width as f32),
            vertical: Band::from_fraction(cy / height as f32),
            coverage: bbox.area() as f32 / (u64::from(width) * u64::from(height)) as f32,
        })
    }

    /// Region name such as `"top-left"` or `"center"`.
    pub fn region(&self) -> &'static str {
        match (self.vertical, self.horizontal) {
            (Band::Start, Band::Start) => "top-left",
            (Band::Start, Band::Middle) => "top",
            (Band::Start, Band::End) => "top-right",
            (Band::Middle, Band::Start) => "left",
            (Band::Middle, Band::Middle) => "center",
            (Band::Middle, Band::End) => "right",
            (Band::End, Band::Start) => "bottom-left",
            (Band::End, Band::Middle) => "bottom",
            (Band::End, Band::End) => "bottom-right",
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "Leave open space at the {} of the frame, about {:.0}% of the image, for the product.",
            self.region(),
            self.coverage * 100.0
        )
    }
}

/// Prompt fragments that can be set from the settings document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSettings {
    pub style_keywords: Vec<String>,
    pub color_palette: Vec<String>,
    /// Append the product's placement to background prompts.
    pub placement_hint: bool,
    /// Named scene fragments, e.g. `"studio": "seamless paper sweep, softbox lighting"`.
    pub presets: BTreeMap<String, String>,
    /// Preset appended to every scene description.
    pub style: Option<String>,
}

impl PromptSettings {
    pub fn validate(&self) -> Result<()> {
        match &self.style {
            Some(name) if !self.presets.contains_key(name) => {
                let known: Vec<&str> = self.presets.keys().map(String::as_str).collect();
                Err(CompositeError::invalid_options(
                    "style",
                    format!("unknown preset `{name}`, known presets: [{}]", known.join(", ")),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Fragment of the selected preset.
    pub fn preset_fragment(&self) -> Option<&str> {
        self.style
            .as_ref()
            .and_then(|name| self.presets.get(name))
            .map(String::as_str)
    }
}

/// Builder for background-only and inpainting prompts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackgroundPrompt {
    description: String,
    product: Option<String>,
    style_keywords: Vec<String>,
    color_palette: Vec<String>,
    preset: Option<String>,
    placement: Option<PlacementHint>,
}

impl BackgroundPrompt {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// What the product is; only used by inpainting prompts.
    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn product(&self) -> Option<&str> {
        self.product.as_deref()
    }

    pub fn with_style_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.style_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_color_palette<I, S>(mut self, colors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.color_palette = colors.into_iter().map(Into::into).collect();
        self
    }

    /// Scene fragment appended to the description.
    pub fn with_preset(mut self, fragment: impl Into<String>) -> Self {
        self.preset = Some(fragment.into());
        self
    }

    pub const fn with_placement(mut self, placement: Option<PlacementHint>) -> Self {
        self.placement = placement;
        self
    }

    /// Fills in keywords, palette and preset from `settings` where they are set.
    pub fn with_settings(mut self, settings: &PromptSettings) -> Self {
        if let Some(fragment) = settings.preset_fragment() {
            self.preset = Some(fragment.to_string());
        }
        if !settings.style_keywords.is_empty() {
            self.style_keywords = settings.style_keywords.clone();
        }
        if !settings.color_palette.is_empty() {
            self.color_palette = settings.color_palette.clone();
        }
        self
    }

    fn scene(&self) -> String {
        match &self.preset {
            Some(fragment) => format!("{}, {fragment}", self.description),
            None => self.description.clone(),
        }
    }

    /// Prompt describing only the scene: the product is never mentioned.
    pub fn build(&self) -> String {
        let style = if self.style_keywords.is_empty() {
            DEFAULT_STYLE.to_string()
        } else {
            self.style_keywords.join(", ")
        };

        let mut prompt = format!(
            "A visually striking background scene featuring {}. Style: {style}. \
             High quality commercial photography background with soft, even lighting.",
            self.scene()
        );
        if !self.color_palette.is_empty() {
            prompt.push_str(&format!(" Color palette: {}.", self.color_palette.join(", ")));
        }
        if let Some(placement) = &self.placement {
            prompt.push(' ');
            prompt.push_str(&placement.describe());
        }
        prompt.push_str(" Background only, no products, no text, no objects in the foreground.");
        prompt
    }

    /// Descriptive prompt covering the whole frame, product included.
    pub fn build_inpainting(&self, product_description: &str) -> String {
        let style = if self.style_keywords.is_empty() {
            DEFAULT_INPAINT_STYLE.to_string()
        } else {
            self.style_keywords.join(", ")
        };
        format!(
            "This photo showcases {product_description}. The product is clearly highlighted and \
             prominently displayed, placed in {}. The overall image maintains a {style} visual style, \
             with natural lighting and high-quality commercial photography aesthetics.",
            self.scene()
        )
    }
}
