//! One image through extraction, refinement and background fusion.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::background::align_background;
use crate::compositing::{composite, BlendOptions, CompositeByproducts, CompositeDiagnostics, CompositeRequest};
use crate::errors::{CompositeError, Result};
use crate::extractor::ForegroundExtractor;
use crate::prompt::{BackgroundPrompt, PlacementHint, PromptSettings};
use crate::raster::{AlphaMask, RasterImage};
use crate::refine::{prepare_inpainting_mask, refine, InpaintMaskOptions, RefineOptions, RefinedMask};
use crate::semaphore::{DeviceGate, DeviceGates};
use crate::traits::{
    AcceleratorAccess, BackgroundGenerator, GenerateOptions, InpaintingDelegate, SegmentationBackend,
};

/// Seed of the first variation; later ones count up from it.
pub const VARIATION_SEED: u64 = 42;

/// How the final image is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Generate a background separately and fuse it with the untouched product.
    #[default]
    Composite,
    /// Let an inpainting delegate repaint everything outside the product.
    Inpaint,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineOptions {
    pub refine: RefineOptions,
    pub blend: BlendOptions,
    pub inpaint: InpaintMaskOptions,
    pub prompt: PromptSettings,
}

impl PipelineOptions {
    pub fn validate(&self) -> Result<()> {
        self.refine.validate()?;
        self.blend.validate()?;
        self.inpaint.validate()?;
        self.prompt.validate()
    }
}

/// Where the new background comes from.
pub enum BackgroundSource {
    Generator(Box<dyn BackgroundGenerator>),
    Inpainter(Box<dyn InpaintingDelegate>),
}

impl BackgroundSource {
    pub const fn method(&self) -> Method {
        match self {
            Self::Generator(_) => Method::Composite,
            Self::Inpainter(_) => Method::Inpaint,
        }
    }

    fn accelerator(&self) -> AcceleratorAccess {
        match self {
            Self::Generator(generator) => generator.accelerator(),
            Self::Inpainter(delegate) => delegate.accelerator(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub method: Method,
    pub image: RasterImage,
    /// Extractor output before refinement.
    pub mask: AlphaMask,
    pub refined: RefinedMask,
    /// The generated background, or the inpainting mask in inpaint mode.
    pub background: Option<RasterImage>,
    pub inpaint_mask: Option<AlphaMask>,
    pub diagnostics: Option<CompositeDiagnostics>,
    pub byproducts: Option<CompositeByproducts>,
}

pub struct Pipeline<B: SegmentationBackend> {
    extractor: ForegroundExtractor<B>,
    source: BackgroundSource,
    options: PipelineOptions,
    segment_gate: DeviceGate,
    background_gate: DeviceGate,
}

impl<B: SegmentationBackend> Pipeline<B> {
    pub fn new(backend: B, source: BackgroundSource, options: PipelineOptions) -> Result<Self> {
        options.validate()?;
        let extractor = ForegroundExtractor::new(backend);
        // Components on the same device share its permit.
        let mut gates = DeviceGates::new();
        let segment_gate = gates.gate_for(extractor.accelerator());
        let background_gate = gates.gate_for(source.accelerator());
        if segment_gate.shares_permit_with(&background_gate) {
            debug!(backend = extractor.backend().name(), "Segmentation and background share a device");
        }
        Ok(Self {
            extractor,
            source,
            options,
            segment_gate,
            background_gate,
        })
    }

    pub const fn method(&self) -> Method {
        self.source.method()
    }

    pub const fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn run(&self, image: &RasterImage, prompt: &BackgroundPrompt) -> Result<PipelineOutput> {
        let (mask, refined) = self.segment(image)?;
        self.render(image, mask, refined, prompt, None)
    }

    /// `count` backgrounds for one photo, segmented once. Variation `i` is
    /// generated with seed `VARIATION_SEED + i`.
    pub fn run_variations(
        &self,
        image: &RasterImage,
        prompt: &BackgroundPrompt,
        count: u32,
    ) -> Result<Vec<PipelineOutput>> {
        if count == 0 {
            return Err(CompositeError::invalid_options("variations", "must be at least 1"));
        }

        let (mask, refined) = self.segment(image)?;
        (0..count)
            .map(|index| {
                debug!(variation = index + 1, count, "Rendering variation");
                let seed = VARIATION_SEED + u64::from(index);
                self.render(image, mask.clone(), refined.clone(), prompt, Some(seed))
            })
            .collect()
    }

    fn segment(&self, image: &RasterImage) -> Result<(AlphaMask, RefinedMask)> {
        let (width, height) = image.dimensions();
        info!(method = ?self.method(), width, height, "Running pipeline");

        let mask = self.segment_gate.run(|| self.extractor.extract(image))?;
        let refined = refine(&mask, &self.options.refine)?;
        if let Some(kind) = refined.degenerate {
            warn!(?kind, "Refined mask is uniform, continuing with it");
        }
        Ok((mask, refined))
    }

    fn render(
        &self,
        image: &RasterImage,
        mask: AlphaMask,
        refined: RefinedMask,
        prompt: &BackgroundPrompt,
        seed: Option<u64>,
    ) -> Result<PipelineOutput> {
        let (width, height) = image.dimensions();
        let generate_options = GenerateOptions::new(width, height).with_seed(seed);
        let prompt = prompt.clone().with_settings(&self.options.prompt);
        match &self.source {
            BackgroundSource::Generator(generator) => {
                let placement = if self.options.prompt.placement_hint {
                    PlacementHint::from_mask(&refined.mask)
                } else {
                    None
                };
                let text = prompt.with_placement(placement).build();
                debug!(prompt = %text, ?seed, "Requesting background");

                let generated = self
                    .background_gate
                    .run(|| generator.generate(&text, Some(&refined.mask), &generate_options))
                    .map_err(|e| background_failure("background generation", e))?;
                let background = align_background(&generated, width, height)?;

                let result = composite(
                    &CompositeRequest::new(image, &refined.mask, &background)
                        .with_options(self.options.blend.clone()),
                )?;

                Ok(PipelineOutput {
                    method: Method::Composite,
                    image: result.image,
                    mask,
                    refined,
                    background: Some(background),
                    inpaint_mask: None,
                    diagnostics: Some(result.diagnostics),
                    byproducts: result.byproducts,
                })
            }
            BackgroundSource::Inpainter(delegate) => {
                let inpaint_mask = prepare_inpainting_mask(&refined.mask, &self.options.inpaint)?;
                let text = prompt.build_inpainting(prompt.product().unwrap_or("the product"));
                debug!(prompt = %text, ?seed, "Requesting inpainting");

                let painted = self
                    .background_gate
                    .run(|| delegate.inpaint(image, &inpaint_mask, &text, &generate_options))
                    .map_err(|e| background_failure("inpainting", e))?;
                let painted = align_background(&painted, width, height)?;

                Ok(PipelineOutput {
                    method: Method::Inpaint,
                    image: painted,
                    mask,
                    refined,
                    background: None,
                    inpaint_mask: Some(inpaint_mask),
                    diagnostics: None,
                    byproducts: None,
                })
            }
        }
    }
}

/// Every collaborator failure surfaces as `BackgroundUnavailable`.
fn background_failure(operation: &str, error: CompositeError) -> CompositeError {
    match error {
        e @ CompositeError::BackgroundUnavailable { .. } => e,
        other => CompositeError::BackgroundUnavailable {
            operation: operation.to_string(),
            source: Box::new(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{
        create_mock_backend, MockBackgroundGenerator, MockInpaintingDelegate, MockSegmentationBackend,
    };
    use crate::raster::Degenerate;
    use image::{DynamicImage, Rgb, RgbImage};
    use rayon::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn photo() -> RasterImage {
        RasterImage::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            20,
            20,
            Rgb([200, 40, 40]),
        )))
        .unwrap()
    }

    struct SharedGenerator(Arc<MockBackgroundGenerator>);

    impl BackgroundGenerator for SharedGenerator {
        fn generate(&self, prompt: &str, mask: Option<&AlphaMask>, options: &GenerateOptions) -> Result<RasterImage> {
            self.0.generate(prompt, mask, options)
        }
    }

    #[test]
    fn test_composite_method_keeps_product_and_replaces_background() -> Result<()> {
        let pipeline = Pipeline::new(
            create_mock_backend(20, 10),
            BackgroundSource::Generator(Box::new(MockBackgroundGenerator::new([0, 0, 255]))),
            PipelineOptions::default(),
        )?;

        let output = pipeline.run(&photo(), &BackgroundPrompt::new("a blue wall"))?;
        let rgb = output.image.as_dynamic().to_rgb8();
        assert_eq!(output.method, Method::Composite);
        assert_eq!(rgb.get_pixel(10, 10).0, [200, 40, 40]);
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 255]);
        assert!(output.diagnostics.is_some());
        Ok(())
    }

    #[test]
    fn test_prompt_carries_settings_and_placement() -> Result<()> {
        let generator = Arc::new(MockBackgroundGenerator::new([1, 1, 1]));
        let options = PipelineOptions {
            prompt: PromptSettings {
                style_keywords: vec!["moody".into()],
                color_palette: vec![],
                placement_hint: true,
                ..PromptSettings::default()
            },
            ..PipelineOptions::default()
        };
        let pipeline = Pipeline::new(
            create_mock_backend(20, 10),
            BackgroundSource::Generator(Box::new(SharedGenerator(generator.clone()))),
            options,
        )?;

        pipeline.run(&photo(), &BackgroundPrompt::new("a forest"))?;
        let prompts = generator.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Style: moody."));
        assert!(prompts[0].contains("center of the frame"));
        Ok(())
    }

    #[test]
    fn test_inpaint_method_preserves_product_region() -> Result<()> {
        let pipeline = Pipeline::new(
            create_mock_backend(20, 10),
            BackgroundSource::Inpainter(Box::new(MockInpaintingDelegate::new([0, 255, 0]))),
            PipelineOptions {
                inpaint: InpaintMaskOptions {
                    expand_px: 2,
                    feather_px: 0.0,
                },
                ..PipelineOptions::default()
            },
        )?;

        let output = pipeline.run(&photo(), &BackgroundPrompt::new("a meadow"))?;
        let rgb = output.image.as_dynamic().to_rgb8();
        assert_eq!(output.method, Method::Inpaint);
        assert_eq!(rgb.get_pixel(10, 10).0, [200, 40, 40]);
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 255, 0]);
        assert!(output.inpaint_mask.is_some());
        assert!(output.diagnostics.is_none());
        Ok(())
    }

    #[test]
    fn test_generator_failure_is_background_unavailable() -> Result<()> {
        let pipeline = Pipeline::new(
            create_mock_backend(20, 10),
            BackgroundSource::Generator(Box::new(MockBackgroundGenerator::failing())),
            PipelineOptions::default(),
        )?;
        assert!(matches!(
            pipeline.run(&photo(), &BackgroundPrompt::new("x")),
            Err(CompositeError::BackgroundUnavailable { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_extraction_failure_propagates() -> Result<()> {
        let pipeline = Pipeline::new(
            MockSegmentationBackend::unavailable(),
            BackgroundSource::Generator(Box::new(MockBackgroundGenerator::new([0, 0, 0]))),
            PipelineOptions::default(),
        )?;
        assert!(matches!(
            pipeline.run(&photo(), &BackgroundPrompt::new("x")),
            Err(CompositeError::ExtractionUnavailable { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_degenerate_mask_is_flagged_not_fatal() -> Result<()> {
        let pipeline = Pipeline::new(
            MockSegmentationBackend::new(crate::raster::MaskBuffer::new(4, 4)),
            BackgroundSource::Generator(Box::new(MockBackgroundGenerator::new([9, 9, 9]))),
            PipelineOptions::default(),
        )?;

        let output = pipeline.run(&photo(), &BackgroundPrompt::new("x"))?;
        assert_eq!(output.refined.degenerate, Some(Degenerate::NoForeground));
        assert_eq!(output.image.as_dynamic().to_rgb8().get_pixel(10, 10).0, [9, 9, 9]);
        Ok(())
    }

    /// Concurrent calls currently on one device, and the most ever seen.
    #[derive(Default)]
    struct DeviceLoad {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl DeviceLoad {
        fn occupy<T>(&self, f: impl FnOnce() -> T) -> T {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_micros(200));
            let result = f();
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct GpuBackend {
        load: Arc<DeviceLoad>,
        inner: MockSegmentationBackend,
    }

    impl SegmentationBackend for GpuBackend {
        fn segment(&self, image: &RasterImage) -> Result<crate::traits::RawAlpha> {
            self.load.occupy(|| self.inner.segment(image))
        }

        fn name(&self) -> &str {
            "gpu"
        }

        fn accelerator(&self) -> AcceleratorAccess {
            AcceleratorAccess::Exclusive { device_id: 0 }
        }
    }

    struct GpuGenerator {
        load: Arc<DeviceLoad>,
        inner: MockBackgroundGenerator,
    }

    impl BackgroundGenerator for GpuGenerator {
        fn generate(&self, prompt: &str, mask: Option<&AlphaMask>, options: &GenerateOptions) -> Result<RasterImage> {
            self.load.occupy(|| self.inner.generate(prompt, mask, options))
        }

        fn accelerator(&self) -> AcceleratorAccess {
            AcceleratorAccess::Exclusive { device_id: 0 }
        }
    }

    #[test]
    fn test_components_on_one_device_never_overlap() -> Result<()> {
        let load = Arc::new(DeviceLoad::default());
        let pipeline = Pipeline::new(
            GpuBackend {
                load: load.clone(),
                inner: create_mock_backend(20, 10),
            },
            BackgroundSource::Generator(Box::new(GpuGenerator {
                load: load.clone(),
                inner: MockBackgroundGenerator::new([0, 0, 255]),
            })),
            PipelineOptions::default(),
        )?;
        assert!(pipeline.segment_gate.shares_permit_with(&pipeline.background_gate));

        let pool = rayon::ThreadPoolBuilder::new().num_threads(8).build().unwrap();
        let image = photo();
        let prompt = BackgroundPrompt::new("x");
        pool.install(|| {
            (0..64)
                .into_par_iter()
                .try_for_each(|_| pipeline.run(&image, &prompt).map(|_| ()))
        })?;

        assert_eq!(load.peak.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_variations_share_mask_and_get_distinct_seeds() -> Result<()> {
        let generator = Arc::new(MockBackgroundGenerator::new([5, 5, 5]));
        let pipeline = Pipeline::new(
            create_mock_backend(20, 10),
            BackgroundSource::Generator(Box::new(SharedGenerator(generator.clone()))),
            PipelineOptions::default(),
        )?;

        let outputs = pipeline.run_variations(&photo(), &BackgroundPrompt::new("a shelf"), 3)?;
        assert_eq!(outputs.len(), 3);
        assert_eq!(generator.seeds(), vec![Some(42), Some(43), Some(44)]);
        assert!(outputs.iter().all(|o| o.refined == outputs[0].refined));

        pipeline.run(&photo(), &BackgroundPrompt::new("a shelf"))?;
        assert_eq!(generator.seeds().last(), Some(&None));
        Ok(())
    }

    #[test]
    fn test_zero_variations_is_invalid() -> Result<()> {
        let pipeline = Pipeline::new(
            create_mock_backend(20, 10),
            BackgroundSource::Generator(Box::new(MockBackgroundGenerator::new([0, 0, 0]))),
            PipelineOptions::default(),
        )?;
        assert!(matches!(
            pipeline.run_variations(&photo(), &BackgroundPrompt::new("x"), 0),
            Err(CompositeError::InvalidOptions { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_invalid_options_rejected_at_construction() {
        let options = PipelineOptions {
            refine: RefineOptions::default().with_threshold(2.0),
            ..PipelineOptions::default()
        };
        let result = Pipeline::new(
            create_mock_backend(4, 2),
            BackgroundSource::Generator(Box::new(MockBackgroundGenerator::new([0, 0, 0]))),
            options,
        );
        assert!(matches!(result, Err(CompositeError::InvalidOptions { .. })));
    }
}
