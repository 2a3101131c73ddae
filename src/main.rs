use anyhow::{ensure, Context, Result};
use clap::Parser;
use rayon::ThreadPoolBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use product_composite_rs::{
    background::{ImageFileBackground, SolidColorBackground, SolidFillInpainter},
    BackgroundPrompt, BackgroundSource, BatchOptions, Config, ImageProcessor, Method,
    OnnxSegmentationBackend, Pipeline, SegmentationBackend, ThresholdSegmentationBackend,
};

fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(config.verbose);

    ensure!(
        config.input_dir.is_dir(),
        "Input directory does not exist: {}",
        config.input_dir.display()
    );
    if let Some(num_threads) = config.num_threads {
        ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build_global()
            .context("Failed to configure the thread pool")?;
    }

    let settings = config
        .load_settings()
        .context("Failed to load the settings document")?;

    let backend: Box<dyn SegmentationBackend> = match &config.model_path {
        Some(model_path) => Box::new(
            OnnxSegmentationBackend::new(model_path, config.device())
                .with_context(|| format!("Failed to load model: {}", model_path.display()))?,
        ),
        None => {
            warn!("No model given, segmenting by backdrop colour");
            Box::new(ThresholdSegmentationBackend::default())
        }
    };

    let source = match config.method {
        Method::Composite => match &config.background_image {
            Some(path) => BackgroundSource::Generator(Box::new(
                ImageFileBackground::open(path)
                    .with_context(|| format!("Failed to load background: {}", path.display()))?,
            )),
            None => BackgroundSource::Generator(Box::new(SolidColorBackground::new(
                config.background_color,
            ))),
        },
        Method::Inpaint => BackgroundSource::Inpainter(Box::new(SolidFillInpainter {
            color: config.background_color,
        })),
    };

    let mut prompt = BackgroundPrompt::new(config.prompt.clone());
    if let Some(product) = &config.product {
        prompt = prompt.with_product(product.clone());
    }

    let pipeline = Pipeline::new(backend, source, settings.pipeline_options())?;
    let processor = ImageProcessor::new(pipeline, prompt, BatchOptions::from_config(&config, &settings));
    let report = processor.process_directory()?;

    info!(
        total = report.total(),
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        output = %config.output_dir.display(),
        "Done"
    );
    ensure!(
        report.is_success(),
        "{} of {} images failed",
        report.failed.len(),
        report.total()
    );
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
