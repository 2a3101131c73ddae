pub mod background;
pub mod compositing;
pub mod config;
pub mod errors;
pub mod extractor;
pub mod imageops;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod prompt;
pub mod raster;
pub mod refine;
pub mod semaphore;
pub mod traits;
pub mod visualize;

pub mod mocks;

use std::fs;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{error, info, warn};
use walkdir::WalkDir;

pub use compositing::{composite, BlendOptions, CompositeRequest, CompositeResult};
pub use config::{Config, PipelineSettings};
pub use errors::{CompositeError, Result};
pub use extractor::ForegroundExtractor;
pub use model::{Device, OnnxSegmentationBackend, ThresholdSegmentationBackend};
pub use pipeline::{BackgroundSource, Method, Pipeline, PipelineOptions, PipelineOutput};
pub use prompt::BackgroundPrompt;
pub use raster::{AlphaMask, RasterImage};
pub use refine::{refine, RefineOptions, RefinedMask};
pub use traits::*;

#[cfg(test)]
pub use mocks::*;

/// Where a batch reads from and writes to.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Output file extension.
    pub format: String,
    pub max_dimension: u32,
    pub save_stages: bool,
    /// Backgrounds per photo; above 1 the outputs are named `<stem>_var<n>`.
    pub variations: u32,
}

impl BatchOptions {
    pub fn from_config(config: &Config, settings: &PipelineSettings) -> Self {
        Self {
            input_dir: config.input_dir.clone(),
            output_dir: config.output_dir.clone(),
            format: config.format.clone(),
            max_dimension: settings.image_processing.max_dimension,
            save_stages: config.save_stages,
            variations: config.variations,
        }
    }
}

/// Outcome of a batch: one failed image never stops the others.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, CompositeError)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ImageProcessor<B: SegmentationBackend> {
    pipeline: Pipeline<B>,
    prompt: BackgroundPrompt,
    options: BatchOptions,
}

impl<B: SegmentationBackend> ImageProcessor<B> {
    pub const fn new(pipeline: Pipeline<B>, prompt: BackgroundPrompt, options: BatchOptions) -> Self {
        Self {
            pipeline,
            prompt,
            options,
        }
    }

    pub fn process_directory(&self) -> Result<BatchReport> {
        let input_path = &self.options.input_dir;
        let output_path = &self.options.output_dir;

        if !input_path.is_dir() {
            return Err(CompositeError::FileSystem {
                path: input_path.clone(),
                operation: "ディレクトリ存在確認".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "入力ディレクトリが存在しません",
                ),
            });
        }

        fs::create_dir_all(output_path).map_err(|e| CompositeError::FileSystem {
            path: output_path.clone(),
            operation: "ディレクトリ作成".to_string(),
            source: e,
        })?;

        let image_files = self.collect_image_files(input_path);
        if image_files.is_empty() {
            warn!(input = %input_path.display(), "No images to process");
            return Ok(BatchReport::default());
        }
        info!(count = image_files.len(), method = ?self.pipeline.method(), "Processing batch");

        let pb = ProgressBar::new(image_files.len() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );

        let outcomes: Vec<(PathBuf, Result<Vec<PathBuf>>)> = image_files
            .par_iter()
            .map(|input_file| {
                let outcome = self.process_single_image(input_file, output_path);
                pb.inc(1);
                (input_file.clone(), outcome)
            })
            .collect();
        pb.finish_and_clear();

        let mut report = BatchReport::default();
        for (input_file, outcome) in outcomes {
            match outcome {
                Ok(_) => report.succeeded.push(input_file),
                Err(e) => {
                    error!(path = %input_file.display(), error = %e, "Image failed");
                    report.failed.push((input_file, e));
                }
            }
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Batch finished"
        );
        Ok(report)
    }

    fn collect_image_files(&self, input_path: &Path) -> Vec<PathBuf> {
        let mut image_files: Vec<PathBuf> = WalkDir::new(input_path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && loader::is_supported_format(e.path()))
            .map(walkdir::DirEntry::into_path)
            .collect();
        image_files.sort();
        image_files
    }

    /// Runs one photo and writes the results; returns the output paths.
    pub fn process_single_image(&self, input_file: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        let image = loader::load_image(input_file, self.options.max_dimension)?;
        let outputs = if self.options.variations > 1 {
            self.pipeline
                .run_variations(&image, &self.prompt, self.options.variations)?
        } else {
            vec![self.pipeline.run(&image, &self.prompt)?]
        };

        let relative_path = self.get_relative_path(input_file)?;
        let parent = output_dir.join(relative_path.parent().unwrap_or_else(|| Path::new("")));
        let stem = input_file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("image");
        let stage_writer = self.options.save_stages.then(|| {
            visualize::StageWriter::new(
                output_dir
                    .join("stages")
                    .join(relative_path.parent().unwrap_or_else(|| Path::new(""))),
            )
        });

        let mut written = Vec::with_capacity(outputs.len());
        for (index, output) in outputs.iter().enumerate() {
            let name = variation_name(stem, index, outputs.len());
            let output_file = parent.join(format!("{name}.{}", self.options.format));
            loader::save_image(output.image.as_dynamic(), &output_file)?;
            if let Some(writer) = &stage_writer {
                save_stages(writer, &name, &image, output);
            }
            written.push(output_file);
        }
        Ok(written)
    }

    pub fn get_relative_path(&self, input_file: &Path) -> Result<PathBuf> {
        let input_dir = &self.options.input_dir;
        input_file
            .strip_prefix(input_dir)
            .map(|p| p.to_path_buf())
            .map_err(|_| CompositeError::FileSystem {
                path: input_file.to_path_buf(),
                operation: "相対パス取得".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "入力ファイルが入力ディレクトリ内にありません",
                ),
            })
    }
}

/// `stem` for a single output, `stem_var<n>` (1-based) for a set of variations.
fn variation_name(stem: &str, index: usize, count: usize) -> String {
    if count > 1 {
        format!("{stem}_var{}", index + 1)
    } else {
        stem.to_string()
    }
}

fn save_stages(writer: &visualize::StageWriter, stem: &str, image: &RasterImage, output: &PipelineOutput) {
    writer.save(stem, "mask", &DynamicImage::ImageLuma8(output.mask.to_gray()));
    writer.save(stem, "refined_mask", &DynamicImage::ImageLuma8(output.refined.mask.to_gray()));
    if let Ok(cutout) = extractor::cutout(image, &output.refined.mask) {
        writer.save(stem, "cutout", &DynamicImage::ImageRgba8(cutout));
    }
    if let Ok(preview) = extractor::premultiplied_cutout(image, &output.refined.mask) {
        writer.save(stem, "cutout_premultiplied", &DynamicImage::ImageRgba8(preview));
    }
    let overlay = visualize::mask_overlay(image, &output.refined.mask, [255, 0, 0], 0.4);
    writer.save(stem, "overlay", &DynamicImage::ImageRgb8(overlay));
    writer.save(
        stem,
        "edges",
        &DynamicImage::ImageLuma8(visualize::edge_map(&output.refined.mask)),
    );
    if let Some(background) = &output.background {
        writer.save(stem, "background", background.as_dynamic());
    }
    if let Some(inpaint_mask) = &output.inpaint_mask {
        writer.save(stem, "inpaint_mask", &DynamicImage::ImageLuma8(inpaint_mask.to_gray()));
    }
    let comparison = visualize::side_by_side(image, &output.image);
    writer.save(stem, "comparison", &DynamicImage::ImageRgb8(comparison));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn processor(input_dir: PathBuf) -> Result<ImageProcessor<MockSegmentationBackend>> {
        let pipeline = Pipeline::new(
            create_mock_backend(8, 4),
            BackgroundSource::Generator(Box::new(background::SolidColorBackground::default())),
            PipelineOptions::default(),
        )?;
        Ok(ImageProcessor::new(
            pipeline,
            BackgroundPrompt::new("a white sweep"),
            BatchOptions {
                input_dir,
                output_dir: "output".into(),
                format: "png".to_string(),
                max_dimension: 2048,
                save_stages: false,
                variations: 1,
            },
        ))
    }

    #[test]
    fn test_relative_path_calculation() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let input_dir = temp_dir.path().join("input");
        let subdir = input_dir.join("subdir");
        fs::create_dir_all(&subdir)?;

        let processor = processor(input_dir)?;
        let test_file = subdir.join("test.jpg");
        let relative = processor.get_relative_path(&test_file)?;

        assert_eq!(relative, Path::new("subdir/test.jpg"));
        assert!(processor.get_relative_path(Path::new("/elsewhere/x.jpg")).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_input_directory() -> Result<()> {
        let processor = processor(PathBuf::from("/nonexistent/input"))?;
        assert!(matches!(
            processor.process_directory(),
            Err(CompositeError::FileSystem { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_variation_names() {
        assert_eq!(variation_name("shot", 0, 1), "shot");
        assert_eq!(variation_name("shot", 0, 3), "shot_var1");
        assert_eq!(variation_name("shot", 2, 3), "shot_var3");
    }

    #[test]
    fn test_report_counts() {
        let mut report = BatchReport::default();
        assert!(report.is_success());
        report.succeeded.push("a.png".into());
        report
            .failed
            .push(("b.png".into(), CompositeError::invalid_input("broken")));
        assert_eq!(report.total(), 2);
        assert!(!report.is_success());
    }
}
