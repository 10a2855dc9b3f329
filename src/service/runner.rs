//! Directory runner
//!
//! Restores every image of an input directory. A failing image is logged and
//! recorded in the report; the run only stops early with `stop_on_error`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::error::InputError;
use crate::utils::image::{list_images, read_image, save_image};

use super::pipeline::RestorePipeline;
use super::types::{FaceReport, ImageReport, RunReport};

/// Output image format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputExt {
    /// Keep the input extension
    #[default]
    Auto,
    Png,
    Jpg,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub ext: OutputExt,
    pub suffix: Option<String>,
    pub save_faces: bool,
    pub stop_on_error: bool,
}

impl RunOptions {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            ext: OutputExt::Auto,
            suffix: None,
            save_faces: false,
            stop_on_error: false,
        }
    }

    /// `<output>/restored_imgs/<stem>[_<suffix>].<ext>`
    pub fn output_path(&self, input: &Path) -> PathBuf {
        let stem = file_stem(input);
        let ext = match self.ext {
            OutputExt::Auto => input
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("png")
                .to_string(),
            OutputExt::Png => "png".to_string(),
            OutputExt::Jpg => "jpg".to_string(),
        };
        let name = match &self.suffix {
            Some(suffix) => format!("{stem}_{suffix}.{ext}"),
            None => format!("{stem}.{ext}"),
        };
        self.output.join("restored_imgs").join(name)
    }

    /// `<output>/<kind>/<stem>_<index>.png`
    pub fn face_path(&self, kind: &str, input: &Path, index: usize) -> PathBuf {
        self.output
            .join(kind)
            .join(format!("{}_{:02}.png", file_stem(input), index))
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

/// Restore every image under `options.input`.
pub fn run(pipeline: &RestorePipeline<'_>, options: &RunOptions) -> Result<RunReport> {
    let inputs = list_images(&options.input)?;
    if inputs.is_empty() {
        return Err(InputError::EmptyInputDirectory(options.input.clone()).into());
    }
    info!("Restoring {} image(s) from {}", inputs.len(), options.input.display());

    let start = Instant::now();
    let mut report = RunReport::default();
    for (i, path) in inputs.iter().enumerate() {
        let image_start = Instant::now();
        match process_one(pipeline, options, path) {
            Ok(image_report) => {
                info!(
                    "[{}/{}] {}: {} face(s) in {:?}",
                    i + 1,
                    inputs.len(),
                    path.display(),
                    image_report.faces.len(),
                    image_start.elapsed()
                );
                report.images.push(image_report);
            }
            Err(e) => {
                let e = e.context(format!("image {}", path.display()));
                if options.stop_on_error {
                    return Err(e);
                }
                error!("{:#}", e);
                let elapsed = image_start.elapsed().as_millis() as u64;
                report.images.push(ImageReport::failed(path.clone(), &e, elapsed));
            }
        }
    }
    report.elapsed_ms = start.elapsed().as_millis() as u64;

    info!(
        "Done: {} written, {} failed, {} face(s) in {:?}",
        report.written(),
        report.failed(),
        report.total_faces(),
        start.elapsed()
    );
    Ok(report)
}

fn process_one(pipeline: &RestorePipeline<'_>, options: &RunOptions, path: &Path) -> Result<ImageReport> {
    let start = Instant::now();
    let image = read_image(path)?;
    let restoration = pipeline.process(&image)?;

    if options.save_faces {
        for (index, crop) in restoration.cropped_faces.iter().enumerate() {
            save_image(crop, &options.face_path("cropped_faces", path, index))?;
        }
        for (index, face) in restoration.restored_faces.iter().enumerate() {
            save_image(face, &options.face_path("restored_faces", path, index))?;
        }
    }

    let output = options.output_path(path);
    save_image(&restoration.image, &output).context("saving restored image")?;

    Ok(ImageReport {
        input: path.to_path_buf(),
        output: Some(output),
        faces: restoration
            .detections
            .iter()
            .enumerate()
            .map(|(i, d)| FaceReport::new(i, d))
            .collect(),
        elapsed_ms: start.elapsed().as_millis() as u64,
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::graph::{test_graphs, GraphArtifact};
    use crate::engine::{DeviceContext, NetworkRestorer};
    use image::{Rgb, RgbImage};

    fn context(dir: &Path) -> DeviceContext {
        let path = dir.join("restore.onnx");
        GraphArtifact::from_proto(test_graphs::affine(1, 8))
            .write(&path)
            .unwrap();
        DeviceContext::new(Box::new(NetworkRestorer::load(&path, 1, 8).unwrap()))
    }

    fn write_inputs(dir: &Path, names: &[&str]) {
        std::fs::create_dir_all(dir).unwrap();
        for name in names {
            RgbImage::from_pixel(8, 8, Rgb([120, 60, 30]))
                .save(dir.join(name))
                .unwrap();
        }
    }

    #[test]
    fn test_output_paths() {
        let mut options = RunOptions::new("in", "out");
        assert_eq!(
            options.output_path(Path::new("in/a.jpg")),
            PathBuf::from("out/restored_imgs/a.jpg")
        );
        options.ext = OutputExt::Png;
        options.suffix = Some("v14".to_string());
        assert_eq!(
            options.output_path(Path::new("in/a.jpg")),
            PathBuf::from("out/restored_imgs/a_v14.png")
        );
        assert_eq!(
            options.face_path("restored_faces", Path::new("in/a.jpg"), 3),
            PathBuf::from("out/restored_faces/a_03.png")
        );
    }

    #[test]
    fn test_run_writes_outputs_and_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("inputs");
        write_inputs(&input, &["a.png", "b.png"]);
        std::fs::write(input.join("broken.png"), b"not an image").unwrap();

        let ctx = context(dir.path());
        let pipeline = RestorePipeline::aligned(&ctx);
        let mut options = RunOptions::new(&input, dir.path().join("out"));
        options.save_faces = true;

        let report = run(&pipeline, &options).unwrap();
        assert_eq!(report.processed(), 3);
        assert_eq!(report.written(), 2);
        assert_eq!(report.failed(), 1);
        assert!(!report.is_failure());

        let out = dir.path().join("out");
        assert!(out.join("restored_imgs/a.png").exists());
        assert!(out.join("restored_imgs/b.png").exists());
        assert!(out.join("cropped_faces/a_00.png").exists());
        assert!(out.join("restored_faces/b_00.png").exists());
        assert!(!out.join("restored_imgs/broken.png").exists());
    }

    #[test]
    fn test_stop_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("inputs");
        write_inputs(&input, &["b.png"]);
        std::fs::write(input.join("a.png"), b"garbage").unwrap();

        let ctx = context(dir.path());
        let pipeline = RestorePipeline::aligned(&ctx);
        let mut options = RunOptions::new(&input, dir.path().join("out"));
        options.stop_on_error = true;

        let err = run(&pipeline, &options).unwrap_err();
        assert!(format!("{err:#}").contains("a.png"));
        assert!(!dir.path().join("out/restored_imgs/b.png").exists());
    }

    #[test]
    fn test_empty_input_directory() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("empty");
        std::fs::create_dir_all(&input).unwrap();

        let ctx = context(dir.path());
        let pipeline = RestorePipeline::aligned(&ctx);
        let err = run(&pipeline, &RunOptions::new(&input, dir.path().join("out"))).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InputError>(),
            Some(InputError::EmptyInputDirectory(_))
        ));
    }

    #[test]
    fn test_jpg_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("inputs");
        write_inputs(&input, &["face.png"]);

        let ctx = context(dir.path());
        let pipeline = RestorePipeline::aligned(&ctx);
        let mut options = RunOptions::new(&input, dir.path().join("out"));
        options.ext = OutputExt::Jpg;

        let report = run(&pipeline, &options).unwrap();
        assert_eq!(report.written(), 1);
        let written = image::open(dir.path().join("out/restored_imgs/face.jpg")).unwrap();
        assert_eq!((written.width(), written.height()), (8, 8));
    }
}
