//! Per-image restoration pipeline
//!
//! Locate -> align -> restore -> upsample background -> composite.

use std::time::Instant;

use image::RgbImage;

use crate::engine::detector::select_center_face;
use crate::engine::{
    AlignedFace, Aligner, BackgroundUpsampler, Compositor, DeviceContext, Detection, FaceLocator,
    ResizeUpsampler, RestorationExecutor,
};
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Output scale relative to the input image
    pub upscale: u32,
    pub only_center_face: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            upscale: 2,
            only_center_face: false,
        }
    }
}

/// Everything one image produced.
#[derive(Debug, Clone)]
pub struct Restoration {
    pub image: RgbImage,
    pub detections: Vec<Detection>,
    pub cropped_faces: Vec<RgbImage>,
    pub restored_faces: Vec<RgbImage>,
}

enum Mode {
    Detect(Box<dyn FaceLocator>),
    /// Inputs are already canonical crops
    Aligned,
}

pub struct RestorePipeline<'a> {
    mode: Mode,
    aligner: Aligner,
    executor: RestorationExecutor<'a>,
    upsampler: Option<Box<dyn BackgroundUpsampler>>,
    compositor: Compositor,
    options: PipelineOptions,
}

impl<'a> RestorePipeline<'a> {
    pub fn new(ctx: &'a DeviceContext, locator: Box<dyn FaceLocator>, options: PipelineOptions) -> Self {
        Self::with_mode(ctx, Mode::Detect(locator), options)
    }

    /// Pipeline for pre-aligned face crops; nothing is detected or pasted.
    pub fn aligned(ctx: &'a DeviceContext) -> Self {
        let options = PipelineOptions {
            upscale: 1,
            only_center_face: false,
        };
        Self::with_mode(ctx, Mode::Aligned, options)
    }

    fn with_mode(ctx: &'a DeviceContext, mode: Mode, options: PipelineOptions) -> Self {
        let executor = RestorationExecutor::new(ctx);
        let size = executor.canonical_size();
        Self {
            mode,
            aligner: Aligner::new(size),
            executor,
            upsampler: None,
            compositor: Compositor::new(size),
            options: PipelineOptions {
                upscale: options.upscale.max(1),
                ..options
            },
        }
    }

    pub fn with_upsampler(mut self, upsampler: Box<dyn BackgroundUpsampler>) -> Self {
        tracing::info!("Background upsampler: {}", upsampler.describe());
        self.upsampler = Some(upsampler);
        self
    }

    pub fn is_aligned(&self) -> bool {
        matches!(self.mode, Mode::Aligned)
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn process(&self, image: &RgbImage) -> Result<Restoration, PipelineError> {
        match &self.mode {
            Mode::Aligned => self.process_aligned(image),
            Mode::Detect(locator) => self.process_full(locator.as_ref(), image),
        }
    }

    fn process_aligned(&self, image: &RgbImage) -> Result<Restoration, PipelineError> {
        let face = self.aligner.assume_aligned(image);
        let restored = self.executor.restore(std::slice::from_ref(&face))?;
        let restored_faces: Vec<RgbImage> = restored.into_iter().map(|r| r.image).collect();
        let image = restored_faces.first().cloned().unwrap_or_else(|| face.crop.clone());
        Ok(Restoration {
            image,
            detections: Vec::new(),
            cropped_faces: vec![face.crop],
            restored_faces,
        })
    }

    fn process_full(&self, locator: &dyn FaceLocator, image: &RgbImage) -> Result<Restoration, PipelineError> {
        let (width, height) = image.dimensions();

        let start = Instant::now();
        let mut detections = locator.locate(image)?;
        if self.options.only_center_face && detections.len() > 1 {
            detections = select_center_face(detections, width, height);
        }
        tracing::debug!("Detected {} face(s) in {:?}", detections.len(), start.elapsed());

        let faces: Vec<AlignedFace> = self.aligner.align_all(image, &detections)?;
        let restored = self.executor.restore(&faces)?;

        let start = Instant::now();
        let scale = self.options.upscale;
        let background = match &self.upsampler {
            Some(upsampler) => upsampler.upsample(image, scale)?,
            None => ResizeUpsampler.upsample(image, scale)?,
        };
        tracing::debug!("Background ready in {:?}", start.elapsed());

        let output = self.compositor.compose(&background, scale, &faces, &restored)?;
        Ok(Restoration {
            image: output,
            detections,
            cropped_faces: faces.into_iter().map(|f| f.crop).collect(),
            restored_faces: restored.into_iter().map(|r| r.image).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::graph::{test_graphs, GraphArtifact};
    use crate::engine::align::Landmarks;
    use crate::engine::NetworkRestorer;
    use crate::error::DetectionError;
    use image::Rgb;

    const SIZE: u32 = 32;

    /// Returns the same detections for every image.
    struct FixedLocator(Vec<Detection>);

    impl FaceLocator for FixedLocator {
        fn locate(&self, _image: &RgbImage) -> Result<Vec<Detection>, DetectionError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenLocator;

    impl FaceLocator for BrokenLocator {
        fn locate(&self, _image: &RgbImage) -> Result<Vec<Detection>, DetectionError> {
            Err(DetectionError::Inference("boom".to_string()))
        }
    }

    /// y = 0.5x + 0.1 in [-1, 1], mapped back to pixels.
    fn restored_value(p: u8) -> f32 {
        let x = p as f32 / 127.5 - 1.0;
        ((0.5 * x + 0.1 + 1.0) * 127.5).round()
    }

    fn context(dir: &std::path::Path) -> DeviceContext {
        let path = dir.join("restore.onnx");
        GraphArtifact::from_proto(test_graphs::affine(2, SIZE as usize))
            .write(&path)
            .unwrap();
        DeviceContext::new(Box::new(NetworkRestorer::load(&path, 2, SIZE as usize).unwrap()))
    }

    /// Face whose canonical crop covers `[offset, offset + SIZE)` of the image.
    fn face_at(offset: f32, confidence: f32) -> Detection {
        let mut landmarks: Landmarks = *Aligner::new(SIZE).template();
        for p in landmarks.iter_mut() {
            p.0 += offset;
            p.1 += offset;
        }
        Detection {
            x1: offset,
            y1: offset,
            x2: offset + SIZE as f32,
            y2: offset + SIZE as f32,
            confidence,
            landmarks,
        }
    }

    fn assert_close(actual: Rgb<u8>, expected: f32) {
        for c in 0..3 {
            assert!((actual[c] as f32 - expected).abs() <= 1.0, "{actual:?} vs {expected}");
        }
    }

    #[test]
    fn test_no_faces_gives_background() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let options = PipelineOptions {
            upscale: 1,
            only_center_face: false,
        };
        let pipeline = RestorePipeline::new(&ctx, Box::new(FixedLocator(vec![])), options);

        let image = RgbImage::from_fn(40, 30, |x, y| Rgb([x as u8, y as u8, 77]));
        let result = pipeline.process(&image).unwrap();
        assert_eq!(result.image, image);
        assert!(result.restored_faces.is_empty());
    }

    #[test]
    fn test_centered_face_restored() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let options = PipelineOptions {
            upscale: 1,
            only_center_face: false,
        };
        let pipeline = RestorePipeline::new(&ctx, Box::new(FixedLocator(vec![face_at(16.0, 0.9)])), options);

        let background = Rgb([60, 120, 180]);
        let image = RgbImage::from_pixel(64, 64, background);
        let result = pipeline.process(&image).unwrap();

        assert_eq!(result.image.dimensions(), (64, 64));
        assert_eq!(result.restored_faces.len(), 1);
        let center = *result.image.get_pixel(32, 32);
        for c in 0..3 {
            assert!((center[c] as f32 - restored_value(background[c])).abs() <= 1.0);
        }
        for (x, y) in [(0, 0), (63, 0), (0, 63), (63, 63), (8, 32)] {
            assert_eq!(*result.image.get_pixel(x, y), background);
        }
    }

    #[test]
    fn test_upscale_without_upsampler() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let options = PipelineOptions {
            upscale: 2,
            only_center_face: false,
        };
        let pipeline = RestorePipeline::new(&ctx, Box::new(FixedLocator(vec![face_at(16.0, 0.9)])), options);
        let image = RgbImage::from_pixel(64, 64, Rgb([10, 10, 10]));
        let result = pipeline.process(&image).unwrap();
        assert_eq!(result.image.dimensions(), (128, 128));
        assert_close(*result.image.get_pixel(64, 64), restored_value(10));
    }

    #[test]
    fn test_only_center_face() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let faces = vec![face_at(0.0, 0.95), face_at(48.0, 0.9), face_at(24.0, 0.8)];
        let options = PipelineOptions {
            upscale: 1,
            only_center_face: true,
        };
        let pipeline = RestorePipeline::new(&ctx, Box::new(FixedLocator(faces)), options);
        let result = pipeline.process(&RgbImage::from_pixel(80, 80, Rgb([0, 0, 0]))).unwrap();
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].x1, 24.0);
        assert_eq!(result.restored_faces.len(), 1);
    }

    #[test]
    fn test_several_faces_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let faces = vec![face_at(0.0, 0.9), face_at(40.0, 0.8), face_at(80.0, 0.7)];
        let options = PipelineOptions {
            upscale: 1,
            only_center_face: false,
        };
        let pipeline = RestorePipeline::new(&ctx, Box::new(FixedLocator(faces)), options);
        let result = pipeline.process(&RgbImage::from_pixel(120, 120, Rgb([200, 200, 200]))).unwrap();
        assert_eq!(result.cropped_faces.len(), 3);
        assert_eq!(result.restored_faces.len(), 3);
        assert_close(*result.image.get_pixel(96, 96), restored_value(200));
    }

    #[test]
    fn test_aligned_input() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let pipeline = RestorePipeline::aligned(&ctx);
        assert!(pipeline.is_aligned());

        let image = RgbImage::from_pixel(SIZE, SIZE, Rgb([100, 100, 100]));
        let result = pipeline.process(&image).unwrap();
        assert_eq!(result.image.dimensions(), (SIZE, SIZE));
        assert_close(*result.image.get_pixel(5, 5), restored_value(100));
        assert_eq!(result.cropped_faces.len(), 1);
    }

    #[test]
    fn test_detector_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let pipeline = RestorePipeline::new(&ctx, Box::new(BrokenLocator), PipelineOptions::default());
        let err = pipeline.process(&RgbImage::new(8, 8)).unwrap_err();
        assert!(matches!(err, PipelineError::Detection(_)));
    }
}
