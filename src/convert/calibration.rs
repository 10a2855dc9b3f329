//! int8 calibration
//!
//! Runs representative face images through the full-precision network and
//! records the activation ranges the int8 engine is quantized against. The
//! ranges are cached on disk so later builds can skip the image pass.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tract_onnx::prelude::tract_ndarray::{s, Array4};
use tract_onnx::prelude::*;

use crate::engine::preprocess::write_face_slot;
use crate::engine::runtime::{output_f32, Plan};
use crate::error::BuildError;
use crate::utils::image::{list_images, read_image};
use crate::utils::math::{abs_max, fake_quantize_i8, int8_scale};

/// Activation ranges recorded during calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRanges {
    pub input_absmax: f32,
    pub output_absmax: f32,
    pub num_images: usize,
}

/// Snap engine input to the int8 grid of the calibrated input range.
pub fn quantize_input(values: &mut [f32], ranges: &CalibrationRanges) {
    fake_quantize_i8(values, int8_scale(ranges.input_absmax));
}

/// Read a calibration cache if the file exists.
pub fn read_cache(path: &Path) -> Result<Option<CalibrationRanges>, BuildError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path).map_err(|e| BuildError::io(path, e))?;
    let ranges = serde_json::from_slice(&data)
        .map_err(|e| BuildError::Calibration(format!("cache {} is corrupt: {e}", path.display())))?;
    tracing::info!("Using calibration cache file: {}", path.display());
    Ok(Some(ranges))
}

pub fn write_cache(path: &Path, ranges: &CalibrationRanges) -> Result<(), BuildError> {
    let data = serde_json::to_vec_pretty(ranges)
        .map_err(|e| BuildError::Calibration(e.to_string()))?;
    std::fs::write(path, data).map_err(|e| BuildError::io(path, e))?;
    tracing::info!("Writing calibration cache data to: {}", path.display());
    Ok(())
}

/// Yields exact `[batch, 3, size, size]` batches of calibration images.
///
/// Trailing images that do not fill a whole batch are dropped.
#[derive(Debug)]
pub struct ImageBatcher {
    files: Vec<PathBuf>,
    batch_size: usize,
    size: u32,
    image_index: usize,
}

impl ImageBatcher {
    pub fn new(
        dir: &Path,
        batch_size: usize,
        size: u32,
        max_num_images: usize,
    ) -> Result<Self, BuildError> {
        let mut files = list_images(dir).map_err(|e| BuildError::Calibration(e.to_string()))?;
        let batch_size = batch_size.max(1);
        let usable = files.len().min(max_num_images) / batch_size * batch_size;
        if usable == 0 {
            return Err(BuildError::Calibration(format!(
                "{} holds {} image(s), need at least one batch of {}",
                dir.display(),
                files.len(),
                batch_size
            )));
        }
        files.truncate(usable);
        Ok(Self {
            files,
            batch_size,
            size,
            image_index: 0,
        })
    }

    pub fn num_images(&self) -> usize {
        self.files.len()
    }

    pub fn image_index(&self) -> usize {
        self.image_index
    }
}

impl Iterator for ImageBatcher {
    type Item = Result<Array4<f32>, BuildError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.image_index >= self.files.len() {
            return None;
        }
        let size = self.size as usize;
        let mut batch = Array4::<f32>::zeros((self.batch_size, 3, size, size));
        let paths = &self.files[self.image_index..self.image_index + self.batch_size];
        for (slot, path) in paths.iter().enumerate() {
            let image = match read_image(path) {
                Ok(image) => image,
                Err(e) => return Some(Err(BuildError::Calibration(format!("{}: {e}", path.display())))),
            };
            let image = if image.dimensions() == (self.size, self.size) {
                image
            } else {
                image::imageops::resize(&image, self.size, self.size, image::imageops::FilterType::Triangle)
            };
            write_face_slot(batch.slice_mut(s![slot, .., .., ..]), &image);
        }
        self.image_index += self.batch_size;
        Some(Ok(batch))
    }
}

/// Run every batch through `plan` and record input/output ranges.
pub fn calibrate(plan: &Plan, batches: ImageBatcher) -> Result<CalibrationRanges, BuildError> {
    let total = batches.num_images();
    let mut ranges = CalibrationRanges {
        input_absmax: 0.0,
        output_absmax: 0.0,
        num_images: 0,
    };
    for batch in batches {
        let batch = batch?;
        let images = batch.shape()[0];
        ranges.input_absmax = ranges
            .input_absmax
            .max(abs_max(batch.as_slice().unwrap_or(&[])));

        let outputs = plan
            .run(Tensor::from(batch))
            .map_err(|e| BuildError::Calibration(format!("{e:#}")))?;
        let output = output_f32(&outputs, 0).map_err(|e| BuildError::Calibration(format!("{e:#}")))?;
        ranges.output_absmax = ranges.output_absmax.max(abs_max(&output));
        ranges.num_images += images;
        tracing::info!("Calibrating image {} / {}", ranges.num_images, total);
    }
    tracing::info!("Finished calibration batches");
    Ok(ranges)
}
