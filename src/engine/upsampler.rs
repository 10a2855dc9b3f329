//! Background upsampling
//!
//! The background is either resized with a classic filter or run through a
//! super-resolution network in fixed-size tiles.

use std::path::Path;
use std::time::Instant;

use image::{Rgb, RgbImage};
use tract_onnx::prelude::*;

use crate::error::ExecutionError;

use super::preprocess::{image_to_unit_tensor, unit_tensor_to_image};
use super::runtime::{output_array4, Plan};

/// Produces the background the restored faces are pasted onto.
pub trait BackgroundUpsampler: Send + Sync {
    /// Upsample `image` by an integer `scale`.
    fn upsample(&self, image: &RgbImage, scale: u32) -> Result<RgbImage, ExecutionError>;

    fn describe(&self) -> String;
}

/// Lanczos resize; scale 1 returns the image unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResizeUpsampler;

impl BackgroundUpsampler for ResizeUpsampler {
    fn upsample(&self, image: &RgbImage, scale: u32) -> Result<RgbImage, ExecutionError> {
        Ok(resize_to_scale(image, scale))
    }

    fn describe(&self) -> String {
        "lanczos resize".to_string()
    }
}

fn resize_to_scale(image: &RgbImage, scale: u32) -> RgbImage {
    if scale <= 1 {
        return image.clone();
    }
    image::imageops::resize(
        image,
        image.width() * scale,
        image.height() * scale,
        image::imageops::FilterType::Lanczos3,
    )
}

/// Super-resolution network applied tile by tile.
///
/// Each tile is `tile` pixels plus `tile_pad` of context on every side,
/// taken with edge replication, so the network always sees one fixed input
/// shape.
#[derive(Debug)]
pub struct ModelUpsampler {
    plan: Plan,
    native_scale: u32,
    tile: u32,
    tile_pad: u32,
}

impl ModelUpsampler {
    pub fn load(path: &Path, native_scale: u32, tile: u32, tile_pad: u32) -> Result<Self, ExecutionError> {
        let start = Instant::now();
        let window = (tile + 2 * tile_pad) as usize;
        let load_err = |e: anyhow::Error| ExecutionError::NetworkLoad {
            path: path.to_path_buf(),
            reason: format!("{e:#}"),
        };
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|m| m.with_input_fact(0, f32::fact([1, 3, window, window]).into()))
            .and_then(|m| m.into_typed())
            .and_then(|m| m.into_decluttered())
            .map_err(load_err)?;
        let plan = Plan::from_typed(model).map_err(load_err)?;
        tracing::info!(
            "Background network {} loaded in {:?} (x{}, tile {}+{})",
            path.display(),
            start.elapsed(),
            native_scale,
            tile,
            tile_pad
        );
        Ok(Self {
            plan,
            native_scale: native_scale.max(1),
            tile: tile.max(1),
            tile_pad,
        })
    }

    fn run_tile(&self, window: &RgbImage) -> Result<RgbImage, ExecutionError> {
        let input = Tensor::from(image_to_unit_tensor(window));
        let outputs = self
            .plan
            .run(input)
            .map_err(|e| ExecutionError::Runtime(format!("{e:#}")))?;
        let output = output_array4(&outputs, 0).map_err(|e| ExecutionError::Runtime(format!("{e:#}")))?;
        let expected = window.width() as usize * self.native_scale as usize;
        let shape = output.shape();
        if shape[2] != expected || shape[3] != expected {
            return Err(ExecutionError::ShapeMismatch {
                expected: vec![1, 3, expected, expected],
                actual: shape.to_vec(),
            });
        }
        Ok(unit_tensor_to_image(&output.view()))
    }

    /// Upsample at the network's native scale.
    fn upsample_native(&self, image: &RgbImage) -> Result<RgbImage, ExecutionError> {
        let (width, height) = image.dimensions();
        let scale = self.native_scale;
        let window = self.tile + 2 * self.tile_pad;
        let mut output = RgbImage::new(width * scale, height * scale);

        let mut tiles = 0;
        for y0 in (0..height).step_by(self.tile as usize) {
            for x0 in (0..width).step_by(self.tile as usize) {
                let x1 = (x0 + self.tile).min(width);
                let y1 = (y0 + self.tile).min(height);

                let padded = RgbImage::from_fn(window, window, |px, py| {
                    let sx = (x0 as i64 - self.tile_pad as i64 + px as i64).clamp(0, width as i64 - 1);
                    let sy = (y0 as i64 - self.tile_pad as i64 + py as i64).clamp(0, height as i64 - 1);
                    *image.get_pixel(sx as u32, sy as u32)
                });
                let upscaled = self.run_tile(&padded)?;

                let offset = self.tile_pad * scale;
                for ty in 0..(y1 - y0) * scale {
                    for tx in 0..(x1 - x0) * scale {
                        let px: Rgb<u8> = *upscaled.get_pixel(offset + tx, offset + ty);
                        output.put_pixel(x0 * scale + tx, y0 * scale + ty, px);
                    }
                }
                tiles += 1;
            }
        }
        tracing::debug!("Background upsampled in {} tile(s)", tiles);
        Ok(output)
    }
}

impl BackgroundUpsampler for ModelUpsampler {
    fn upsample(&self, image: &RgbImage, scale: u32) -> Result<RgbImage, ExecutionError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(image.clone());
        }
        let native = self.upsample_native(image)?;
        if scale == self.native_scale {
            return Ok(native);
        }
        Ok(image::imageops::resize(
            &native,
            image.width() * scale.max(1),
            image.height() * scale.max(1),
            image::imageops::FilterType::Lanczos3,
        ))
    }

    fn describe(&self) -> String {
        format!("network x{} (tile {})", self.native_scale, self.tile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::graph::{test_graphs, GraphArtifact};

    #[test]
    fn test_resize_scale_one_is_identity() {
        let image = RgbImage::from_fn(7, 5, |x, y| Rgb([x as u8 * 30, y as u8 * 40, 9]));
        assert_eq!(ResizeUpsampler.upsample(&image, 1).unwrap(), image);
    }

    #[test]
    fn test_resize_scale_two() {
        let image = RgbImage::from_pixel(7, 5, Rgb([80, 90, 100]));
        let out = ResizeUpsampler.upsample(&image, 2).unwrap();
        assert_eq!(out.dimensions(), (14, 10));
    }

    #[test]
    fn test_tiles_cover_whole_image() {
        // Per-pixel network, so tiling must not change the result
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bg.onnx");
        let (tile, pad) = (4, 1);
        GraphArtifact::from_proto(test_graphs::affine(1, (tile + 2 * pad) as usize))
            .write(&path)
            .unwrap();
        let upsampler = ModelUpsampler::load(&path, 1, tile, pad).unwrap();

        let image = RgbImage::from_fn(11, 6, |x, y| Rgb([(x * 23) as u8, (y * 41) as u8, 200]));
        let out = upsampler.upsample(&image, 1).unwrap();
        assert_eq!(out.dimensions(), (11, 6));
        for (x, y, px) in out.enumerate_pixels() {
            let src = image.get_pixel(x, y);
            for c in 0..3 {
                let expected = ((src[c] as f32 / 255.0 * 0.5 + 0.1).clamp(0.0, 1.0) * 255.0).round();
                assert!((px[c] as f32 - expected).abs() <= 1.0, "({x}, {y})");
            }
        }
    }
}
