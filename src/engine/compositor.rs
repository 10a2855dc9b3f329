//! Paste restored faces back into the full image
//!
//! Every restored crop is inverse-warped into output space together with a
//! soft blend mask and alpha-composited over the background. Faces are pasted
//! in detection order, so where masks overlap the later face wins. A face
//! whose transform cannot be inverted fails the whole image.

use std::sync::Arc;
use std::time::Instant;

use image::{Rgb, RgbImage};

use crate::error::{AlignmentError, ExecutionError, PipelineError};

use super::align::{sample_bilinear, to_u8, AlignedFace, SimilarityTransform};
use super::executor::RestoredFace;

/// Soft-edged alpha mask at canonical size: 0 on the rim, 1 inside, with a
/// smooth ramp of about a twentieth of the crop size.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendMask {
    size: u32,
    values: Vec<f32>,
}

impl BlendMask {
    pub fn new(size: u32) -> Self {
        let feather = (size as f32 / 20.0).max(1.0);
        let last = size.saturating_sub(1);
        let mut values = Vec::with_capacity((size * size) as usize);
        for y in 0..size {
            for x in 0..size {
                let edge = x.min(y).min(last - x).min(last - y) as f32;
                let t = (edge / feather).clamp(0.0, 1.0);
                values.push(t * t * (3.0 - 2.0 * t));
            }
        }
        Self { size, values }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn value(&self, x: u32, y: u32) -> f32 {
        self.values[(y * self.size + x) as usize]
    }

    /// Bilinear sample; 0 outside the crop.
    pub fn sample(&self, x: f64, y: f64) -> f32 {
        let last = self.size.saturating_sub(1) as f64;
        if self.size == 0 || !(0.0..=last).contains(&x) || !(0.0..=last).contains(&y) {
            return 0.0;
        }
        let x0 = x.floor() as u32;
        let y0 = y.floor() as u32;
        let x1 = (x0 + 1).min(self.size - 1);
        let y1 = (y0 + 1).min(self.size - 1);
        let fx = (x - x0 as f64) as f32;
        let fy = (y - y0 as f64) as f32;
        self.value(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + self.value(x1, y0) * fx * (1.0 - fy)
            + self.value(x0, y1) * (1.0 - fx) * fy
            + self.value(x1, y1) * fx * fy
    }
}

/// `bg * (1 - m) + fg * m`, exact at both ends of the mask range.
pub fn blend_pixel(bg: [u8; 3], fg: [f32; 3], m: f32) -> [u8; 3] {
    if m <= 0.0 {
        return bg;
    }
    if m >= 1.0 {
        return to_u8(fg);
    }
    let mut out = [0.0f32; 3];
    for c in 0..3 {
        out[c] = bg[c] as f32 * (1.0 - m) + fg[c] * m;
    }
    to_u8(out)
}

/// Inverse-warp and blend restored faces onto a background.
#[derive(Debug, Clone)]
pub struct Compositor {
    mask: Arc<BlendMask>,
}

impl Compositor {
    pub fn new(size: u32) -> Self {
        Self {
            mask: Arc::new(BlendMask::new(size)),
        }
    }

    pub fn mask(&self) -> &BlendMask {
        &self.mask
    }

    /// Paste every `(face, restored)` pair onto `background`, which is the
    /// input image already upscaled by `scale`.
    pub fn compose(
        &self,
        background: &RgbImage,
        scale: u32,
        faces: &[AlignedFace],
        restored: &[RestoredFace],
    ) -> Result<RgbImage, PipelineError> {
        if faces.len() != restored.len() {
            return Err(ExecutionError::ShapeMismatch {
                expected: vec![faces.len()],
                actual: vec![restored.len()],
            }
            .into());
        }
        let start = Instant::now();
        let mut output = background.clone();
        for (face, restored) in faces.iter().zip(restored) {
            self.paste(&mut output, scale, face, restored)?;
        }
        if !faces.is_empty() {
            tracing::debug!("Pasted {} face(s) in {:?}", faces.len(), start.elapsed());
        }
        Ok(output)
    }

    fn paste(
        &self,
        output: &mut RgbImage,
        scale: u32,
        face: &AlignedFace,
        restored: &RestoredFace,
    ) -> Result<(), AlignmentError> {
        let size = self.mask.size();
        let (out_w, out_h) = output.dimensions();
        if out_w == 0 || out_h == 0 {
            return Ok(());
        }

        // Output pixel center -> input image -> canonical crop
        let s = scale.max(1) as f64;
        let offset = 0.5 / s - 0.5;
        let crop_from_out = SimilarityTransform::from_matrix([[1.0 / s, 0.0, offset], [0.0, 1.0 / s, offset]])
            .then(&face.transform);
        let out_from_crop = crop_from_out.inverse().ok_or(AlignmentError::NonInvertible {
            face: face.detection_index,
            det: crop_from_out.determinant(),
        })?;

        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (cx, cy) in [(0.0, 0.0), (size as f64, 0.0), (0.0, size as f64), (size as f64, size as f64)] {
            let (x, y) = out_from_crop.apply(cx, cy);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        let x_start = min_x.floor().max(0.0) as u32;
        let y_start = min_y.floor().max(0.0) as u32;
        let x_end = (max_x.ceil().max(0.0) as u32).min(out_w - 1);
        let y_end = (max_y.ceil().max(0.0) as u32).min(out_h - 1);
        if x_start > x_end || y_start > y_end {
            return Ok(());
        }

        for y in y_start..=y_end {
            for x in x_start..=x_end {
                let (cx, cy) = crop_from_out.apply(x as f64, y as f64);
                let m = self.mask.sample(cx, cy);
                if m <= 0.0 {
                    continue;
                }
                let fg = sample_bilinear(&restored.image, cx, cy);
                let bg = output.get_pixel(x, y).0;
                output.put_pixel(x, y, Rgb(blend_pixel(bg, fg, m)));
            }
        }
        Ok(())
    }
}
