//! Face alignment
//!
//! Fits the similarity transform that maps detected 5-point landmarks onto the
//! canonical FFHQ template and resamples the face into a square crop.

use image::{Rgb, RgbImage};

use crate::error::AlignmentError;

use super::detector::Detection;

/// Five facial landmarks: left eye, right eye, nose, left mouth, right mouth.
pub type Landmarks = [(f32, f32); 5];

/// Canonical landmark positions for a 512x512 face crop (FFHQ alignment).
pub const FFHQ_TEMPLATE_512: Landmarks = [
    (192.981_38, 239.947_08),
    (318.902_77, 240.193_6),
    (256.634_16, 314.019_35),
    (201.261_17, 371.410_43),
    (313.089_05, 371.151_18),
];

const EPSILON: f64 = 1e-9;

/// 2x3 affine matrix restricted to scale + rotation + translation.
///
/// Maps points of a source frame into a destination frame:
/// `[x', y'] = [[a, -b], [b, a]] * [x, y] + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    m: [[f64; 3]; 2],
}

impl SimilarityTransform {
    pub fn identity() -> Self {
        Self::from_matrix([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]])
    }

    /// Uniform scaling about the origin.
    pub fn scaling(factor: f64) -> Self {
        Self::from_matrix([[factor, 0.0, 0.0], [0.0, factor, 0.0]])
    }

    pub fn from_matrix(m: [[f64; 3]; 2]) -> Self {
        Self { m }
    }

    pub fn matrix(&self) -> [[f64; 3]; 2] {
        self.m
    }

    pub fn determinant(&self) -> f64 {
        self.m[0][0] * self.m[1][1] - self.m[0][1] * self.m[1][0]
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.m[0][0] * x + self.m[0][1] * y + self.m[0][2],
            self.m[1][0] * x + self.m[1][1] * y + self.m[1][2],
        )
    }

    pub fn apply_landmarks(&self, points: &Landmarks) -> Landmarks {
        let mut out = [(0.0f32, 0.0f32); 5];
        for (dst, &(x, y)) in out.iter_mut().zip(points.iter()) {
            let (tx, ty) = self.apply(x as f64, y as f64);
            *dst = (tx as f32, ty as f32);
        }
        out
    }

    /// Inverse mapping, or `None` when the matrix is singular.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.determinant();
        if !det.is_finite() || det.abs() < EPSILON {
            return None;
        }
        let [[a, b, c], [d, e, f]] = self.m;
        let ia = e / det;
        let ib = -b / det;
        let id = -d / det;
        let ie = a / det;
        Some(Self::from_matrix([
            [ia, ib, -(ia * c + ib * f)],
            [id, ie, -(id * c + ie * f)],
        ]))
    }

    /// `self` followed by `next`.
    pub fn then(&self, next: &Self) -> Self {
        let [[a, b, c], [d, e, f]] = self.m;
        let [[na, nb, nc], [nd, ne, nf]] = next.m;
        Self::from_matrix([
            [na * a + nb * d, na * b + nb * e, na * c + nb * f + nc],
            [nd * a + ne * d, nd * b + ne * e, nd * c + ne * f + nf],
        ])
    }

    /// Least-squares similarity fit mapping `src` onto `dst`.
    ///
    /// Minimizes the summed squared landmark displacement; closed form for the
    /// non-reflective 2D case.
    pub fn estimate(src: &Landmarks, dst: &Landmarks, face: usize) -> Result<Self, AlignmentError> {
        if src
            .iter()
            .chain(dst.iter())
            .any(|(x, y)| !x.is_finite() || !y.is_finite())
        {
            return Err(AlignmentError::NonFinite { face });
        }

        let n = src.len() as f64;
        let (mut scx, mut scy, mut dcx, mut dcy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
        for (s, d) in src.iter().zip(dst.iter()) {
            scx += s.0 as f64;
            scy += s.1 as f64;
            dcx += d.0 as f64;
            dcy += d.1 as f64;
        }
        scx /= n;
        scy /= n;
        dcx /= n;
        dcy /= n;

        let (mut var_src, mut dot, mut cross) = (0.0f64, 0.0f64, 0.0f64);
        for (s, d) in src.iter().zip(dst.iter()) {
            let sx = s.0 as f64 - scx;
            let sy = s.1 as f64 - scy;
            let dx = d.0 as f64 - dcx;
            let dy = d.1 as f64 - dcy;
            var_src += sx * sx + sy * sy;
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
        }

        if var_src < EPSILON {
            return Err(AlignmentError::Degenerate { face });
        }

        let a = dot / var_src;
        let b = cross / var_src;
        let tx = dcx - (a * scx - b * scy);
        let ty = dcy - (b * scx + a * scy);

        let transform = Self::from_matrix([[a, -b, tx], [b, a, ty]]);
        let det = transform.determinant();
        if det.abs() < EPSILON {
            return Err(AlignmentError::NonInvertible { face, det });
        }
        Ok(transform)
    }
}

/// A canonical-size face crop with the transform that produced it.
#[derive(Debug, Clone)]
pub struct AlignedFace {
    pub crop: RgbImage,
    /// Input image coordinates -> crop coordinates.
    pub transform: SimilarityTransform,
    pub detection_index: usize,
}

/// Warps detected faces into the canonical pose.
#[derive(Debug, Clone)]
pub struct Aligner {
    size: u32,
    template: Landmarks,
}

impl Aligner {
    /// Aligner for `size`x`size` crops; the FFHQ template is scaled accordingly.
    pub fn new(size: u32) -> Self {
        let factor = size as f32 / 512.0;
        let mut template = FFHQ_TEMPLATE_512;
        for p in template.iter_mut() {
            p.0 *= factor;
            p.1 *= factor;
        }
        Self { size, template }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn template(&self) -> &Landmarks {
        &self.template
    }

    pub fn align(
        &self,
        image: &RgbImage,
        landmarks: &Landmarks,
        index: usize,
    ) -> Result<AlignedFace, AlignmentError> {
        let transform = SimilarityTransform::estimate(landmarks, &self.template, index)?;
        let inverse = transform.inverse().ok_or(AlignmentError::NonInvertible {
            face: index,
            det: transform.determinant(),
        })?;
        let crop = warp_affine(image, &inverse, self.size, self.size);
        Ok(AlignedFace {
            crop,
            transform,
            detection_index: index,
        })
    }

    /// Align every detection, preserving detection order.
    pub fn align_all(
        &self,
        image: &RgbImage,
        detections: &[Detection],
    ) -> Result<Vec<AlignedFace>, AlignmentError> {
        detections
            .iter()
            .enumerate()
            .map(|(i, det)| self.align(image, &det.landmarks, i))
            .collect()
    }

    /// Wrap an already aligned crop (resized to canonical size if needed).
    pub fn assume_aligned(&self, image: &RgbImage) -> AlignedFace {
        let (w, h) = image.dimensions();
        let crop = if (w, h) == (self.size, self.size) {
            image.clone()
        } else {
            image::imageops::resize(image, self.size, self.size, image::imageops::FilterType::Lanczos3)
        };
        let transform = SimilarityTransform::from_matrix([
            [self.size as f64 / w.max(1) as f64, 0.0, 0.0],
            [0.0, self.size as f64 / h.max(1) as f64, 0.0],
        ]);
        AlignedFace {
            crop,
            transform,
            detection_index: 0,
        }
    }
}

/// Backward-mapping warp: each output pixel samples `src_from_dst(x, y)`.
///
/// Coordinates outside the source replicate the nearest edge pixel.
pub fn warp_affine(
    image: &RgbImage,
    src_from_dst: &SimilarityTransform,
    out_width: u32,
    out_height: u32,
) -> RgbImage {
    let mut output = RgbImage::new(out_width, out_height);
    if image.width() == 0 || image.height() == 0 {
        return output;
    }
    for y in 0..out_height {
        for x in 0..out_width {
            let (sx, sy) = src_from_dst.apply(x as f64, y as f64);
            let v = sample_bilinear(image, sx, sy);
            output.put_pixel(x, y, Rgb(to_u8(v)));
        }
    }
    output
}

/// Bilinear sample with edge replication.
pub(crate) fn sample_bilinear(image: &RgbImage, x: f64, y: f64) -> [f32; 3] {
    let (w, h) = image.dimensions();
    let x = x.clamp(0.0, (w - 1) as f64);
    let y = y.clamp(0.0, (h - 1) as f64);
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = (x - x0 as f64) as f32;
    let fy = (y - y0 as f64) as f32;

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut out = [0.0f32; 3];
    for c in 0..3 {
        out[c] = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;
    }
    out
}

pub(crate) fn to_u8(v: [f32; 3]) -> [u8; 3] {
    [
        v[0].round().clamp(0.0, 255.0) as u8,
        v[1].round().clamp(0.0, 255.0) as u8,
        v[2].round().clamp(0.0, 255.0) as u8,
    ]
}
