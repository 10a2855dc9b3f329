//! SCRFD Face Detector
//!
//! Face detection using the InsightFace SCRFD model.
//! Outputs bounding boxes and 5-point landmarks in input-image coordinates.

use std::path::Path;
use std::time::Instant;

use image::RgbImage;
use tract_onnx::prelude::*;

use crate::config::DetectionConfig;
use crate::error::DetectionError;

use super::align::Landmarks;
use super::preprocess::{image_to_detector_tensor, letterbox, ResizeInfo};
use super::runtime::{output_f32, Plan};

/// Face detection result
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub landmarks: Landmarks,
}

impl Detection {
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Locates faces in an image.
///
/// Output order is stable for a given image: descending confidence, ties
/// broken by position.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectionError>;
}

/// SCRFD Face Detector
#[derive(Debug)]
pub struct ScrfdDetector {
    plan: Plan,
    layout: OutputLayout,
    input_size: u32,
    confidence_threshold: f32,
    nms_threshold: f32,
}

/// Stride/anchor configuration inferred from the model's output count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputLayout {
    fmc: usize,
    num_anchors: usize,
}

impl OutputLayout {
    fn from_output_count(count: usize) -> Result<Self, DetectionError> {
        match count {
            9 => Ok(Self { fmc: 3, num_anchors: 2 }),
            15 => Ok(Self { fmc: 5, num_anchors: 1 }),
            _ => Err(DetectionError::UnexpectedOutputs(count)),
        }
    }

    fn strides(&self) -> &'static [u32] {
        if self.fmc == 3 {
            &[8, 16, 32]
        } else {
            &[8, 16, 32, 64, 128]
        }
    }
}

impl ScrfdDetector {
    /// Load the detector and fix its input to `input_size` squared.
    pub fn load(path: &Path, config: &DetectionConfig) -> Result<Self, DetectionError> {
        let start = Instant::now();
        let load_err = |e: anyhow::Error| DetectionError::ModelLoad {
            path: path.to_path_buf(),
            reason: format!("{e:#}"),
        };
        let size = config.input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|m| m.with_input_fact(0, f32::fact([1, 3, size, size]).into()))
            .and_then(|m| m.into_typed())
            .map_err(load_err)?;
        let plan = Plan::from_typed(model).map_err(load_err)?;

        let layout = match OutputLayout::from_output_count(plan.output_count()) {
            Ok(layout) => layout,
            Err(_) if matches!(plan.output_count(), 6 | 10) => {
                return Err(DetectionError::ModelLoad {
                    path: path.to_path_buf(),
                    reason: "detector has no landmark outputs".to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            "Detector {} loaded in {:?} ({} outputs)",
            path.display(),
            start.elapsed(),
            plan.output_count()
        );

        Ok(Self {
            plan,
            layout,
            input_size: config.input_size,
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
        })
    }

    /// Get the confidence threshold
    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }
}

impl FaceLocator for ScrfdDetector {
    fn locate(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectionError> {
        let (padded, resize_info) = letterbox(image, self.input_size, self.input_size);
        let input: Tensor = image_to_detector_tensor(&padded).into();

        let outputs = self
            .plan
            .run(input)
            .map_err(|e| DetectionError::Inference(format!("{e:#}")))?;

        let tensors = (0..self.plan.output_count())
            .map(|ix| output_f32(&outputs, ix))
            .collect::<TractResult<Vec<_>>>()
            .map_err(|e| DetectionError::Inference(format!("{e:#}")))?;

        let candidates = decode_outputs(
            &tensors,
            self.layout,
            self.input_size,
            self.confidence_threshold,
            &resize_info,
        );
        tracing::debug!("Total {} faces before NMS", candidates.len());

        let detections = nms(candidates, self.nms_threshold);
        tracing::info!("Detected {} faces after NMS", detections.len());
        Ok(detections)
    }
}

/// Decode SCRFD outputs.
///
/// For `fmc` strides the outputs are laid out as `fmc` score maps, then `fmc`
/// distance-encoded box maps, then `fmc` keypoint maps.
fn decode_outputs(
    outputs: &[Vec<f32>],
    layout: OutputLayout,
    input_size: u32,
    threshold: f32,
    resize_info: &ResizeInfo,
) -> Vec<Detection> {
    let mut all_boxes = Vec::new();
    let fmc = layout.fmc;

    for (idx, &stride) in layout.strides().iter().enumerate() {
        let (Some(scores), Some(bboxes), Some(kps)) = (
            outputs.get(idx),
            outputs.get(idx + fmc),
            outputs.get(idx + fmc * 2),
        ) else {
            continue;
        };

        let feat = input_size / stride;
        let stride = stride as f32;
        let anchors = (0..feat).flat_map(|y| {
            (0..feat).flat_map(move |x| {
                std::iter::repeat((x as f32 * stride, y as f32 * stride)).take(layout.num_anchors)
            })
        });

        for (i, (cx, cy)) in anchors.enumerate() {
            let Some(&score) = scores.get(i) else { break };
            if score < threshold {
                continue;
            }
            let (Some(b), Some(k)) = (bboxes.get(i * 4..i * 4 + 4), kps.get(i * 10..i * 10 + 10)) else {
                continue;
            };

            // Distances to left, top, right, bottom
            let (x1, y1) = resize_info.to_original(cx - b[0] * stride, cy - b[1] * stride);
            let (x2, y2) = resize_info.to_original(cx + b[2] * stride, cy + b[3] * stride);

            let mut landmarks = [(0.0f32, 0.0f32); 5];
            for (j, lm) in landmarks.iter_mut().enumerate() {
                *lm = resize_info.to_original(cx + k[j * 2] * stride, cy + k[j * 2 + 1] * stride);
            }

            let w = resize_info.original_width as f32;
            let h = resize_info.original_height as f32;
            all_boxes.push(Detection {
                x1: x1.clamp(0.0, w),
                y1: y1.clamp(0.0, h),
                x2: x2.clamp(0.0, w),
                y2: y2.clamp(0.0, h),
                confidence: score,
                landmarks,
            });
        }
    }

    all_boxes
}

/// Non-maximum suppression; output is ordered by descending confidence,
/// ties broken top-to-bottom then left-to-right.
pub fn nms(mut boxes: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    boxes.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(a.y1.total_cmp(&b.y1))
            .then(a.x1.total_cmp(&b.x1))
    });

    let mut keep: Vec<Detection> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| compute_iou(k, &candidate) <= threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Compute intersection over union
pub fn compute_iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Keep only the detection closest to the image center.
pub fn select_center_face(detections: Vec<Detection>, width: u32, height: u32) -> Vec<Detection> {
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    detections
        .into_iter()
        .min_by(|a, b| {
            let da = (a.center().0 - cx).powi(2) + (a.center().1 - cy).powi(2);
            let db = (b.center().0 - cx).powi(2) + (b.center().1 - cy).powi(2);
            da.total_cmp(&db)
        })
        .into_iter()
        .collect()
}
