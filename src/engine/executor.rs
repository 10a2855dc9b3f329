//! Restoration executor
//!
//! Batches aligned face crops into the device arena and runs the backend.
//!
//! Batch policy: faces are processed in consecutive chunks of the backend's
//! capacity. A chunk smaller than the capacity is padded with zero slots
//! whose outputs are discarded. Output order always equals input order.

use std::time::Instant;

use image::RgbImage;
use tract_onnx::prelude::tract_ndarray::s;

use crate::error::ExecutionError;

use super::align::AlignedFace;
use super::context::DeviceContext;
use super::preprocess::{face_slot_to_image, write_face_slot};

/// A restored canonical-size face, paired with its aligned input.
#[derive(Debug, Clone)]
pub struct RestoredFace {
    pub image: RgbImage,
    pub detection_index: usize,
}

/// Runs restoration on a borrowed device context.
#[derive(Debug, Clone, Copy)]
pub struct RestorationExecutor<'a> {
    ctx: &'a DeviceContext,
}

impl<'a> RestorationExecutor<'a> {
    pub fn new(ctx: &'a DeviceContext) -> Self {
        Self { ctx }
    }

    pub fn canonical_size(&self) -> u32 {
        self.ctx.canonical_size() as u32
    }

    /// Restore `faces`, one output per input, same order.
    pub fn restore(&self, faces: &[AlignedFace]) -> Result<Vec<RestoredFace>, ExecutionError> {
        if faces.is_empty() {
            return Ok(Vec::new());
        }
        let size = self.ctx.canonical_size();
        if self.ctx.batch_capacity() == 0 {
            return Err(ExecutionError::ShapeMismatch {
                expected: vec![1, 3, size, size],
                actual: vec![0, 3, size, size],
            });
        }
        for face in faces {
            let (w, h) = face.crop.dimensions();
            if (w as usize, h as usize) != (size, size) {
                return Err(ExecutionError::ShapeMismatch {
                    expected: vec![3, size, size],
                    actual: vec![3, h as usize, w as usize],
                });
            }
        }

        self.ctx.with_session(|backend| {
            let capacity = backend.restorer.batch_capacity();
            let mut restored = Vec::with_capacity(faces.len());

            for (chunk_index, chunk) in faces.chunks(capacity).enumerate() {
                let start = Instant::now();
                backend.arena.fill(0.0);
                for (slot, face) in chunk.iter().enumerate() {
                    write_face_slot(backend.arena.slice_mut(s![slot, .., .., ..]), &face.crop);
                }

                let output = backend.restorer.infer(backend.arena.view())?;
                if output.shape() != backend.arena.shape() {
                    return Err(ExecutionError::ShapeMismatch {
                        expected: backend.arena.shape().to_vec(),
                        actual: output.shape().to_vec(),
                    });
                }
                let output = output.view();
                for (slot, face) in chunk.iter().enumerate() {
                    restored.push(RestoredFace {
                        image: face_slot_to_image(&output, slot),
                        detection_index: face.detection_index,
                    });
                }
                tracing::debug!(
                    "Batch {}: {} face(s) + {} padding in {:?}",
                    chunk_index,
                    chunk.len(),
                    capacity - chunk.len(),
                    start.elapsed()
                );
            }
            Ok(restored)
        })
    }
}
