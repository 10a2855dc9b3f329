//! Service layer types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::Detection;

/// One detected face
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceReport {
    pub index: usize,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceReport {
    pub fn new(index: usize, detection: &Detection) -> Self {
        Self {
            index,
            x1: detection.x1,
            y1: detection.y1,
            x2: detection.x2,
            y2: detection.y2,
            confidence: detection.confidence,
        }
    }
}

/// Outcome for a single input image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageReport {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub faces: Vec<FaceReport>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

impl ImageReport {
    pub fn failed(input: PathBuf, error: &anyhow::Error, elapsed_ms: u64) -> Self {
        Self {
            input,
            output: None,
            faces: Vec::new(),
            elapsed_ms,
            error: Some(format!("{error:#}")),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.output.is_some()
    }
}

/// Summary of a directory run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub images: Vec<ImageReport>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn processed(&self) -> usize {
        self.images.len()
    }

    pub fn written(&self) -> usize {
        self.images.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.images.iter().filter(|r| r.error.is_some()).count()
    }

    pub fn total_faces(&self) -> usize {
        self.images.iter().map(|r| r.faces.len()).sum()
    }

    /// Inputs existed but nothing was written.
    pub fn is_failure(&self) -> bool {
        self.processed() > 0 && self.written() == 0
    }
}
