//! Error taxonomy
//!
//! Uses `thiserror` for library errors. The binary wraps these in
//! `anyhow::Result` with context at call sites.

use std::path::PathBuf;

use thiserror::Error;

/// Unreadable or missing input.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read image {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("image dimensions are zero")]
    ZeroDimensions,

    #[error("input directory {0} does not exist or is not a directory")]
    NotADirectory(PathBuf),

    #[error("input directory {0} contains no images")]
    EmptyInputDirectory(PathBuf),
}

/// Internal detector failure. Finding no face is not an error.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("failed to load detector model {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("detector inference failed: {0}")]
    Inference(String),

    #[error("detector produced {0} outputs, expected 6, 9, 10 or 15")]
    UnexpectedOutputs(usize),
}

/// Malformed landmarks for a given face.
#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("face {face}: landmarks are degenerate (all points coincide)")]
    Degenerate { face: usize },

    #[error("face {face}: landmarks contain non-finite coordinates")]
    NonFinite { face: usize },

    #[error("face {face}: similarity transform is not invertible (det = {det})")]
    NonInvertible { face: usize, det: f64 },
}

/// Failure while loading or running the restoration backend.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("engine file {path} could not be read: {reason}")]
    EngineUnreadable { path: PathBuf, reason: String },

    #[error("engine file is malformed: {0}")]
    InvalidEngine(String),

    #[error("engine was built for {built}, this runtime is {runtime}")]
    IdentityMismatch { built: String, runtime: String },

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },

    #[error("failed to load restoration network {path}: {reason}")]
    NetworkLoad { path: PathBuf, reason: String },

    #[error("runtime execution failed: {0}")]
    Runtime(String),

    #[error("device context has been released")]
    Released,
}

/// Offline engine build failure. Always aborts the build phase.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unsupported precision mode {0:?}, expected one of fp32, fp16, int8")]
    UnsupportedPrecision(String),

    #[error("failed to load graph {path}: {reason}")]
    GraphLoad { path: PathBuf, reason: String },

    #[error("graph is invalid: {0}")]
    InvalidGraph(String),

    #[error("graph uses {} unsupported operator(s): {}", .0.len(), .0.join(", "))]
    UnsupportedOperators(Vec<String>),

    #[error("int8 precision requires a calibration input directory or an existing calibration cache")]
    MissingCalibrationData,

    #[error("calibration failed: {0}")]
    Calibration(String),

    #[error("insufficient memory: build needs about {required_mb} MiB, workspace limit is {limit_mb} MiB")]
    InsufficientMemory { required_mb: u64, limit_mb: u64 },

    #[error("engine compilation failed: {0}")]
    Compile(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io { path: path.into(), source }
    }
}

/// Per-image pipeline failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Alignment(#[from] AlignmentError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}
