//! Serialized engine container
//!
//! An engine file is a tar archive with two entries: `manifest.json`
//! (build identity, precision, shapes, calibration) and `model.nnef.tar`
//! (the precision-translated graph in NNEF form).

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tract_nnef::internal::Nnef;
use tract_onnx::prelude::*;
use tract_onnx_opl::WithOnnx;

use super::calibration::CalibrationRanges;
use super::identity::BuildIdentity;
use super::precision::Precision;
use crate::error::{BuildError, ExecutionError};

pub const FORMAT_VERSION: u32 = 1;

const MANIFEST_ENTRY: &str = "manifest.json";
const MODEL_ENTRY: &str = "model.nnef.tar";

/// Result of comparing the engine against the full-precision network.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub max_abs_error: f32,
    pub tolerance: f32,
    pub within_tolerance: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineManifest {
    pub format_version: u32,
    pub identity: BuildIdentity,
    pub precision: Precision,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    #[serde(default)]
    pub calibration: Option<CalibrationRanges>,
    #[serde(default)]
    pub keep_fp32: Vec<String>,
    #[serde(default)]
    pub verification: Option<Verification>,
}

impl EngineManifest {
    pub fn batch_capacity(&self) -> usize {
        self.input_shape.first().copied().unwrap_or(0)
    }

    pub fn canonical_size(&self) -> usize {
        self.input_shape.last().copied().unwrap_or(0)
    }
}

/// NNEF framework able to (de)serialize core and ONNX-specific operators.
pub fn nnef() -> Nnef {
    tract_nnef::nnef().with_onnx()
}

/// Manifest plus serialized graph.
#[derive(Debug, Clone)]
pub struct EngineFile {
    pub manifest: EngineManifest,
    model: Vec<u8>,
}

impl EngineFile {
    /// Serialize `model` (decluttered, not optimized) into a new engine.
    pub fn new(manifest: EngineManifest, model: &TypedModel) -> Result<Self, BuildError> {
        let model = nnef()
            .write_to_tar(model, Vec::new())
            .map_err(|e| BuildError::Compile(format!("serializing engine graph: {e:#}")))?;
        Ok(Self { manifest, model })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BuildError> {
        let manifest = serde_json::to_vec_pretty(&self.manifest)
            .map_err(|e| BuildError::Compile(e.to_string()))?;

        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in [(MANIFEST_ENTRY, &manifest), (MODEL_ENTRY, &self.model)] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, data.as_slice())
                .map_err(|e| BuildError::Compile(format!("writing {name}: {e}")))?;
        }
        builder
            .into_inner()
            .map_err(|e| BuildError::Compile(format!("finalizing engine: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ExecutionError> {
        let mut manifest = None;
        let mut model = None;

        let mut archive = tar::Archive::new(Cursor::new(bytes));
        let entries = archive
            .entries()
            .map_err(|e| ExecutionError::InvalidEngine(e.to_string()))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| ExecutionError::InvalidEngine(e.to_string()))?;
            let name = entry
                .path()
                .map_err(|e| ExecutionError::InvalidEngine(e.to_string()))?
                .to_string_lossy()
                .into_owned();
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| ExecutionError::InvalidEngine(e.to_string()))?;
            match name.as_str() {
                MANIFEST_ENTRY => manifest = Some(data),
                MODEL_ENTRY => model = Some(data),
                _ => tracing::debug!("Ignoring engine entry {}", name),
            }
        }

        let manifest = manifest.ok_or_else(|| ExecutionError::InvalidEngine(format!("missing {MANIFEST_ENTRY}")))?;
        let model = model.ok_or_else(|| ExecutionError::InvalidEngine(format!("missing {MODEL_ENTRY}")))?;
        let manifest: EngineManifest = serde_json::from_slice(&manifest)
            .map_err(|e| ExecutionError::InvalidEngine(format!("manifest: {e}")))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(ExecutionError::InvalidEngine(format!(
                "format version {} is not supported (expected {})",
                manifest.format_version, FORMAT_VERSION
            )));
        }
        Ok(Self { manifest, model })
    }

    /// Write to `path` through a temporary file in the same directory, so a
    /// failure never leaves a partial engine at `path`.
    pub fn write_atomic(&self, path: &Path) -> Result<(), BuildError> {
        let bytes = self.to_bytes()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| BuildError::io(&dir, e))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| BuildError::io(&dir, e))?;
        tmp.write_all(&bytes).map_err(|e| BuildError::io(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| BuildError::io(tmp.path(), e))?;
        tmp.persist(path).map_err(|e| BuildError::io(path, e.error))?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, ExecutionError> {
        let bytes = std::fs::read(path).map_err(|e| ExecutionError::EngineUnreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_bytes(&bytes)
    }

    /// Read an engine and refuse it unless it was built for `host`.
    pub fn open(path: &Path, host: &BuildIdentity) -> Result<Self, ExecutionError> {
        let engine = Self::read(path)?;
        engine
            .manifest
            .identity
            .check_compatible(host)
            .map_err(|reason| {
                tracing::error!("Engine {} rejected: {}", path.display(), reason);
                ExecutionError::IdentityMismatch {
                    built: engine.manifest.identity.to_string(),
                    runtime: host.to_string(),
                }
            })?;
        Ok(engine)
    }

    /// Deserialize the compiled graph.
    pub fn typed_model(&self) -> Result<TypedModel, ExecutionError> {
        nnef()
            .model_for_read(&mut self.model.as_slice())
            .map_err(|e| ExecutionError::InvalidEngine(format!("graph: {e:#}")))
    }

    pub fn model_bytes(&self) -> usize {
        self.model.len()
    }
}
