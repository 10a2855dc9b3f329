//! Engine builder
//!
//! Turns a portable graph into a serialized engine through four states:
//! `LoadedGraph -> ValidatedGraph -> BuiltEngine -> serialized file`.
//! Each transition consumes the previous state, so a graph cannot be built
//! before it was validated nor written before it was built.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tract_core::floats::FloatPrecisionTranslator;
use tract_core::model::translator::Translate;
use tract_onnx::prelude::tract_ndarray::Array4;
use tract_onnx::prelude::*;

use super::calibration::{self, quantize_input, CalibrationRanges, ImageBatcher};
use super::engine_file::{EngineFile, EngineManifest, Verification, FORMAT_VERSION};
use super::graph::GraphArtifact;
use super::identity::BuildIdentity;
use super::precision::Precision;
use crate::config::BuildConfig;
use crate::engine::runtime::{output_f32, Plan};
use crate::error::BuildError;
use crate::utils::math::{deterministic_signal, max_abs_diff};

/// Intermediate activations kept alive per input element, used for the
/// working memory estimate.
const ACTIVATION_FACTOR: u64 = 64;

const VERIFY_SEED: u32 = 0x5eed;

/// Everything a build needs besides the graph itself.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub precision: Precision,
    pub keep_fp32: Vec<String>,
    pub calib_input: Option<PathBuf>,
    pub calib_cache: PathBuf,
    pub calib_num_images: usize,
    pub workspace_limit_mb: u64,
    pub log_path: Option<PathBuf>,
    pub layers_path: Option<PathBuf>,
}

impl BuildOptions {
    pub fn from_config(precision: Precision, config: &BuildConfig) -> Self {
        Self {
            precision,
            keep_fp32: config.keep_fp32_layers.clone(),
            calib_input: None,
            calib_cache: config.calib_cache.clone(),
            calib_num_images: config.calib_num_images,
            workspace_limit_mb: config.workspace_limit_mb,
            log_path: None,
            layers_path: None,
        }
    }
}

/// `model.onnx` -> `model.log`
pub fn default_log_path(graph: &Path) -> PathBuf {
    graph.with_extension("log")
}

/// `model.onnx` -> `model.layers`
pub fn default_layers_path(graph: &Path) -> PathBuf {
    graph.with_extension("layers")
}

/// Build messages go to tracing and, when configured, to a log file.
#[derive(Debug)]
pub struct BuildLog {
    file: Option<File>,
}

impl BuildLog {
    pub fn open(path: Option<&Path>) -> Result<Self, BuildError> {
        let file = match path {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| BuildError::io(path, e))?,
            ),
            None => None,
        };
        Ok(Self { file })
    }

    pub fn info(&mut self, msg: &str) {
        tracing::info!("{}", msg);
        self.append(msg);
    }

    pub fn warn(&mut self, msg: &str) {
        tracing::warn!("{}", msg);
        self.append(msg);
    }

    fn append(&mut self, msg: &str) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{msg}") {
                tracing::warn!("Build log write failed, disabling it: {}", e);
                self.file = None;
            }
        }
    }
}

/// Entry point of the build state machine.
#[derive(Debug)]
pub struct EngineBuilder {
    options: BuildOptions,
    host: BuildIdentity,
    log: BuildLog,
}

impl EngineBuilder {
    /// Check options and detect the host.
    ///
    /// int8 without calibration images or cache fails here, before any graph
    /// is read.
    pub fn new(options: BuildOptions) -> Result<Self, BuildError> {
        if options.precision.requires_calibration()
            && options.calib_input.is_none()
            && !options.calib_cache.exists()
        {
            return Err(BuildError::MissingCalibrationData);
        }

        let mut log = BuildLog::open(options.log_path.as_deref())?;
        let host = BuildIdentity::detect();
        log.info(&format!("Host: {host}"));
        Ok(Self { options, host, log })
    }

    pub fn host(&self) -> &BuildIdentity {
        &self.host
    }

    pub fn load(self, path: &Path) -> Result<LoadedGraph, BuildError> {
        let artifact = GraphArtifact::load(path)?;
        Ok(self.with_graph(artifact))
    }

    pub fn with_graph(mut self, artifact: GraphArtifact) -> LoadedGraph {
        let source = artifact
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<memory>".to_string());
        self.log.info(&format!(
            "Loaded graph {} ({} nodes, {} operator types)",
            source,
            artifact.nodes().len(),
            artifact.op_types().len()
        ));
        LoadedGraph {
            builder: self,
            artifact,
        }
    }
}

/// Graph read from disk, nothing checked yet.
#[derive(Debug)]
pub struct LoadedGraph {
    builder: EngineBuilder,
    artifact: GraphArtifact,
}

impl LoadedGraph {
    /// Reject graphs the runtime cannot build, before any build time is spent.
    pub fn validate(mut self) -> Result<ValidatedGraph, BuildError> {
        let unsupported = self.artifact.unsupported_operators();
        if !unsupported.is_empty() {
            for op in &unsupported {
                let nodes: Vec<&str> = self
                    .artifact
                    .nodes()
                    .iter()
                    .filter(|n| &n.op_type == op)
                    .map(|n| n.name.as_str())
                    .collect();
                self.builder
                    .log
                    .warn(&format!("Unsupported operator {} in nodes {}", op, nodes.join(", ")));
            }
            return Err(BuildError::UnsupportedOperators(unsupported));
        }

        let input_shape = self.artifact.input_shape().ok_or_else(|| {
            BuildError::InvalidGraph("input shape is not static, export with a fixed batch and size".to_string())
        })?;
        if input_shape.len() != 4 || input_shape[1] != 3 || input_shape[2] != input_shape[3] {
            return Err(BuildError::InvalidGraph(format!(
                "expected a [batch, 3, size, size] input, got {input_shape:?}"
            )));
        }
        let output_shape = self.artifact.output_shape().unwrap_or_else(|| input_shape.clone());
        if output_shape != input_shape {
            return Err(BuildError::InvalidGraph(format!(
                "output shape {output_shape:?} differs from input shape {input_shape:?}"
            )));
        }
        self.builder
            .log
            .info(&format!("Input with shape {input_shape:?}, output with shape {output_shape:?}"));

        let precision = self.builder.options.precision;
        let weights = self.artifact.weight_bytes() * precision.weight_bytes() / 4;
        let activations = input_shape.iter().product::<usize>() as u64 * 4 * ACTIVATION_FACTOR;
        let required_mb = (weights + activations).div_ceil(1024 * 1024);
        let limit_mb = self.builder.options.workspace_limit_mb;
        if required_mb > limit_mb {
            return Err(BuildError::InsufficientMemory { required_mb, limit_mb });
        }
        self.builder
            .log
            .info(&format!("Estimated workspace {required_mb} MiB of {limit_mb} MiB"));

        if let Some(path) = self.builder.options.layers_path.clone() {
            std::fs::write(&path, self.artifact.layer_listing()).map_err(|e| BuildError::io(&path, e))?;
            self.builder.log.info(&format!("Layer listing written to {}", path.display()));
        }

        Ok(ValidatedGraph {
            builder: self.builder,
            artifact: self.artifact,
            input_shape,
        })
    }
}

/// Graph known to be buildable on this host.
#[derive(Debug)]
pub struct ValidatedGraph {
    builder: EngineBuilder,
    artifact: GraphArtifact,
    input_shape: Vec<usize>,
}

impl ValidatedGraph {
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    /// Compile for the requested precision and verify against the
    /// full-precision network.
    pub fn build(mut self) -> Result<BuiltEngine, BuildError> {
        let start = Instant::now();
        let precision = self.builder.options.precision;
        self.builder.log.info(&format!("Building {precision} engine"));

        let reference = self.artifact.to_typed()?;
        let compile = |e: anyhow::Error| BuildError::Compile(format!("{e:#}"));

        let mut calibration = None;
        let engine_model = match precision {
            Precision::Fp32 => reference.clone(),
            Precision::Fp16 => {
                if !self.builder.host.has_native_f16() {
                    self.builder
                        .log
                        .warn("FP16 is not supported natively on this host, kernels will convert");
                }
                for node in reference.nodes() {
                    if self.keeps_fp32(&node.name) {
                        self.builder
                            .log
                            .info(&format!("Mixed-precision layer {} kept in f32", node.name));
                    }
                }
                let keep = self.builder.options.keep_fp32.clone();
                let translator = FloatPrecisionTranslator::<f32, f16>::with_filter(move |node| {
                    !keep.iter().any(|k| node.name.contains(k.as_str()))
                });
                translator.translate_model(&reference).map_err(compile)?
            }
            Precision::Int8 => {
                let ranges = self.calibrate(&reference)?;
                calibration = Some(ranges);
                let mut quantized = self.artifact.clone();
                quantized.quantize_weights_int8();
                quantized.to_typed()?
            }
        };

        let manifest = EngineManifest {
            format_version: FORMAT_VERSION,
            identity: self.builder.host.clone(),
            precision,
            input_shape: self.input_shape.clone(),
            output_shape: self.input_shape.clone(),
            calibration,
            keep_fp32: match precision {
                Precision::Fp16 => self.builder.options.keep_fp32.clone(),
                _ => Vec::new(),
            },
            verification: None,
        };
        let mut engine = EngineFile::new(manifest, &engine_model)?;
        self.builder.log.info(&format!(
            "Compiled engine graph ({} bytes) in {:?}",
            engine.model_bytes(),
            start.elapsed()
        ));

        let verification = self.verify(reference, &engine)?;
        let msg = format!(
            "Verification: max abs error {:.3e} (tolerance {:.1e})",
            verification.max_abs_error, verification.tolerance
        );
        if verification.within_tolerance {
            self.builder.log.info(&msg);
        } else {
            self.builder.log.warn(&format!("{msg} exceeds tolerance"));
        }
        engine.manifest.verification = Some(verification);

        Ok(BuiltEngine {
            builder: self.builder,
            engine,
        })
    }

    fn keeps_fp32(&self, name: &str) -> bool {
        self.builder
            .options
            .keep_fp32
            .iter()
            .any(|k| name.contains(k.as_str()))
    }

    fn calibrate(&mut self, reference: &TypedModel) -> Result<CalibrationRanges, BuildError> {
        let cache = self.builder.options.calib_cache.clone();
        if let Some(ranges) = calibration::read_cache(&cache)? {
            self.builder.log.info(&format!("Using calibration cache file: {}", cache.display()));
            return Ok(ranges);
        }
        let input = self
            .builder
            .options
            .calib_input
            .clone()
            .ok_or(BuildError::MissingCalibrationData)?;

        let batches = ImageBatcher::new(
            &input,
            self.input_shape[0],
            self.input_shape[3] as u32,
            self.builder.options.calib_num_images,
        )?;
        self.builder.log.info(&format!(
            "Calibrating with {} images from {}",
            batches.num_images(),
            input.display()
        ));
        let plan = Plan::from_typed(reference.clone()).map_err(|e| BuildError::Calibration(format!("{e:#}")))?;
        let ranges = calibration::calibrate(&plan, batches)?;
        calibration::write_cache(&cache, &ranges)?;
        self.builder.log.info(&format!(
            "Calibrated input range {:.3}, output range {:.3}",
            ranges.input_absmax, ranges.output_absmax
        ));
        Ok(ranges)
    }

    /// Reload the engine from its serialized form and compare it with the
    /// full-precision network on a fixed input.
    fn verify(&self, reference: TypedModel, engine: &EngineFile) -> Result<Verification, BuildError> {
        let compile = |e: anyhow::Error| BuildError::Compile(format!("verification: {e:#}"));

        let reloaded = EngineFile::from_bytes(&engine.to_bytes()?)
            .and_then(|e| e.typed_model())
            .map_err(|e| BuildError::Compile(format!("verification reload: {e}")))?;

        let shape = &self.input_shape;
        let len = shape.iter().product();
        let input = Array4::from_shape_vec(
            (shape[0], shape[1], shape[2], shape[3]),
            deterministic_signal(len, VERIFY_SEED),
        )
        .map_err(|e| BuildError::Compile(e.to_string()))?;

        let expected = Plan::from_typed(reference)
            .and_then(|plan| plan.run(Tensor::from(input.clone())))
            .and_then(|out| output_f32(&out, 0))
            .map_err(compile)?;

        let mut engine_input = input;
        if let (Some(ranges), Some(values)) = (engine.manifest.calibration, engine_input.as_slice_mut()) {
            quantize_input(values, &ranges);
        }
        let actual = Plan::from_typed(reloaded)
            .and_then(|plan| plan.run(Tensor::from(engine_input)))
            .and_then(|out| output_f32(&out, 0))
            .map_err(compile)?;

        let max_abs_error = max_abs_diff(&expected, &actual);
        let tolerance = engine.manifest.precision.tolerance();
        Ok(Verification {
            max_abs_error,
            tolerance,
            within_tolerance: max_abs_error <= tolerance,
        })
    }
}

/// Compiled and verified engine, not yet on disk.
#[derive(Debug)]
pub struct BuiltEngine {
    builder: EngineBuilder,
    engine: EngineFile,
}

impl BuiltEngine {
    pub fn manifest(&self) -> &EngineManifest {
        &self.engine.manifest
    }

    /// Atomically write the engine to `path`.
    pub fn serialize(mut self, path: &Path) -> Result<EngineManifest, BuildError> {
        self.builder
            .log
            .info(&format!("Serializing engine to file: {}", path.display()));
        self.engine.write_atomic(path)?;
        Ok(self.engine.manifest)
    }
}

/// Run the whole state machine for a graph file.
pub fn build_engine(graph: &Path, engine: &Path, options: BuildOptions) -> Result<EngineManifest, BuildError> {
    EngineBuilder::new(options)?
        .load(graph)?
        .validate()?
        .build()?
        .serialize(engine)
}
