//! Restoration backends
//!
//! The restoration network is an opaque `[N, 3, S, S] -> [N, 3, S, S]`
//! operator in [-1, 1]. It runs either straight from the ONNX network or from
//! a compiled engine file.

use std::path::Path;
use std::time::Instant;

use tract_onnx::prelude::tract_ndarray::{Array4, ArrayView4};
use tract_onnx::prelude::*;

use crate::convert::calibration::{quantize_input, CalibrationRanges};
use crate::convert::engine_file::EngineFile;
use crate::convert::identity::BuildIdentity;
use crate::error::ExecutionError;

use super::runtime::{output_array4, Plan};

/// Batched restoration capability.
pub trait Restorer: Send + Sync {
    /// Number of faces per execution.
    fn batch_capacity(&self) -> usize;

    /// Side of the square face crops.
    fn canonical_size(&self) -> usize;

    /// Run one full batch of exactly `batch_capacity` crops.
    fn infer(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>, ExecutionError>;

    fn describe(&self) -> String;

    fn expected_shape(&self) -> [usize; 4] {
        let size = self.canonical_size();
        [self.batch_capacity(), 3, size, size]
    }
}

/// Restoration from the ONNX network, in full precision.
#[derive(Debug)]
pub struct NetworkRestorer {
    plan: Plan,
    capacity: usize,
    size: usize,
    label: String,
}

impl NetworkRestorer {
    /// Load an ONNX network with its input fixed to `[capacity, 3, size, size]`.
    pub fn load(path: &Path, capacity: usize, size: usize) -> Result<Self, ExecutionError> {
        if capacity == 0 || size == 0 {
            return Err(ExecutionError::NetworkLoad {
                path: path.to_path_buf(),
                reason: format!("batch capacity and size must be positive, got {capacity} and {size}"),
            });
        }
        let start = Instant::now();
        let load_err = |e: anyhow::Error| ExecutionError::NetworkLoad {
            path: path.to_path_buf(),
            reason: format!("{e:#}"),
        };
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|m| m.with_input_fact(0, f32::fact([capacity, 3, size, size]).into()))
            .and_then(|m| m.into_typed())
            .and_then(|m| m.into_decluttered())
            .map_err(load_err)?;
        let plan = Plan::from_typed(model).map_err(load_err)?;
        tracing::info!(
            "Restoration network {} loaded in {:?} (batch {}, size {})",
            path.display(),
            start.elapsed(),
            capacity,
            size
        );
        Ok(Self {
            plan,
            capacity,
            size,
            label: format!("network {}", path.display()),
        })
    }
}

impl Restorer for NetworkRestorer {
    fn batch_capacity(&self) -> usize {
        self.capacity
    }

    fn canonical_size(&self) -> usize {
        self.size
    }

    fn infer(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>, ExecutionError> {
        run_checked(&self.plan, self.expected_shape(), batch.to_owned())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Restoration from a compiled engine file.
#[derive(Debug)]
pub struct EngineRestorer {
    plan: Plan,
    capacity: usize,
    size: usize,
    calibration: Option<CalibrationRanges>,
    label: String,
}

impl EngineRestorer {
    /// Load an engine, refusing it when it was built for another runtime or
    /// host. Nothing is executed before these checks pass.
    pub fn load(path: &Path) -> Result<Self, ExecutionError> {
        let start = Instant::now();
        let engine = EngineFile::open(path, &BuildIdentity::detect())?;
        let manifest = &engine.manifest;
        let capacity = manifest.batch_capacity();
        let size = manifest.canonical_size();
        if capacity == 0 || manifest.input_shape != [capacity, 3, size, size] {
            return Err(ExecutionError::InvalidEngine(format!(
                "unexpected input shape {:?}",
                manifest.input_shape
            )));
        }
        if manifest.output_shape != manifest.input_shape {
            return Err(ExecutionError::ShapeMismatch {
                expected: manifest.input_shape.clone(),
                actual: manifest.output_shape.clone(),
            });
        }

        let model = engine.typed_model()?;
        let plan = Plan::from_typed(model).map_err(|e| ExecutionError::InvalidEngine(format!("{e:#}")))?;
        tracing::info!(
            "Engine {} loaded in {:?} ({}, batch {}, size {})",
            path.display(),
            start.elapsed(),
            manifest.precision,
            capacity,
            size
        );
        Ok(Self {
            plan,
            capacity,
            size,
            calibration: manifest.calibration,
            label: format!("{} engine {}", manifest.precision, path.display()),
        })
    }
}

impl Restorer for EngineRestorer {
    fn batch_capacity(&self) -> usize {
        self.capacity
    }

    fn canonical_size(&self) -> usize {
        self.size
    }

    fn infer(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>, ExecutionError> {
        let mut input = batch.to_owned();
        if let (Some(ranges), Some(values)) = (self.calibration.as_ref(), input.as_slice_mut()) {
            quantize_input(values, ranges);
        }
        run_checked(&self.plan, self.expected_shape(), input)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Run `plan` on `input`, checking both sides against `expected`.
fn run_checked(plan: &Plan, expected: [usize; 4], input: Array4<f32>) -> Result<Array4<f32>, ExecutionError> {
    if input.shape() != expected {
        return Err(ExecutionError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: input.shape().to_vec(),
        });
    }
    let outputs = plan
        .run(Tensor::from(input))
        .map_err(|e| ExecutionError::Runtime(format!("{e:#}")))?;
    let output = output_array4(&outputs, 0).map_err(|e| ExecutionError::Runtime(format!("{e:#}")))?;
    if output.shape() != expected {
        return Err(ExecutionError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: output.shape().to_vec(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::convert::builder::{build_engine, BuildOptions};
    use crate::convert::graph::{test_graphs, GraphArtifact};
    use crate::convert::precision::Precision;
    use approx::assert_abs_diff_eq;

    fn write_affine(dir: &Path, batch: usize, size: usize) -> std::path::PathBuf {
        let path = dir.join("affine.onnx");
        GraphArtifact::from_proto(test_graphs::affine(batch, size))
            .write(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_network_restorer_runs() {
        let dir = tempfile::tempdir().unwrap();
        let restorer = NetworkRestorer::load(&write_affine(dir.path(), 2, 8), 2, 8).unwrap();
        assert_eq!(restorer.expected_shape(), [2, 3, 8, 8]);

        let input = Array4::<f32>::from_elem((2, 3, 8, 8), 0.4);
        let output = restorer.infer(input.view()).unwrap();
        assert_abs_diff_eq!(output[[1, 2, 7, 7]], 0.3, epsilon = 1e-6);
    }

    #[test]
    fn test_network_restorer_rejects_wrong_batch() {
        let dir = tempfile::tempdir().unwrap();
        let restorer = NetworkRestorer::load(&write_affine(dir.path(), 2, 8), 2, 8).unwrap();
        let input = Array4::<f32>::zeros((1, 3, 8, 8));
        let err = restorer.infer(input.view()).unwrap_err();
        assert!(matches!(err, ExecutionError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_missing_network_is_load_error() {
        let err = NetworkRestorer::load(Path::new("/no/such/net.onnx"), 1, 8).unwrap_err();
        assert!(matches!(err, ExecutionError::NetworkLoad { .. }));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_affine(dir.path(), 1, 8);
        let err = NetworkRestorer::load(&path, 0, 8).unwrap_err();
        match err {
            ExecutionError::NetworkLoad { reason, .. } => assert!(reason.contains("capacity")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_missing_engine_fails_before_inference() {
        let err = EngineRestorer::load(Path::new("/no/such/net.engine")).unwrap_err();
        assert!(matches!(err, ExecutionError::EngineUnreadable { .. }));
    }

    #[test]
    fn test_engine_matches_network() {
        let dir = tempfile::tempdir().unwrap();
        let graph = write_affine(dir.path(), 2, 8);
        let engine_path = dir.path().join("affine.engine");
        for precision in [Precision::Fp32, Precision::Fp16] {
            let options = BuildOptions::from_config(precision, &BuildConfig::default());
            build_engine(&graph, &engine_path, options).unwrap();

            let network = NetworkRestorer::load(&graph, 2, 8).unwrap();
            let engine = EngineRestorer::load(&engine_path).unwrap();
            assert_eq!(engine.batch_capacity(), 2);
            assert_eq!(engine.canonical_size(), 8);

            let input = Array4::from_shape_fn((2, 3, 8, 8), |(n, c, y, x)| {
                ((n * 7 + c * 5 + y * 3 + x) % 17) as f32 / 8.5 - 1.0
            });
            let expected = network.infer(input.view()).unwrap();
            let actual = engine.infer(input.view()).unwrap();
            for (a, b) in expected.iter().zip(actual.iter()) {
                assert!((a - b).abs() <= precision.tolerance(), "{precision}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_int8_engine_calibrated_from_images() {
        let dir = tempfile::tempdir().unwrap();
        let graph = write_affine(dir.path(), 2, 8);
        let images = dir.path().join("calib");
        std::fs::create_dir_all(&images).unwrap();
        for i in 0..4u32 {
            let image = image::RgbImage::from_fn(8, 8, |x, y| {
                image::Rgb([(x * 30 + i * 10) as u8, (y * 30) as u8, (255 - i * 60) as u8])
            });
            image.save(images.join(format!("calib_{i}.png"))).unwrap();
        }

        let cache = dir.path().join("int8.cache");
        let mut options = BuildOptions::from_config(Precision::Int8, &BuildConfig::default());
        options.calib_input = Some(images);
        options.calib_cache = cache.clone();
        options.calib_num_images = 4;
        let engine_path = dir.path().join("affine.engine");
        let manifest = build_engine(&graph, &engine_path, options).unwrap();

        assert!(cache.is_file(), "calibration cache not written");
        let ranges = manifest.calibration.unwrap();
        assert_eq!(ranges.num_images, 4);
        assert!(ranges.input_absmax > 0.5 && ranges.input_absmax <= 1.0 + 1e-6);

        let network = NetworkRestorer::load(&graph, 2, 8).unwrap();
        let engine = EngineRestorer::load(&engine_path).unwrap();
        let input = Array4::from_shape_fn((2, 3, 8, 8), |(n, c, y, x)| {
            ((n * 5 + c * 3 + y * 7 + x) % 13) as f32 / 6.5 - 1.0
        });
        let expected = network.infer(input.view()).unwrap();
        let actual = engine.infer(input.view()).unwrap();
        let tolerance = Precision::Int8.tolerance();
        for (a, b) in expected.iter().zip(actual.iter()) {
            assert!((a - b).abs() <= tolerance, "int8: {a} vs {b}");
        }
    }
}
