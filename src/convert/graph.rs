//! Portable graph artifact (ONNX)
//!
//! Holds the protobuf model between export and engine build. Graph surgery
//! (shape pinning, float64 removal, weight quantization) works on the
//! protobuf directly; `to_typed` hands the result to the runtime.

use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use prost::Message;
use tempfile::NamedTempFile;
use tract_onnx::pb::tensor_shape_proto::dimension::Value as DimValue;
use tract_onnx::pb::tensor_shape_proto::Dimension;
use tract_onnx::pb::type_proto::Value as TypeValue;
use tract_onnx::pb::{GraphProto, ModelProto, NodeProto, TensorProto, TensorShapeProto, ValueInfoProto};
use tract_onnx::prelude::*;

use crate::error::BuildError;
use crate::utils::math::{abs_max, fake_quantize_i8, int8_scale};

/// ONNX `TensorProto.DataType` codes used here.
pub mod dtype {
    pub const FLOAT: i32 = 1;
    pub const FLOAT16: i32 = 10;
    pub const DOUBLE: i32 = 11;
}

/// Portable computation graph: operators, weights and static I/O shapes.
#[derive(Debug, Clone)]
pub struct GraphArtifact {
    proto: ModelProto,
    path: Option<PathBuf>,
}

impl GraphArtifact {
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let load_err = |reason: String| BuildError::GraphLoad {
            path: path.to_path_buf(),
            reason,
        };
        let data = std::fs::read(path).map_err(|e| load_err(e.to_string()))?;
        let proto = ModelProto::decode(data.as_slice()).map_err(|e| load_err(e.to_string()))?;
        if proto.graph.is_none() {
            return Err(load_err("model has no graph".to_string()));
        }
        Ok(Self {
            proto,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn from_proto(proto: ModelProto) -> Self {
        Self { proto, path: None }
    }

    pub fn proto(&self) -> &ModelProto {
        &self.proto
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.proto.encode_to_vec()
    }

    /// Write the artifact via a temporary file in the target directory.
    pub fn write(&self, path: &Path) -> Result<(), BuildError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| BuildError::io(&dir, e))?;
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| BuildError::io(&dir, e))?;
        tmp.write_all(&self.to_bytes())
            .map_err(|e| BuildError::io(tmp.path(), e))?;
        tmp.persist(path).map_err(|e| BuildError::io(path, e.error))?;
        Ok(())
    }

    fn graph(&self) -> Option<&GraphProto> {
        self.proto.graph.as_ref()
    }

    pub fn nodes(&self) -> &[NodeProto] {
        self.graph().map(|g| g.node.as_slice()).unwrap_or(&[])
    }

    /// Distinct operator types, sorted.
    pub fn op_types(&self) -> BTreeSet<String> {
        self.nodes().iter().map(|n| n.op_type.clone()).collect()
    }

    /// Operator types the runtime has no implementation for.
    pub fn unsupported_operators(&self) -> Vec<String> {
        let onnx = tract_onnx::onnx();
        self.op_types()
            .into_iter()
            .filter(|op| !onnx.op_register.0.contains_key(op))
            .collect()
    }

    /// One `op_type<TAB>name` line per node.
    pub fn layer_listing(&self) -> String {
        let mut listing = String::new();
        for node in self.nodes() {
            listing.push_str(&node.op_type);
            listing.push('\t');
            listing.push_str(&node.name);
            listing.push('\n');
        }
        listing
    }

    /// Graph inputs that are not initializers.
    fn runtime_inputs(&self) -> Vec<&ValueInfoProto> {
        let Some(graph) = self.graph() else {
            return Vec::new();
        };
        let initializers: HashSet<&str> = graph.initializer.iter().map(|t| t.name.as_str()).collect();
        graph
            .input
            .iter()
            .filter(|i| !initializers.contains(i.name.as_str()))
            .collect()
    }

    /// Static shape of the first runtime input, if every dimension is fixed.
    pub fn input_shape(&self) -> Option<Vec<usize>> {
        self.runtime_inputs().first().and_then(|info| static_shape(info))
    }

    /// Static shape of the first output, if known.
    pub fn output_shape(&self) -> Option<Vec<usize>> {
        self.graph()
            .and_then(|g| g.output.first())
            .and_then(static_shape)
    }

    /// Pin the first input and first output to a static shape.
    pub fn pin_io_shape(&mut self, shape: &[usize]) -> Result<(), BuildError> {
        let input_name = self
            .runtime_inputs()
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| BuildError::InvalidGraph("graph has no input".to_string()))?;
        let graph = self
            .proto
            .graph
            .as_mut()
            .ok_or_else(|| BuildError::InvalidGraph("model has no graph".to_string()))?;

        let input = graph
            .input
            .iter_mut()
            .find(|i| i.name == input_name)
            .ok_or_else(|| BuildError::InvalidGraph("graph has no input".to_string()))?;
        set_float_tensor_type(input, shape);

        let output = graph
            .output
            .first_mut()
            .ok_or_else(|| BuildError::InvalidGraph("graph has no output".to_string()))?;
        set_float_tensor_type(output, shape);

        tracing::info!("Pinned input {} and output {} to {:?}", input_name, output.name, shape);
        Ok(())
    }

    /// Remove float64 (and float16 weights) from the graph, returning one
    /// line per change.
    pub fn sanitize_to_f32(&mut self) -> Vec<String> {
        let mut changes = Vec::new();
        let Some(graph) = self.proto.graph.as_mut() else {
            return changes;
        };

        for output in graph.output.iter_mut() {
            if let Some(TypeValue::TensorType(t)) = output.r#type.as_mut().and_then(|t| t.value.as_mut()) {
                if t.elem_type != dtype::FLOAT {
                    changes.push(format!("output {}: {} -> {}", output.name, t.elem_type, dtype::FLOAT));
                    t.elem_type = dtype::FLOAT;
                }
            }
        }

        for node in graph.node.iter_mut() {
            match node.op_type.as_str() {
                "Cast" => {
                    for attr in node.attribute.iter_mut().filter(|a| a.name == "to") {
                        if attr.i == dtype::DOUBLE as i64 {
                            changes.push(format!("{}:{} {} -> {}", node.name, attr.name, attr.i, dtype::FLOAT));
                            attr.i = dtype::FLOAT as i64;
                        }
                    }
                }
                "Constant" => {
                    for attr in node.attribute.iter_mut() {
                        let Some(t) = attr.t.as_mut() else { continue };
                        if t.data_type == dtype::DOUBLE {
                            let old = t.data_type;
                            if let Some(values) = float_values(t) {
                                set_float_values(t, values);
                                changes.push(format!("{}:{} {} -> {}", node.name, attr.name, old, t.data_type));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        for init in graph.initializer.iter_mut() {
            if init.data_type == dtype::DOUBLE || init.data_type == dtype::FLOAT16 {
                let old = init.data_type;
                if let Some(values) = float_values(init) {
                    set_float_values(init, values);
                    changes.push(format!("{}: {} -> {}", init.name, old, init.data_type));
                }
            }
        }

        for change in &changes {
            tracing::info!("{}", change);
        }
        changes
    }

    /// Symmetric per-tensor int8 quantization of every weight tensor
    /// (rank >= 2 float initializers). Returns the number of tensors touched.
    pub fn quantize_weights_int8(&mut self) -> usize {
        let Some(graph) = self.proto.graph.as_mut() else {
            return 0;
        };
        let mut count = 0;
        for init in graph.initializer.iter_mut().filter(|t| t.dims.len() >= 2) {
            if init.data_type != dtype::FLOAT {
                continue;
            }
            let Some(mut values) = float_values(init) else { continue };
            let scale = int8_scale(abs_max(&values));
            fake_quantize_i8(&mut values, scale);
            set_float_values(init, values);
            count += 1;
        }
        tracing::info!("Quantized {} weight tensors to int8", count);
        count
    }

    /// Bytes held by float weights at 32 bits.
    pub fn weight_bytes(&self) -> u64 {
        self.graph()
            .map(|g| {
                g.initializer
                    .iter()
                    .map(|t| t.dims.iter().product::<i64>().max(0) as u64 * 4)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Parse with the runtime, pin the input fact and declutter.
    ///
    /// Fails when the input shape is not fully static.
    pub fn to_typed(&self) -> Result<TypedModel, BuildError> {
        let shape = self.input_shape().ok_or_else(|| {
            BuildError::InvalidGraph("input shape is not static, export with a fixed batch and size".to_string())
        })?;
        let typed = tract_onnx::onnx()
            .model_for_proto_model(&self.proto)
            .and_then(|m| m.with_input_fact(0, f32::fact(&shape).into()))
            .and_then(|m| m.into_typed())
            .and_then(|m| m.into_decluttered())
            .map_err(|e| BuildError::InvalidGraph(format!("{e:#}")))?;
        Ok(typed)
    }
}

fn static_shape(info: &ValueInfoProto) -> Option<Vec<usize>> {
    let Some(TypeValue::TensorType(t)) = info.r#type.as_ref().and_then(|t| t.value.as_ref()) else {
        return None;
    };
    t.shape
        .as_ref()?
        .dim
        .iter()
        .map(|d| match d.value {
            Some(DimValue::DimValue(v)) if v > 0 => Some(v as usize),
            _ => None,
        })
        .collect()
}

fn set_float_tensor_type(info: &mut ValueInfoProto, shape: &[usize]) {
    let dims = shape
        .iter()
        .map(|&d| Dimension {
            denotation: String::new(),
            value: Some(DimValue::DimValue(d as i64)),
        })
        .collect();
    let tensor_type = tract_onnx::pb::type_proto::Tensor {
        elem_type: dtype::FLOAT,
        shape: Some(TensorShapeProto { dim: dims }),
    };
    info.r#type = Some(tract_onnx::pb::TypeProto {
        denotation: String::new(),
        value: Some(TypeValue::TensorType(tensor_type)),
    });
}

/// Decode a float, double or half tensor's payload as f32.
fn float_values(t: &TensorProto) -> Option<Vec<f32>> {
    match t.data_type {
        dtype::FLOAT if !t.raw_data.is_empty() => Some(
            t.raw_data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        ),
        dtype::FLOAT => Some(t.float_data.clone()),
        dtype::DOUBLE if !t.raw_data.is_empty() => Some(
            t.raw_data
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
                .collect(),
        ),
        dtype::DOUBLE => Some(t.double_data.iter().map(|&v| v as f32).collect()),
        dtype::FLOAT16 if !t.raw_data.is_empty() => Some(
            t.raw_data
                .chunks_exact(2)
                .map(|b| f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
        ),
        _ => None,
    }
}

fn set_float_values(t: &mut TensorProto, values: Vec<f32>) {
    t.data_type = dtype::FLOAT;
    t.raw_data.clear();
    t.double_data.clear();
    t.float_data = values;
}

#[cfg(test)]
pub(crate) mod test_graphs {
    //! Tiny ONNX graphs for exercising the conversion pipeline.

    use super::*;
    use tract_onnx::pb::{AttributeProto, OperatorSetIdProto, TypeProto};

    pub fn value_info(name: &str, elem_type: i32, shape: &[usize]) -> ValueInfoProto {
        let mut info = ValueInfoProto {
            name: name.to_string(),
            ..Default::default()
        };
        set_float_tensor_type(&mut info, shape);
        if let Some(TypeProto {
            value: Some(TypeValue::TensorType(t)),
            ..
        }) = info.r#type.as_mut()
        {
            t.elem_type = elem_type;
        }
        info
    }

    pub fn scalar(name: &str, v: f32) -> TensorProto {
        TensorProto {
            name: name.to_string(),
            data_type: dtype::FLOAT,
            float_data: vec![v],
            ..Default::default()
        }
    }

    pub fn node(op_type: &str, name: &str, inputs: &[&str], outputs: &[&str]) -> NodeProto {
        NodeProto {
            op_type: op_type.to_string(),
            name: name.to_string(),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: outputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn model(graph: GraphProto) -> ModelProto {
        ModelProto {
            ir_version: 7,
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: 13,
            }],
            producer_name: "facerestore-tests".to_string(),
            graph: Some(graph),
            ..Default::default()
        }
    }

    /// `y = x * 0.5 + 0.1` over `[batch, 3, size, size]`.
    pub fn affine(batch: usize, size: usize) -> ModelProto {
        let shape = [batch, 3, size, size];
        model(GraphProto {
            name: "affine".to_string(),
            node: vec![
                node("Mul", "modulated_conv/Mul", &["x", "scale"], &["scaled"]),
                node("Add", "modulated_conv/Add", &["scaled", "bias"], &["y"]),
            ],
            initializer: vec![scalar("scale", 0.5), scalar("bias", 0.1)],
            input: vec![value_info("x", dtype::FLOAT, &shape)],
            output: vec![value_info("y", dtype::FLOAT, &shape)],
            ..Default::default()
        })
    }

    /// Same as [`affine`] with a 1x1 convolution weight so int8 has
    /// something to quantize.
    pub fn conv(batch: usize, size: usize) -> ModelProto {
        let shape = [batch, 3, size, size];
        let mut weight = TensorProto {
            name: "w".to_string(),
            data_type: dtype::FLOAT,
            dims: vec![3, 3, 1, 1],
            ..Default::default()
        };
        weight.float_data = (0..9)
            .map(|i| if i % 4 == 0 { 0.8 } else { 0.05 })
            .collect();
        model(GraphProto {
            name: "conv".to_string(),
            node: vec![node("Conv", "conv", &["x", "w"], &["y"])],
            initializer: vec![weight],
            input: vec![value_info("x", dtype::FLOAT, &shape)],
            output: vec![value_info("y", dtype::FLOAT, &shape)],
            ..Default::default()
        })
    }

    pub fn with_unknown_op() -> ModelProto {
        let shape = [1, 3, 4, 4];
        model(GraphProto {
            name: "unknown".to_string(),
            node: vec![
                node("Relu", "relu", &["x"], &["h"]),
                node("FooBarWarp", "custom/warp", &["h"], &["y"]),
            ],
            input: vec![value_info("x", dtype::FLOAT, &shape)],
            output: vec![value_info("y", dtype::FLOAT, &shape)],
            ..Default::default()
        })
    }

    /// Graph carrying float64 through a Constant, a Cast and an initializer.
    pub fn with_doubles() -> ModelProto {
        let shape = [1, 3, 4, 4];
        let mut cast = node("Cast", "to_double", &["x"], &["xd"]);
        cast.attribute.push(AttributeProto {
            name: "to".to_string(),
            i: dtype::DOUBLE as i64,
            r#type: 2,
            ..Default::default()
        });
        let mut constant = node("Constant", "half", &[], &["c"]);
        constant.attribute.push(AttributeProto {
            name: "value".to_string(),
            t: Some(TensorProto {
                data_type: dtype::DOUBLE,
                double_data: vec![0.5],
                ..Default::default()
            }),
            r#type: 4,
            ..Default::default()
        });
        let offset = TensorProto {
            name: "offset".to_string(),
            data_type: dtype::DOUBLE,
            raw_data: 0.25f64.to_le_bytes().to_vec(),
            ..Default::default()
        };
        model(GraphProto {
            name: "doubles".to_string(),
            node: vec![
                cast,
                constant,
                node("Mul", "mul", &["xd", "c"], &["m"]),
                node("Add", "add", &["m", "offset"], &["y"]),
            ],
            initializer: vec![offset],
            input: vec![value_info("x", dtype::FLOAT, &shape)],
            output: vec![value_info("y", dtype::DOUBLE, &shape)],
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_graphs::*;
    use super::*;

    #[test]
    fn test_shapes_and_listing() {
        let graph = GraphArtifact::from_proto(affine(2, 8));
        assert_eq!(graph.input_shape(), Some(vec![2, 3, 8, 8]));
        assert_eq!(graph.output_shape(), Some(vec![2, 3, 8, 8]));
        assert_eq!(
            graph.layer_listing(),
            "Mul\tmodulated_conv/Mul\nAdd\tmodulated_conv/Add\n"
        );
        assert_eq!(graph.weight_bytes(), 8);
    }

    #[test]
    fn test_unsupported_operators_are_named() {
        let graph = GraphArtifact::from_proto(with_unknown_op());
        assert_eq!(graph.unsupported_operators(), vec!["FooBarWarp".to_string()]);
        assert!(GraphArtifact::from_proto(affine(1, 4)).unsupported_operators().is_empty());
    }

    #[test]
    fn test_sanitize_removes_doubles() {
        let mut graph = GraphArtifact::from_proto(with_doubles());
        let changes = graph.sanitize_to_f32();
        assert_eq!(changes.len(), 4);

        let g = graph.proto().graph.as_ref().unwrap();
        assert_eq!(g.node[0].attribute[0].i, dtype::FLOAT as i64);
        let c = g.node[1].attribute[0].t.as_ref().unwrap();
        assert_eq!(c.data_type, dtype::FLOAT);
        assert_eq!(c.float_data, vec![0.5]);
        assert_eq!(g.initializer[0].data_type, dtype::FLOAT);
        assert_eq!(g.initializer[0].float_data, vec![0.25]);
        assert!(g.initializer[0].raw_data.is_empty());

        // Second pass finds nothing left to change
        assert!(graph.sanitize_to_f32().is_empty());
    }

    #[test]
    fn test_sanitized_graph_runs_in_f32() {
        let mut graph = GraphArtifact::from_proto(with_doubles());
        graph.sanitize_to_f32();
        let typed = graph.to_typed().unwrap();
        let output = typed.outlet_fact(typed.outputs[0]).unwrap();
        assert_eq!(output.datum_type, f32::datum_type());
    }

    #[test]
    fn test_pin_io_shape() {
        let mut graph = GraphArtifact::from_proto(affine(1, 4));
        graph.pin_io_shape(&[4, 3, 16, 16]).unwrap();
        assert_eq!(graph.input_shape(), Some(vec![4, 3, 16, 16]));
        assert_eq!(graph.output_shape(), Some(vec![4, 3, 16, 16]));
    }

    #[test]
    fn test_write_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        let graph = GraphArtifact::from_proto(affine(1, 4));
        graph.write(&path).unwrap();
        let loaded = GraphArtifact::load(&path).unwrap();
        assert_eq!(loaded.proto(), graph.proto());
        assert_eq!(loaded.path(), Some(path.as_path()));
    }

    #[test]
    fn test_load_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.onnx");
        std::fs::write(&path, b"\xff\xff\xff\xff").unwrap();
        assert!(matches!(GraphArtifact::load(&path), Err(BuildError::GraphLoad { .. })));
    }

    #[test]
    fn test_quantize_weights_only_touches_weights() {
        let mut graph = GraphArtifact::from_proto(conv(1, 4));
        assert_eq!(graph.quantize_weights_int8(), 1);
        let w = &graph.proto().graph.as_ref().unwrap().initializer[0];
        let scale = int8_scale(0.8);
        for v in &w.float_data {
            let q = v / scale;
            assert!((q - q.round()).abs() < 1e-3);
        }
        let mut affine = GraphArtifact::from_proto(affine(1, 4));
        assert_eq!(affine.quantize_weights_int8(), 0);
    }
}
