//! Thin wrapper over a runnable tract plan

use std::fmt;

use tract_onnx::prelude::tract_ndarray::{Array4, Ix4};
use tract_onnx::prelude::*;

type RunFn = dyn Fn(TVec<TValue>) -> TractResult<TVec<TValue>> + Send + Sync;

/// An optimized, ready-to-run computation graph.
///
/// Holds the plan behind a closure so callers only see tensors in and out.
pub struct Plan {
    run: Box<RunFn>,
    input_shapes: Vec<Vec<usize>>,
    input_type: DatumType,
    output_count: usize,
}

impl Plan {
    /// Optimize a typed model and turn it into a runnable plan.
    pub fn from_typed(model: TypedModel) -> TractResult<Self> {
        let input_shapes = model
            .inputs
            .iter()
            .map(|outlet| {
                let fact = model.outlet_fact(*outlet)?;
                Ok(fact
                    .shape
                    .as_concrete()
                    .map(|dims| dims.to_vec())
                    .unwrap_or_default())
            })
            .collect::<TractResult<Vec<_>>>()?;
        let input_type = match model.inputs.first() {
            Some(outlet) => model.outlet_fact(*outlet)?.datum_type,
            None => f32::datum_type(),
        };
        let output_count = model.outputs.len();
        let plan = model.into_optimized()?.into_runnable()?;
        Ok(Self {
            run: Box::new(move |inputs| plan.run(inputs)),
            input_shapes,
            input_type,
            output_count,
        })
    }

    /// Run with a single input tensor, cast to the plan's input type.
    pub fn run(&self, input: Tensor) -> TractResult<TVec<TValue>> {
        let input = if input.datum_type() == self.input_type {
            input
        } else {
            input.cast_to_dt(self.input_type)?.into_owned()
        };
        (self.run)(tvec!(input.into()))
    }

    pub fn input_type(&self) -> DatumType {
        self.input_type
    }

    /// Concrete shape of input `ix`, empty when symbolic.
    pub fn input_shape(&self, ix: usize) -> &[usize] {
        self.input_shapes.get(ix).map(|s| s.as_slice()).unwrap_or(&[])
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan")
            .field("input_shapes", &self.input_shapes)
            .field("input_type", &self.input_type)
            .field("output_count", &self.output_count)
            .finish()
    }
}

/// Flatten output `ix` into a vector of f32, whatever float type it holds.
pub fn output_f32(outputs: &[TValue], ix: usize) -> TractResult<Vec<f32>> {
    let value = outputs
        .get(ix)
        .ok_or_else(|| anyhow::anyhow!("missing output {ix}"))?;
    let value = value.cast_to::<f32>()?;
    let view = value.to_array_view::<f32>()?;
    Ok(view.iter().copied().collect())
}

/// Output `ix` as an f32 NCHW array.
pub fn output_array4(outputs: &[TValue], ix: usize) -> TractResult<Array4<f32>> {
    let value = outputs
        .get(ix)
        .ok_or_else(|| anyhow::anyhow!("missing output {ix}"))?;
    let value = value.cast_to::<f32>()?;
    let array = value.to_array_view::<f32>()?.into_dimensionality::<Ix4>()?;
    Ok(array.to_owned())
}
