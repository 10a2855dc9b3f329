//! Offline conversion pipeline
//!
//! ONNX network -> portable graph artifact -> serialized engine.

pub mod builder;
pub mod calibration;
pub mod engine_file;
pub mod graph;
pub mod identity;
pub mod precision;

pub use builder::{build_engine, BuildOptions, EngineBuilder};
pub use engine_file::{EngineFile, EngineManifest};
pub use graph::GraphArtifact;
pub use identity::BuildIdentity;
pub use precision::Precision;

use std::path::Path;

use crate::error::BuildError;

/// Export a network as a graph artifact with a pinned `[batch, 3, size, size]`
/// input and output, optionally removing float64 first.
pub fn export_graph(
    source: &Path,
    output: &Path,
    batch: usize,
    size: usize,
    cast_fp32: bool,
) -> Result<GraphArtifact, BuildError> {
    let mut graph = GraphArtifact::load(source)?;
    if cast_fp32 {
        let changes = graph.sanitize_to_f32();
        tracing::info!("Cast {} tensor(s) to fp32", changes.len());
    }
    graph.pin_io_shape(&[batch, 3, size, size])?;

    // Make sure the runtime accepts what is about to be written
    graph.to_typed()?;
    graph.write(output)?;
    tracing::info!("Exported graph to {}", output.display());
    Ok(graph)
}
