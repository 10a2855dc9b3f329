//! Service layer module

pub mod pipeline;
pub mod runner;
pub mod types;

pub use pipeline::{PipelineOptions, RestorePipeline, Restoration};
pub use runner::{run, OutputExt, RunOptions};
pub use types::*;
