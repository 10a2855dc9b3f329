//! Online inference engine
//!
//! Provides tract-based inference with:
//! - Face location and canonical-pose alignment
//! - Batched restoration on a fixed-capacity device arena
//! - Background upsampling and inverse-warp compositing

pub mod align;
pub mod compositor;
pub mod context;
pub mod detector;
pub mod executor;
pub mod preprocess;
pub mod restorer;
pub mod runtime;
pub mod upsampler;

pub use align::{AlignedFace, Aligner, SimilarityTransform};
pub use compositor::{BlendMask, Compositor};
pub use context::DeviceContext;
pub use detector::{Detection, FaceLocator, ScrfdDetector};
pub use executor::{RestorationExecutor, RestoredFace};
pub use restorer::{EngineRestorer, NetworkRestorer, Restorer};
pub use upsampler::{BackgroundUpsampler, ModelUpsampler, ResizeUpsampler};
