//! Tensor storage, errors and the compute backend shared by the `cortex`
//! crates.
mod blob;
mod engine;
mod error;

pub use blob::{Blob, BlobDesc, BlobDim};
pub use engine::{ActivationKind, CpuMathEngine, MathEngine, PARALLEL_THRESHOLD};
pub use error::{Error, Result};
