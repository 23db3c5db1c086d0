//! Layer graphs with recurrent composites.
//!
//! A [`Graph`] owns named layers wired output to input. Running it sorts the
//! layers, lets every layer infer its output shapes and then calls them in
//! order; the backward pass walks the same order in reverse and only visits
//! layers whose gradients matter. Cycles are expressed with feedback edges
//! that end at a [`BackLink`](layers::BackLink) and deliver the value of the
//! previous step, which is how [`Recurrent`](layers::Recurrent) and
//! [`Lstm`](layers::Lstm) unroll over a sequence.
//!
//! Graphs are persisted as versioned JSON records, see [`archive`].
pub mod archive;
mod graph;
pub mod init;
mod layer;
pub mod layers;
mod registry;
mod solver;

#[cfg(test)]
mod utils;

pub use archive::{ARCHIVE_MIN_SUPPORTED_VERSION, ARCHIVE_VERSION};
pub use graph::{Graph, Link};
pub use layer::{BackwardContext, BlobsForBackward, Layer, LearnContext, Param, RunContext};
pub use registry::{LayerFactory, LayerRegistry};
pub use solver::{SimpleGradientSolver, Solver};
