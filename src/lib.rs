//! The `cortex` crate builds neural networks as graphs of named layers.
//!
//! # Graphs
//!
//! A [`Graph`] owns its layers and the links between them. Layers are added
//! by name, wired with [`Graph::connect`] and configured through typed
//! access with [`Graph::layer_mut`]. Nothing is computed while the graph is
//! built: the first run sorts the layers, lets each one infer its output
//! shapes and allocates the blobs. Later runs reuse that plan until the
//! structure changes.
//!
//! ```
//! use cortex::prelude::*;
//!
//! let mut graph = Graph::new();
//! let data = cortex::from_vec(BlobDesc::channels_only(2), vec![1., -1.])?;
//! graph.add_layer("data", Source::with_blob(data))?;
//! graph.add_layer("relu", Activation::new(ActivationKind::Relu))?;
//! graph.connect("relu", 0, "data", 0)?;
//! graph.run_once()?;
//!
//! assert_eq!(graph.output("relu", 0)?.to_vec(), vec![1., 0.]);
//! # Ok::<(), cortex::Error>(())
//! ```
//!
//! # Blobs
//!
//! Every tensor is a [`Blob`] of seven axes, see [`BlobDim`]: the sequence
//! axis `BatchLength`, the batch axes `BatchWidth` and `ListSize`, and the
//! object axes `Height`, `Width`, `Depth` and `Channels`.
//!
//! # Training
//!
//! In training mode a forward pass may be followed by a backward pass,
//! which accumulates the parameter gradients of learnable layers. A
//! [`Solver`] turns them into updates:
//!
//! ```
//! use cortex::prelude::*;
//!
//! let mut fc = FullyConnected::new(1)?;
//! fc.set_weights(Some(cortex::from_vec(BlobDesc::channels_only(2), vec![1., 1.])?))?;
//!
//! let mut graph = Graph::new();
//! let x = cortex::from_vec(BlobDesc::channels_only(2), vec![1., 2.])?;
//! graph.add_layer("x", Source::with_blob(x))?;
//! graph.add_layer("fc", fc)?;
//! graph.add_layer("loss", Sink::new())?;
//! graph.connect("fc", 0, "x", 0)?;
//! graph.connect("loss", 0, "fc", 0)?;
//! graph.reshape()?;
//! graph.set_sink_diff("loss", Some(cortex::full(BlobDesc::channels_only(1), 1.)))?;
//!
//! let mut solver = SimpleGradientSolver::new(0.1);
//! graph.run_and_learn_once(&mut solver)?;
//! # Ok::<(), cortex::Error>(())
//! ```
//!
//! # Recurrent layers
//!
//! A [`Recurrent`](layers::Recurrent) layer runs an internal graph once per
//! step of a sequence. Feedback edges, which end at a
//! [`BackLink`](layers::BackLink), carry values from one step to the next.
//! [`Lstm`](layers::Lstm) is built this way.
//!
//! # Persistence
//!
//! [`Graph::save`] writes a versioned JSON archive and [`Graph::load`]
//! reads every version from [`ARCHIVE_MIN_SUPPORTED_VERSION`] on, the
//! layer kinds being resolved through a [`LayerRegistry`].
pub use cortex_core::{
    ActivationKind, Blob, BlobDesc, BlobDim, CpuMathEngine, Error, MathEngine, Result,
};
pub use cortex_dnn::{
    archive, init, layers, BackwardContext, BlobsForBackward, Graph, Layer, LayerFactory,
    LayerRegistry, LearnContext, Link, Param, RunContext, SimpleGradientSolver, Solver,
    ARCHIVE_MIN_SUPPORTED_VERSION, ARCHIVE_VERSION,
};

/// Everything needed to build, run and train a graph.
pub mod prelude {
    pub use crate::layers::*;
    pub use crate::{
        ActivationKind, Blob, BlobDesc, BlobDim, Graph, Layer, LayerRegistry, SimpleGradientSolver,
        Solver,
    };
}

/// Creates a blob filled with zeros.
pub fn zeros(desc: BlobDesc) -> Blob {
    Blob::zeros(desc)
}

/// Creates a blob filled with `value`.
pub fn full(desc: BlobDesc, value: f32) -> Blob {
    Blob::full(desc, value)
}

/// Creates a blob from elements in row-major order, `BatchLength`
/// outermost.
///
/// # Errors
///
/// If `values` does not hold exactly `desc.blob_size()` elements.
pub fn from_vec(desc: BlobDesc, values: Vec<f32>) -> Result<Blob> {
    Blob::from_vec(desc, values)
}

/// Creates a blob from a seven dimensional array.
///
/// # Errors
///
/// If the array does not have seven axes.
pub fn from_ndarray(array: ndarray::ArrayD<f32>) -> Result<Blob> {
    Blob::from_array(array)
}
