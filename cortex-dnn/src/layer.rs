use std::{any::Any, ops::RangeInclusive};

use cortex_core::{Blob, BlobDesc, MathEngine, Result};

/// Which of a layer's per-pass blobs its backward and learn steps read.
///
/// The graph keeps these blobs alive between the forward and the backward
/// pass of every step of a recurrent sequence.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BlobsForBackward {
    pub inputs: bool,
    pub outputs: bool,
}

impl BlobsForBackward {
    pub const NONE: Self = Self {
        inputs: false,
        outputs: false,
    };
    pub const INPUTS: Self = Self {
        inputs: true,
        outputs: false,
    };
    pub const OUTPUTS: Self = Self {
        inputs: false,
        outputs: true,
    };
    pub const BOTH: Self = Self {
        inputs: true,
        outputs: true,
    };
}

/// Buffers a layer sees while running forward.
pub struct RunContext<'a> {
    pub inputs: &'a [&'a Blob],
    /// Preallocated with the descriptors returned by the last reshape.
    pub outputs: &'a mut [Blob],
    /// Per-pass data kept for the backward step. A layer must leave the
    /// same number of scratch blobs after every run with one configuration.
    pub scratch: &'a mut Vec<Blob>,
    pub engine: &'a dyn MathEngine,
    /// A backward pass will follow this forward pass.
    pub training: bool,
    /// First step of a sequence; always set outside recurrent composites.
    pub first_step: bool,
    /// Value delivered by a feedback edge ending at this layer, present
    /// from the second step of a sequence on.
    pub feedback: Option<&'a Blob>,
}

/// Buffers a layer sees while propagating gradients.
pub struct BackwardContext<'a> {
    pub inputs: &'a [&'a Blob],
    pub outputs: &'a [Blob],
    pub scratch: &'a [Blob],
    pub output_diffs: &'a [Blob],
    /// Zero filled before the call.
    pub input_diffs: &'a mut [Blob],
    pub engine: &'a dyn MathEngine,
    pub first_step: bool,
    /// `learn_once` follows in the same walk.
    pub learning: bool,
    /// Gradient for the producer of the feedback edge ending at this layer,
    /// present for every step but the first.
    pub feedback_diff: Option<&'a mut Blob>,
}

pub struct LearnContext<'a> {
    pub inputs: &'a [&'a Blob],
    pub outputs: &'a [Blob],
    pub scratch: &'a [Blob],
    pub output_diffs: &'a [Blob],
    pub engine: &'a dyn MathEngine,
}

/// A trainable tensor paired with its accumulated gradient.
pub struct Param<'a> {
    pub value: &'a mut Blob,
    pub diff: &'a mut Blob,
}

/// A node of the computation graph.
///
/// The graph calls `reshape` whenever it is dirty, then `run_once` for every
/// step, `backward_once` when some upstream layer needs gradients and
/// `learn_once` when the layer's own parameters do.
pub trait Layer: Any {
    /// Registry key used by the archive.
    fn kind(&self) -> &'static str;

    fn version(&self) -> u32;

    fn input_count(&self) -> RangeInclusive<usize>;

    /// Validates the input descriptors and returns the output descriptors.
    fn reshape(&mut self, inputs: &[BlobDesc]) -> Result<Vec<BlobDesc>>;

    fn run_once(&mut self, ctx: RunContext<'_>) -> Result<()>;

    fn backward_once(&mut self, ctx: BackwardContext<'_>) -> Result<()>;

    fn learn_once(&mut self, _ctx: LearnContext<'_>) -> Result<()> {
        Ok(())
    }

    fn blobs_for_backward(&self) -> BlobsForBackward {
        BlobsForBackward::NONE
    }

    fn is_learnable(&self) -> bool {
        false
    }

    fn supports_backward(&self) -> bool {
        true
    }

    /// Keeps the gradient of its outputs even when nothing upstream learns.
    fn collects_output_diff(&self) -> bool {
        false
    }

    /// Whether feedback edges may end at this layer.
    fn accepts_feedback(&self) -> bool {
        false
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        Vec::new()
    }

    /// Serializes the layer configuration and parameters.
    fn save(&self) -> Result<serde_json::Value>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
