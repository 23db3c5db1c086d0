use std::{any::Any, ops::RangeInclusive};

use cortex_core::{check_architecture, BlobDesc, BlobDim, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    archive::{decode, plain, Decoder},
    layer::{BackwardContext, Layer, RunContext},
    registry::LayerRegistry,
};


const OBJECT_DIMS: [BlobDim; 4] = [
    BlobDim::Height,
    BlobDim::Width,
    BlobDim::Depth,
    BlobDim::Channels,
];

/// Holding layer at the end of a feedback edge.
///
/// Its single input is the initial state, emitted on the first step of a
/// sequence. On every later step it emits what the feedback producer
/// computed in the previous step, and the gradient it receives goes back to
/// that producer instead of the initial state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackLink {
    object: BlobDesc,
}

#[derive(Serialize, Deserialize)]
struct BackLinkRecord {
    object: BlobDesc,
}

impl BackLink {
    pub const KIND: &'static str = "BackLink";
    const VERSION: u32 = 2000;
    const DECODERS: &'static [Decoder<BackLinkRecord>] = &[Decoder {
        min_version: 1000,
        max_version: 2000,
        decode: plain::<BackLinkRecord>,
    }];

    /// A back link carrying objects of `channels` channels.
    pub fn new(channels: usize) -> Self {
        Self {
            object: BlobDesc::channels_only(channels),
        }
    }

    /// Object shape of the carried state; only the `Height..=Channels` axes
    /// are meaningful.
    pub fn object_desc(&self) -> BlobDesc {
        self.object
    }

    pub fn set_dim_size(&mut self, dim: BlobDim, size: usize) -> Result<()> {
        if !OBJECT_DIMS.contains(&dim) || size == 0 {
            return Err(Error::Configuration(format!(
                "a back link object cannot have {:?} of size {}",
                dim, size
            )));
        }
        self.object.set_dim(dim, size);
        Ok(())
    }

    /// Descriptor of a one step state for a batch.
    pub fn state_desc(&self, batch_width: usize, list_size: usize) -> BlobDesc {
        self.object
            .with(BlobDim::BatchWidth, batch_width)
            .with(BlobDim::ListSize, list_size)
    }

    pub(crate) fn load(
        version: u32,
        body: Value,
        registry: &LayerRegistry,
    ) -> Result<Box<dyn Layer>> {
        let record = decode(Self::KIND, version, body, registry, Self::DECODERS)?;
        Ok(Box::new(Self {
            object: record.object,
        }))
    }
}

impl Layer for BackLink {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn version(&self) -> u32 {
        Self::VERSION
    }

    fn input_count(&self) -> RangeInclusive<usize> {
        1..=1
    }

    fn reshape(&mut self, inputs: &[BlobDesc]) -> Result<Vec<BlobDesc>> {
        let initial = inputs[0];
        check_architecture!(
            initial.batch_length() == 1,
            "the initial state {} must be a single step",
            initial
        );
        check_architecture!(
            OBJECT_DIMS
                .iter()
                .all(|&dim| initial.dim(dim) == self.object.dim(dim)),
            "the initial state {} does not match the object {}",
            initial,
            self.object
        );
        Ok(vec![initial])
    }

    fn run_once(&mut self, ctx: RunContext<'_>) -> Result<()> {
        let value = ctx.feedback.unwrap_or(ctx.inputs[0]);
        ctx.engine.copy(value, &mut ctx.outputs[0]);
        Ok(())
    }

    fn backward_once(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        match ctx.feedback_diff {
            Some(previous) => ctx.engine.copy(&ctx.output_diffs[0], previous),
            None => ctx
                .engine
                .copy(&ctx.output_diffs[0], &mut ctx.input_diffs[0]),
        }
        Ok(())
    }

    fn accepts_feedback(&self) -> bool {
        true
    }

    fn save(&self) -> Result<Value> {
        Ok(serde_json::to_value(BackLinkRecord {
            object: self.object,
        })?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
