use std::{any::Any, ops::RangeInclusive};

use cortex_core::{check_architecture, BlobDesc, BlobDim, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    archive::{decode, plain, Decoder},
    layer::{BackwardContext, Layer, RunContext},
    registry::LayerRegistry,
};


/// Concatenates its inputs along one axis; the inverse of [`Split`](super::Split).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Merge {
    dim: BlobDim,
}

#[derive(Serialize, Deserialize)]
struct MergeRecord {
    dim: BlobDim,
}

impl Merge {
    pub const KIND: &'static str = "Merge";
    const VERSION: u32 = 2000;
    const DECODERS: &'static [Decoder<MergeRecord>] = &[Decoder {
        min_version: 1000,
        max_version: 2000,
        decode: plain::<MergeRecord>,
    }];

    pub fn new(dim: BlobDim) -> Self {
        Self { dim }
    }

    pub fn dim(&self) -> BlobDim {
        self.dim
    }

    pub(crate) fn load(
        version: u32,
        body: Value,
        registry: &LayerRegistry,
    ) -> Result<Box<dyn Layer>> {
        let record = decode(Self::KIND, version, body, registry, Self::DECODERS)?;
        Ok(Box::new(Self::new(record.dim)))
    }
}

impl Layer for Merge {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn version(&self) -> u32 {
        Self::VERSION
    }

    fn input_count(&self) -> RangeInclusive<usize> {
        1..=usize::MAX
    }

    fn reshape(&mut self, inputs: &[BlobDesc]) -> Result<Vec<BlobDesc>> {
        let first = inputs[0];
        for (position, desc) in inputs.iter().enumerate().skip(1) {
            check_architecture!(
                first.has_equal_dims_except(desc, self.dim),
                "input {} is shaped {}, incompatible with {} along {:?}",
                position,
                desc,
                first,
                self.dim
            );
        }
        let total = inputs.iter().map(|desc| desc.dim(self.dim)).sum();
        Ok(vec![first.with(self.dim, total)])
    }

    fn run_once(&mut self, ctx: RunContext<'_>) -> Result<()> {
        ctx.engine
            .merge_by_dim(self.dim, ctx.inputs, &mut ctx.outputs[0]);
        Ok(())
    }

    fn backward_once(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        ctx.engine
            .split_by_dim(self.dim, &ctx.output_diffs[0], ctx.input_diffs);
        Ok(())
    }

    fn save(&self) -> Result<Value> {
        Ok(serde_json::to_value(MergeRecord { dim: self.dim })?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
