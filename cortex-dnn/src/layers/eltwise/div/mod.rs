use std::{any::Any, ops::RangeInclusive};

use cortex_core::{BlobDesc, Result};
use serde_json::Value;

use super::{check_record, reshape_inputs, save_record, VERSION};
use crate::{
    layer::{BackwardContext, BlobsForBackward, Layer, RunContext},
    registry::LayerRegistry,
};

#[cfg(test)]
mod test;

/// `y = x0 / x1`. Division by zero follows IEEE semantics.
#[derive(Clone, Copy, Debug, Default)]
pub struct EltwiseDiv;

impl EltwiseDiv {
    pub const KIND: &'static str = "EltwiseDiv";

    pub fn new() -> Self {
        Self
    }

    pub(crate) fn load(
        version: u32,
        body: Value,
        registry: &LayerRegistry,
    ) -> Result<Box<dyn Layer>> {
        check_record(Self::KIND, version, body, registry)?;
        Ok(Box::new(Self))
    }
}

impl Layer for EltwiseDiv {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn version(&self) -> u32 {
        VERSION
    }

    fn input_count(&self) -> RangeInclusive<usize> {
        2..=2
    }

    fn reshape(&mut self, inputs: &[BlobDesc]) -> Result<Vec<BlobDesc>> {
        reshape_inputs(inputs)
    }

    fn run_once(&mut self, ctx: RunContext<'_>) -> Result<()> {
        ctx.engine.div(ctx.inputs[0], ctx.inputs[1], &mut ctx.outputs[0]);
        Ok(())
    }

    fn backward_once(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        let (engine, divisor, output) = (ctx.engine, ctx.inputs[1], &ctx.outputs[0]);
        let (left, right) = ctx.input_diffs.split_at_mut(1);
        // dx0 = g / x1, dx1 = -g * y / x1
        engine.div(&ctx.output_diffs[0], divisor, &mut left[0]);
        engine.affine(output, -1., 0., &mut right[0]);
        engine.mul_in_place(&mut right[0], &left[0]);
        Ok(())
    }

    fn blobs_for_backward(&self) -> BlobsForBackward {
        BlobsForBackward::BOTH
    }

    fn save(&self) -> Result<Value> {
        save_record()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
