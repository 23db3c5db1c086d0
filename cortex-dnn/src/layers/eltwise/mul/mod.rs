use std::{any::Any, ops::RangeInclusive};

use cortex_core::{BlobDesc, Result};
use serde_json::Value;

use super::{check_record, reshape_inputs, save_record, VERSION};
use crate::{
    layer::{BackwardContext, BlobsForBackward, Layer, RunContext},
    registry::LayerRegistry,
};


/// `y = x0 * x1 * ...`
#[derive(Clone, Copy, Debug, Default)]
pub struct EltwiseMul;

impl EltwiseMul {
    pub const KIND: &'static str = "EltwiseMul";

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

impl Layer for EltwiseMul {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn version(&self) -> u32 {
        VERSION
    }

    fn input_count(&self) -> RangeInclusive<usize> {
        2..=usize::MAX
    }

    fn reshape(&mut self, inputs: &[BlobDesc]) -> Result<Vec<BlobDesc>> {
        reshape_inputs(inputs)
    }

    fn run_once(&mut self, ctx: RunContext<'_>) -> Result<()> {
        let output = &mut ctx.outputs[0];
        ctx.engine.copy(ctx.inputs[0], output);
        for input in &ctx.inputs[1..] {
            ctx.engine.mul_in_place(output, input);
        }
        Ok(())
    }

    // The gradient of input i is the output gradient times every other input.
    fn backward_once(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        for (position, diff) in ctx.input_diffs.iter_mut().enumerate() {
            ctx.engine.copy(&ctx.output_diffs[0], diff);
            for (other, input) in ctx.inputs.iter().enumerate() {
                if other != position {
                    ctx.engine.mul_in_place(diff, input);
                }
            }
        }
        Ok(())
    }

    fn blobs_for_backward(&self) -> BlobsForBackward {
        BlobsForBackward::INPUTS
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
