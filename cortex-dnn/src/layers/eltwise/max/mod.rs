use std::{any::Any, ops::RangeInclusive};

use cortex_core::{Blob, BlobDesc, Result};
use serde_json::Value;

use super::{check_record, reshape_inputs, save_record, VERSION};
use crate::{
    layer::{BackwardContext, Layer, RunContext},
    registry::LayerRegistry,
};


/// Elementwise maximum. Gradients flow only to the input that won each
/// element; ties go to the input connected first.
#[derive(Clone, Copy, Debug, Default)]
pub struct EltwiseMax;

impl EltwiseMax {
    pub const KIND: &'static str = "EltwiseMax";

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

impl Layer for EltwiseMax {
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
        let desc = ctx.outputs[0].desc();
        if ctx.scratch.len() != 1 || ctx.scratch[0].desc() != desc {
            *ctx.scratch = vec![Blob::zeros(desc)];
        }
        ctx.engine
            .max(ctx.inputs, &mut ctx.outputs[0], &mut ctx.scratch[0]);
        Ok(())
    }

    fn backward_once(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        ctx.engine
            .max_diff(&ctx.output_diffs[0], &ctx.scratch[0], ctx.input_diffs);
        Ok(())
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
