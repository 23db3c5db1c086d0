use std::{any::Any, ops::RangeInclusive};

use cortex_core::{ActivationKind, BlobDesc, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    archive::{decode, plain, Decoder},
    layer::{BackwardContext, BlobsForBackward, Layer, RunContext},
    registry::LayerRegistry,
};


/// Pointwise nonlinearity. Derivatives are computed from the output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Activation {
    kind: ActivationKind,
}

#[derive(Serialize, Deserialize)]
struct ActivationRecord {
    kind: ActivationKind,
}

impl Activation {
    pub const KIND: &'static str = "Activation";
    const VERSION: u32 = 2000;
    const DECODERS: &'static [Decoder<ActivationRecord>] = &[Decoder {
        min_version: 1000,
        max_version: 2000,
        decode: plain::<ActivationRecord>,
    }];

    pub fn new(kind: ActivationKind) -> Self {
        Self { kind }
    }

    pub fn activation(&self) -> ActivationKind {
        self.kind
    }

    pub fn set_activation(&mut self, kind: ActivationKind) {
        self.kind = kind;
    }

    pub(crate) fn load(
        version: u32,
        body: Value,
        registry: &LayerRegistry,
    ) -> Result<Box<dyn Layer>> {
        let record = decode(Self::KIND, version, body, registry, Self::DECODERS)?;
        Ok(Box::new(Self::new(record.kind)))
    }
}

impl Layer for Activation {
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
        Ok(vec![inputs[0]])
    }

    fn run_once(&mut self, ctx: RunContext<'_>) -> Result<()> {
        ctx.engine
            .activation(self.kind, ctx.inputs[0], &mut ctx.outputs[0]);
        Ok(())
    }

    fn backward_once(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        ctx.engine.activation_diff(
            self.kind,
            &ctx.outputs[0],
            &ctx.output_diffs[0],
            &mut ctx.input_diffs[0],
        );
        Ok(())
    }

    fn blobs_for_backward(&self) -> BlobsForBackward {
        BlobsForBackward::OUTPUTS
    }

    fn save(&self) -> Result<Value> {
        Ok(serde_json::to_value(ActivationRecord { kind: self.kind })?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
