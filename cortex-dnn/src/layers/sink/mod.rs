use std::{any::Any, ops::RangeInclusive};

use cortex_core::{check_architecture, Blob, BlobDesc, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    archive::{decode, plain, Decoder},
    layer::{BackwardContext, Layer, RunContext},
    registry::LayerRegistry,
};

#[cfg(test)]
mod test;

/// Terminal layer exposing what it receives, see
/// [`Graph::sink_blob`](crate::Graph::sink_blob). An optional gradient set
/// with [`Sink::set_diff`] is sent back upstream.
#[derive(Clone, Debug, Default)]
pub struct Sink {
    diff: Option<Blob>,
}

#[derive(Serialize, Deserialize)]
struct SinkRecord {}

impl Sink {
    pub const KIND: &'static str = "Sink";
    const VERSION: u32 = 2000;
    const DECODERS: &'static [Decoder<SinkRecord>] = &[Decoder {
        min_version: 1000,
        max_version: 2000,
        decode: plain::<SinkRecord>,
    }];

    pub fn new() -> Self {
        Self::default()
    }

    pub fn diff(&self) -> Option<&Blob> {
        self.diff.as_ref()
    }

    pub fn set_diff(&mut self, diff: Option<Blob>) {
        self.diff = diff;
    }

    pub(crate) fn load(
        version: u32,
        body: Value,
        registry: &LayerRegistry,
    ) -> Result<Box<dyn Layer>> {
        decode(Self::KIND, version, body, registry, Self::DECODERS)?;
        Ok(Box::new(Self::new()))
    }
}

impl Layer for Sink {
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
        if let Some(diff) = &self.diff {
            check_architecture!(
                diff.desc() == inputs[0],
                "gradient {} does not match the input {}",
                diff.desc(),
                inputs[0]
            );
        }
        Ok(Vec::new())
    }

    fn run_once(&mut self, _ctx: RunContext<'_>) -> Result<()> {
        Ok(())
    }

    fn backward_once(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        if let Some(diff) = &self.diff {
            ctx.engine.copy(diff, &mut ctx.input_diffs[0]);
        }
        Ok(())
    }

    fn save(&self) -> Result<Value> {
        Ok(serde_json::to_value(SinkRecord {})?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
