use std::{any::Any, ops::RangeInclusive};

use cortex_core::{check_architecture, Blob, BlobDesc, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    archive::{decode, plain, Decoder},
    layer::{BackwardContext, Layer, RunContext},
    registry::LayerRegistry,
};


/// Feeds a user supplied blob into the graph.
#[derive(Clone, Debug, Default)]
pub struct Source {
    blob: Option<Blob>,
    collect_diff: bool,
}

#[derive(Serialize, Deserialize)]
struct SourceRecord {
    collect_diff: bool,
}

impl Source {
    pub const KIND: &'static str = "Source";
    const VERSION: u32 = 2000;
    const DECODERS: &'static [Decoder<SourceRecord>] = &[Decoder {
        min_version: 1000,
        max_version: 2000,
        decode: plain::<SourceRecord>,
    }];

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: Blob) -> Self {
        Self {
            blob: Some(blob),
            collect_diff: false,
        }
    }

    pub fn blob(&self) -> Option<&Blob> {
        self.blob.as_ref()
    }

    pub fn set_blob(&mut self, blob: Blob) {
        self.blob = Some(blob);
    }

    /// Keeps the gradient reaching this source after every backward pass.
    pub fn set_collect_diff(&mut self, collect_diff: bool) {
        self.collect_diff = collect_diff;
    }

    pub(crate) fn load(
        version: u32,
        body: Value,
        registry: &LayerRegistry,
    ) -> Result<Box<dyn Layer>> {
        let record = decode(Self::KIND, version, body, registry, Self::DECODERS)?;
        Ok(Box::new(Self {
            blob: None,
            collect_diff: record.collect_diff,
        }))
    }
}

impl Layer for Source {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn version(&self) -> u32 {
        Self::VERSION
    }

    fn input_count(&self) -> RangeInclusive<usize> {
        0..=0
    }

    fn reshape(&mut self, _inputs: &[BlobDesc]) -> Result<Vec<BlobDesc>> {
        check_architecture!(self.blob.is_some(), "no blob is set");
        Ok(self.blob.iter().map(Blob::desc).collect())
    }

    fn run_once(&mut self, ctx: RunContext<'_>) -> Result<()> {
        let blob = self
            .blob
            .as_ref()
            .ok_or_else(|| Error::State("source blob was removed after reshape".into()))?;
        ctx.engine.copy(blob, &mut ctx.outputs[0]);
        Ok(())
    }

    fn backward_once(&mut self, _ctx: BackwardContext<'_>) -> Result<()> {
        Ok(())
    }

    fn collects_output_diff(&self) -> bool {
        self.collect_diff
    }

    fn save(&self) -> Result<Value> {
        Ok(serde_json::to_value(SourceRecord {
            collect_diff: self.collect_diff,
        })?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
