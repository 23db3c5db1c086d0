use std::{any::Any, ops::RangeInclusive};

use cortex_core::{check_architecture, Blob, BlobDesc, BlobDim, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    archive::{decode, plain, Decoder},
    layer::{BackwardContext, Layer, RunContext},
    registry::LayerRegistry,
};


/// Cuts its input along one axis into regions of the configured sizes.
///
/// Whatever the regions leave of the axis becomes one more output, so a
/// split with counts `[2, 3]` of an axis of size 7 has three outputs of
/// sizes 2, 3 and 2. The backward pass concatenates the output gradients.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Split {
    dim: BlobDim,
    counts: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct SplitRecord {
    dim: BlobDim,
    counts: Vec<usize>,
}

impl Split {
    pub const KIND: &'static str = "Split";
    const VERSION: u32 = 2000;
    const DECODERS: &'static [Decoder<SplitRecord>] = &[Decoder {
        min_version: 1000,
        max_version: 2000,
        decode: plain::<SplitRecord>,
    }];

    pub fn new(dim: BlobDim, counts: Vec<usize>) -> Result<Self> {
        check_counts(&counts)?;
        Ok(Self { dim, counts })
    }

    pub fn batch_length(counts: Vec<usize>) -> Result<Self> {
        Self::new(BlobDim::BatchLength, counts)
    }

    pub fn batch_width(counts: Vec<usize>) -> Result<Self> {
        Self::new(BlobDim::BatchWidth, counts)
    }

    pub fn list_size(counts: Vec<usize>) -> Result<Self> {
        Self::new(BlobDim::ListSize, counts)
    }

    pub fn height(counts: Vec<usize>) -> Result<Self> {
        Self::new(BlobDim::Height, counts)
    }

    pub fn width(counts: Vec<usize>) -> Result<Self> {
        Self::new(BlobDim::Width, counts)
    }

    pub fn depth(counts: Vec<usize>) -> Result<Self> {
        Self::new(BlobDim::Depth, counts)
    }

    pub fn channels(counts: Vec<usize>) -> Result<Self> {
        Self::new(BlobDim::Channels, counts)
    }

    pub fn dim(&self) -> BlobDim {
        self.dim
    }

    pub fn output_counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn set_output_counts(&mut self, counts: Vec<usize>) -> Result<()> {
        check_counts(&counts)?;
        self.counts = counts;
        Ok(())
    }

    pub(crate) fn load(
        version: u32,
        body: Value,
        registry: &LayerRegistry,
    ) -> Result<Box<dyn Layer>> {
        let record = decode(Self::KIND, version, body, registry, Self::DECODERS)?;
        Ok(Box::new(Self::new(record.dim, record.counts)?))
    }
}

fn check_counts(counts: &[usize]) -> Result<()> {
    if counts.iter().any(|&count| count == 0) {
        return Err(Error::Configuration(format!(
            "split regions must not be empty, got {:?}",
            counts
        )));
    }
    Ok(())
}

impl Layer for Split {
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
        let input = inputs[0];
        let total = input.dim(self.dim);
        let used: usize = self.counts.iter().sum();
        check_architecture!(
            used <= total,
            "regions {:?} need {} along {:?}, the input has {}",
            self.counts,
            used,
            self.dim,
            total
        );
        let mut outputs: Vec<BlobDesc> = self
            .counts
            .iter()
            .map(|&count| input.with(self.dim, count))
            .collect();
        if used < total {
            outputs.push(input.with(self.dim, total - used));
        }
        Ok(outputs)
    }

    fn run_once(&mut self, ctx: RunContext<'_>) -> Result<()> {
        ctx.engine.split_by_dim(self.dim, ctx.inputs[0], ctx.outputs);
        Ok(())
    }

    fn backward_once(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        let diffs: Vec<&Blob> = ctx.output_diffs.iter().collect();
        ctx.engine
            .merge_by_dim(self.dim, &diffs, &mut ctx.input_diffs[0]);
        Ok(())
    }

    fn save(&self) -> Result<Value> {
        Ok(serde_json::to_value(SplitRecord {
            dim: self.dim,
            counts: self.counts.clone(),
        })?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
