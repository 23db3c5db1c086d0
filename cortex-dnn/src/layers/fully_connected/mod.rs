use std::{any::Any, ops::RangeInclusive};

use cortex_core::{check_architecture, Blob, BlobDesc, BlobDim, Error, Result};
use ndarray::{ArrayView1, ArrayViewMut1};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    archive::{decode, plain, Decoder},
    init,
    layer::{BackwardContext, BlobsForBackward, Layer, LearnContext, Param, RunContext},
    registry::LayerRegistry,
};

#[cfg(test)]
mod test;

/// Applies an affine transformation to every object: `y = x · Wᵀ + b`.
///
/// The weights hold one row per output element, shaped
/// `BatchWidth = elements × Channels = input object size`. Weights left
/// unset are drawn from *U(-k, k)* with `k = 1 / sqrt(input object size)`
/// at the first reshape.
#[derive(Clone, Debug)]
pub struct FullyConnected {
    elements: usize,
    weights: Option<Blob>,
    free_term: Option<Blob>,
    weights_diff: Option<Blob>,
    free_term_diff: Option<Blob>,
    seed: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct FullyConnectedRecord {
    elements: usize,
    weights: Option<Blob>,
    free_term: Option<Blob>,
}

fn weights_desc(elements: usize, object_size: usize) -> BlobDesc {
    BlobDesc::channels_only(object_size).with(BlobDim::BatchWidth, elements)
}

fn vector(blob: &Blob) -> Result<ArrayView1<'_, f32>> {
    Ok(blob.data().view().into_shape(blob.len())?)
}

fn vector_mut(blob: &mut Blob) -> Result<ArrayViewMut1<'_, f32>> {
    let len = blob.len();
    Ok(blob.data_mut().view_mut().into_shape(len)?)
}

fn missing(what: &str) -> Error {
    Error::State(format!("{} used before the layer was reshaped", what))
}

impl FullyConnected {
    pub const KIND: &'static str = "FullyConnected";
    const VERSION: u32 = 2000;
    const DECODERS: &'static [Decoder<FullyConnectedRecord>] = &[Decoder {
        min_version: 1000,
        max_version: 2000,
        decode: plain::<FullyConnectedRecord>,
    }];

    pub fn new(elements: usize) -> Result<Self> {
        check_elements(elements)?;
        Ok(Self {
            elements,
            weights: None,
            free_term: None,
            weights_diff: None,
            free_term_diff: None,
            seed: None,
        })
    }

    /// Makes the weight initialization reproducible.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Changing the number of elements discards weights and free term.
    pub fn set_elements(&mut self, elements: usize) -> Result<()> {
        check_elements(elements)?;
        if elements != self.elements {
            self.elements = elements;
            self.weights = None;
            self.free_term = None;
        }
        Ok(())
    }

    pub fn weights(&self) -> Option<&Blob> {
        self.weights.as_ref()
    }

    /// Replaces the weights; `None` draws fresh ones at the next reshape.
    pub fn set_weights(&mut self, weights: Option<Blob>) -> Result<()> {
        if let Some(weights) = &weights {
            let desc = weights.desc();
            if desc.object_count() != self.elements || desc.batch_width() != self.elements {
                return Err(Error::Configuration(format!(
                    "weights {} must have BatchWidth = {} rows",
                    desc, self.elements
                )));
            }
        }
        self.weights = weights;
        Ok(())
    }

    pub fn free_term(&self) -> Option<&Blob> {
        self.free_term.as_ref()
    }

    /// Replaces the free term; `None` resets it to zeros at the next reshape.
    pub fn set_free_term(&mut self, free_term: Option<Blob>) -> Result<()> {
        if let Some(free_term) = &free_term {
            if free_term.desc() != BlobDesc::channels_only(self.elements) {
                return Err(Error::Configuration(format!(
                    "free term {} must hold {} channels",
                    free_term.desc(),
                    self.elements
                )));
            }
        }
        self.free_term = free_term;
        Ok(())
    }

    pub fn weights_diff(&self) -> Option<&Blob> {
        self.weights_diff.as_ref()
    }

    pub fn free_term_diff(&self) -> Option<&Blob> {
        self.free_term_diff.as_ref()
    }

    pub(crate) fn load(
        version: u32,
        body: Value,
        registry: &LayerRegistry,
    ) -> Result<Box<dyn Layer>> {
        let record = decode(Self::KIND, version, body, registry, Self::DECODERS)?;
        let mut layer = Self::new(record.elements)?;
        layer.set_weights(record.weights)?;
        layer.set_free_term(record.free_term)?;
        Ok(Box::new(layer))
    }
}

fn check_elements(elements: usize) -> Result<()> {
    if elements == 0 {
        return Err(Error::Configuration(
            "a fully connected layer needs at least one element".into(),
        ));
    }
    Ok(())
}

fn fit_diff(diff: &mut Option<Blob>, desc: BlobDesc) {
    if diff.as_ref().map(Blob::desc) != Some(desc) {
        *diff = Some(Blob::zeros(desc));
    }
}

impl Layer for FullyConnected {
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
        check_architecture!(
            input.object_size() > 0,
            "input {} has empty objects",
            input
        );
        let expected = weights_desc(self.elements, input.object_size());
        match &self.weights {
            Some(weights) => check_architecture!(
                weights.desc() == expected,
                "weights are shaped {} but the input needs {}",
                weights.desc(),
                expected
            ),
            None => {
                let k = 1. / (input.object_size() as f32).sqrt();
                let mut weights = Blob::zeros(expected);
                init::uniform(&mut weights, -k, k, &mut init::generator(self.seed));
                log::trace!("initialized weights {}", expected);
                self.weights = Some(weights);
            }
        }
        let free_term_desc = BlobDesc::channels_only(self.elements);
        if self.free_term.is_none() {
            self.free_term = Some(Blob::zeros(free_term_desc));
        }
        fit_diff(&mut self.weights_diff, expected);
        fit_diff(&mut self.free_term_diff, free_term_desc);

        Ok(vec![input
            .with(BlobDim::Height, 1)
            .with(BlobDim::Width, 1)
            .with(BlobDim::Depth, 1)
            .with(BlobDim::Channels, self.elements)])
    }

    fn run_once(&mut self, ctx: RunContext<'_>) -> Result<()> {
        let weights = self.weights.as_ref().ok_or_else(|| missing("weights"))?;
        let free_term = self.free_term.as_ref().ok_or_else(|| missing("free term"))?;
        let output = &mut ctx.outputs[0];
        ctx.engine.multiply_by_transposed(
            ctx.inputs[0].as_matrix()?,
            weights.as_matrix()?,
            output.as_matrix_mut()?,
        );
        ctx.engine.add_row(output.as_matrix_mut()?, vector(free_term)?);
        Ok(())
    }

    fn backward_once(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        let weights = self.weights.as_ref().ok_or_else(|| missing("weights"))?;
        ctx.engine.multiply(
            ctx.output_diffs[0].as_matrix()?,
            weights.as_matrix()?,
            ctx.input_diffs[0].as_matrix_mut()?,
        );
        Ok(())
    }

    fn learn_once(&mut self, ctx: LearnContext<'_>) -> Result<()> {
        let gradient = ctx.output_diffs[0].as_matrix()?;
        let weights_diff = self.weights_diff.as_mut().ok_or_else(|| missing("weights gradient"))?;
        ctx.engine.multiply_transposed_and_add(
            gradient,
            ctx.inputs[0].as_matrix()?,
            weights_diff.as_matrix_mut()?,
        );
        let free_term_diff = self
            .free_term_diff
            .as_mut()
            .ok_or_else(|| missing("free term gradient"))?;
        ctx.engine
            .sum_rows_and_add(gradient, vector_mut(free_term_diff)?);
        Ok(())
    }

    fn blobs_for_backward(&self) -> BlobsForBackward {
        BlobsForBackward::INPUTS
    }

    fn is_learnable(&self) -> bool {
        true
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        let mut params = Vec::with_capacity(2);
        if let (Some(value), Some(diff)) = (self.weights.as_mut(), self.weights_diff.as_mut()) {
            params.push(Param { value, diff });
        }
        if let (Some(value), Some(diff)) = (self.free_term.as_mut(), self.free_term_diff.as_mut()) {
            params.push(Param { value, diff });
        }
        params
    }

    fn save(&self) -> Result<Value> {
        Ok(serde_json::to_value(FullyConnectedRecord {
            elements: self.elements,
            weights: self.weights.clone(),
            free_term: self.free_term.clone(),
        })?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
