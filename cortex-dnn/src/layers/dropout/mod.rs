use std::{any::Any, ops::RangeInclusive};

use cortex_core::{Blob, BlobDesc, Error, Result};
use rand::rngs::StdRng;
use rand_distr::{Bernoulli, Distribution};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    archive::{decode, plain, Decoder},
    init,
    layer::{BackwardContext, Layer, RunContext},
    registry::LayerRegistry,
};


/// Zeroes each element with probability `rate` while training and scales
/// the survivors by `1 / (1 - rate)`. Outside training mode it is the
/// identity.
#[derive(Clone, Debug)]
pub struct Dropout {
    rate: f32,
    seed: Option<u64>,
    rng: StdRng,
}

#[derive(Serialize, Deserialize)]
struct DropoutRecord {
    rate: f32,
    seed: Option<u64>,
}

impl Dropout {
    pub const KIND: &'static str = "Dropout";
    const VERSION: u32 = 2000;
    const DECODERS: &'static [Decoder<DropoutRecord>] = &[Decoder {
        min_version: 1000,
        max_version: 2000,
        decode: plain::<DropoutRecord>,
    }];

    pub fn new(rate: f32) -> Result<Self> {
        check_rate(rate)?;
        Ok(Self {
            rate,
            seed: None,
            rng: init::generator(None),
        })
    }

    /// Makes the dropped positions reproducible.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self.rng = init::generator(Some(seed));
        self
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn set_rate(&mut self, rate: f32) -> Result<()> {
        check_rate(rate)?;
        self.rate = rate;
        Ok(())
    }

    pub(crate) fn load(
        version: u32,
        body: Value,
        registry: &LayerRegistry,
    ) -> Result<Box<dyn Layer>> {
        let record = decode(Self::KIND, version, body, registry, Self::DECODERS)?;
        let layer = Self::new(record.rate)?;
        Ok(Box::new(match record.seed {
            Some(seed) => layer.with_seed(seed),
            None => layer,
        }))
    }
}

pub(crate) fn check_rate(rate: f32) -> Result<()> {
    if !(0.0..1.0).contains(&rate) {
        return Err(Error::Configuration(format!(
            "dropout rate must lie in [0, 1), got {}",
            rate
        )));
    }
    Ok(())
}

impl Layer for Dropout {
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
        if !ctx.training || self.rate == 0. {
            ctx.scratch.clear();
            ctx.engine.copy(ctx.inputs[0], &mut ctx.outputs[0]);
            return Ok(());
        }

        let keep = 1. - self.rate;
        let distribution = Bernoulli::new(f64::from(keep))
            .map_err(|e| Error::Configuration(format!("dropout rate {}: {}", self.rate, e)))?;
        let desc = ctx.inputs[0].desc();
        if ctx.scratch.len() != 1 || ctx.scratch[0].desc() != desc {
            *ctx.scratch = vec![Blob::zeros(desc)];
        }
        let mask = &mut ctx.scratch[0];
        let rng = &mut self.rng;
        mask.data_mut().map_inplace(|el| {
            *el = if distribution.sample(rng) { 1. / keep } else { 0. };
        });
        ctx.engine.mul(ctx.inputs[0], mask, &mut ctx.outputs[0]);
        Ok(())
    }

    fn backward_once(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        match ctx.scratch.first() {
            Some(mask) => ctx
                .engine
                .mul(&ctx.output_diffs[0], mask, &mut ctx.input_diffs[0]),
            None => ctx.engine.copy(&ctx.output_diffs[0], &mut ctx.input_diffs[0]),
        }
        Ok(())
    }

    fn save(&self) -> Result<Value> {
        Ok(serde_json::to_value(DropoutRecord {
            rate: self.rate,
            seed: self.seed,
        })?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
