use std::{any::Any, ops::RangeInclusive};

use cortex_core::{check_architecture, Blob, BlobDesc, BlobDim, Error, MathEngine, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    archive::{decode, plain, Decoder, GraphRecord},
    graph::Graph,
    layer::{BackwardContext, Layer, LearnContext, Param, RunContext},
    layers::BackLink,
    registry::LayerRegistry,
};

#[cfg(test)]
mod test;

/// Binds an input of the composite to an input slot of an internal layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMapping {
    pub layer: String,
    pub input: usize,
}

/// Exposes an output of an internal layer as an output of the composite.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMapping {
    pub layer: String,
    pub output: usize,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct RecurrentRecord {
    graph: GraphRecord,
    inputs: Vec<Option<InputMapping>>,
    outputs: Vec<Option<OutputMapping>>,
    reverse: bool,
}

/// Composite layer running an internal graph once per sequence step.
///
/// Every input is either a sequence, sliced along `BatchLength` into one
/// step per run of the internal graph, or an initial state when it is mapped
/// onto a [`BackLink`]. Missing initial states are zeros. Outputs are the
/// mapped internal outputs of every step, stacked along `BatchLength`.
///
/// Backward walks the steps in reverse, restoring what each forward step
/// retained, and carries the gradients of the feedback edges from step to
/// step.
pub struct Recurrent {
    graph: Graph,
    inputs: Vec<Option<InputMapping>>,
    outputs: Vec<Option<OutputMapping>>,
    reverse: bool,
    steps: usize,
    learned: bool,
}

impl Default for Recurrent {
    fn default() -> Self {
        Self::new()
    }
}

impl Recurrent {
    pub const KIND: &'static str = "Recurrent";
    const VERSION: u32 = 2000;
    const DECODERS: &'static [Decoder<RecurrentRecord>] = &[Decoder {
        min_version: 1000,
        max_version: 2000,
        decode: plain::<RecurrentRecord>,
    }];

    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            reverse: false,
            steps: 0,
            learned: false,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn add_layer(&mut self, name: impl Into<String>, layer: impl Layer) -> Result<()> {
        self.graph.add_layer(name, layer)
    }

    /// Routes input `input` of the composite to slot `layer_input` of the
    /// internal layer `layer`.
    pub fn set_input_mapping(
        &mut self,
        input: usize,
        layer: &str,
        layer_input: usize,
    ) -> Result<()> {
        let mapping = InputMapping {
            layer: layer.to_owned(),
            input: layer_input,
        };
        if let Some(Some(old)) = self.inputs.get(input) {
            if *old != mapping && self.graph.has_layer(&old.layer) {
                let old = old.clone();
                self.graph.disconnect(&old.layer, old.input)?;
            }
        }
        self.graph.connect_external(layer, layer_input, input)?;
        self.graph.set_external_requires_diff(input, true);
        if self.inputs.len() <= input {
            self.inputs.resize(input + 1, None);
        }
        self.inputs[input] = Some(mapping);
        Ok(())
    }

    pub fn input_mapping(&self, input: usize) -> Option<&InputMapping> {
        self.inputs.get(input).and_then(Option::as_ref)
    }

    pub fn set_output_mapping(
        &mut self,
        output: usize,
        layer: &str,
        layer_output: usize,
    ) -> Result<()> {
        if !self.graph.has_layer(layer) {
            return Err(Error::LayerNotFound(layer.to_owned()));
        }
        if self.outputs.len() <= output {
            self.outputs.resize(output + 1, None);
        }
        self.outputs[output] = Some(OutputMapping {
            layer: layer.to_owned(),
            output: layer_output,
        });
        Ok(())
    }

    pub fn output_mapping(&self, output: usize) -> Option<&OutputMapping> {
        self.outputs.get(output).and_then(Option::as_ref)
    }

    pub fn is_reverse_sequence(&self) -> bool {
        self.reverse
    }

    /// Processes the steps from the last to the first.
    pub fn set_reverse_sequence(&mut self, reverse: bool) {
        self.reverse = reverse;
    }

    /// Sequence length seen by the last reshape.
    pub fn sequence_length(&self) -> usize {
        self.steps
    }

    pub(crate) fn from_record(record: RecurrentRecord, registry: &LayerRegistry) -> Result<Self> {
        let mut graph = Graph::from_record(record.graph, registry)?;
        for (input, mapping) in record.inputs.iter().enumerate() {
            if mapping.is_some() {
                graph.set_external_requires_diff(input, true);
            }
        }
        Ok(Self {
            graph,
            inputs: record.inputs,
            outputs: record.outputs,
            reverse: record.reverse,
            steps: 0,
            learned: false,
        })
    }

    pub(crate) fn to_record(&self) -> Result<RecurrentRecord> {
        Ok(RecurrentRecord {
            graph: self.graph.to_record()?,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            reverse: self.reverse,
        })
    }

    pub(crate) fn load(
        version: u32,
        body: Value,
        registry: &LayerRegistry,
    ) -> Result<Box<dyn Layer>> {
        let record = decode(Self::KIND, version, body, registry, Self::DECODERS)?;
        Ok(Box::new(Self::from_record(record, registry)?))
    }

    fn mapping(&self, input: usize) -> Result<&InputMapping> {
        self.input_mapping(input)
            .ok_or_else(|| Error::architecture(format!("input {} has no internal mapping", input)))
    }

    fn holds_state(&self, mapping: &InputMapping) -> bool {
        self.graph
            .layer_dyn(&mapping.layer)
            .map_or(false, |layer| layer.accepts_feedback())
    }

    fn is_state_input(&self, input: usize) -> bool {
        self.input_mapping(input)
            .map_or(false, |mapping| self.holds_state(mapping))
    }

    fn step_index(&self, k: usize) -> usize {
        if self.reverse {
            self.steps - 1 - k
        } else {
            k
        }
    }

    fn external(&mut self, input: usize) -> Result<&mut Blob> {
        self.graph
            .external_mut(input)
            .ok_or_else(|| {
                Error::State(format!(
                    "input {} is not bound to the internal graph",
                    input
                ))
            })
    }

    /// Backpropagation through the steps recorded in `scratch`. Gradients
    /// of the composite inputs are written when `input_diffs` is given.
    fn through_time(
        &mut self,
        inputs: usize,
        scratch: &[Blob],
        output_diffs: &[Blob],
        mut input_diffs: Option<&mut [Blob]>,
        engine: &dyn MathEngine,
        learn: bool,
    ) -> Result<()> {
        let steps = self.steps;
        if steps == 0 {
            return Ok(());
        }
        if scratch.len() % steps != 0 {
            return Err(Error::State(
                "the step records do not match the sequence length".into(),
            ));
        }
        let record = scratch.len() / steps;
        let states: Vec<bool> = (0..inputs).map(|i| self.is_state_input(i)).collect();

        self.graph.begin_backward();
        for k in (0..steps).rev() {
            let t = self.step_index(k);
            self.graph.load_step(&scratch[k * record..(k + 1) * record])?;
            for (mapping, diff) in self.outputs.iter().flatten().zip(output_diffs) {
                let step_desc = self.graph.output_desc(&mapping.layer, mapping.output)?;
                let mut step_diff = Blob::zeros(step_desc);
                engine.extract_slice(diff, BlobDim::BatchLength, t, &mut step_diff);
                self.graph
                    .set_output_diff(&mapping.layer, mapping.output, step_diff)?;
            }
            self.graph.backward_step(engine, k == 0, learn)?;

            if let Some(diffs) = input_diffs.as_deref_mut() {
                for (i, diff) in diffs.iter_mut().enumerate() {
                    let step_diff = self.graph.external_diff(i).ok_or_else(|| {
                        Error::State(format!("no gradient was computed for input {}", i))
                    })?;
                    if states[i] {
                        engine.add_in_place(diff, step_diff);
                    } else {
                        engine.insert_slice(step_diff, BlobDim::BatchLength, t, diff);
                    }
                }
            }
        }
        self.graph.clear_output_diffs();
        log::trace!("backpropagated through {} steps", steps);
        Ok(())
    }
}

impl Layer for Recurrent {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn version(&self) -> u32 {
        Self::VERSION
    }

    /// Trailing inputs mapped onto back links are optional.
    fn input_count(&self) -> RangeInclusive<usize> {
        let required = self
            .inputs
            .iter()
            .rposition(|mapping| matches!(mapping, Some(mapping) if !self.holds_state(mapping)))
            .map_or(0, |last| last + 1);
        required..=self.inputs.len()
    }

    fn reshape(&mut self, inputs: &[BlobDesc]) -> Result<Vec<BlobDesc>> {
        check_architecture!(
            !self.outputs.is_empty() && self.outputs.iter().all(Option::is_some),
            "every output of a recurrent layer needs an internal mapping"
        );

        let mut sequence: Option<BlobDesc> = None;
        for (i, desc) in inputs.iter().enumerate() {
            if self.holds_state(self.mapping(i)?) {
                continue;
            }
            match sequence {
                None => sequence = Some(*desc),
                Some(first) => check_architecture!(
                    desc.batch_length() == first.batch_length(),
                    "input {} is {} steps long, input 0 has {}",
                    i,
                    desc.batch_length(),
                    first.batch_length()
                ),
            }
        }
        let sequence = sequence
            .ok_or_else(|| Error::architecture("a recurrent layer needs a sequence input"))?;
        let steps = sequence.batch_length();

        for i in 0..self.inputs.len() {
            let mapping = self.mapping(i)?;
            let desc = match inputs.get(i) {
                Some(desc) if self.holds_state(mapping) => *desc,
                Some(desc) => desc.with(BlobDim::BatchLength, 1),
                None => self
                    .graph
                    .layer::<BackLink>(&mapping.layer)?
                    .state_desc(sequence.batch_width(), 1),
            };
            if i >= inputs.len() || self.graph.external_desc(i) != Some(desc) {
                self.graph.set_external(i, Blob::zeros(desc));
            }
        }

        self.graph.reshape()?;
        let outputs = self
            .outputs
            .iter()
            .flatten()
            .map(|mapping| -> Result<BlobDesc> {
                let desc = self.graph.output_desc(&mapping.layer, mapping.output)?;
                check_architecture!(
                    desc.batch_length() == 1,
                    "`{}` produces {} steps at once",
                    mapping.layer,
                    desc.batch_length()
                );
                Ok(desc.with(BlobDim::BatchLength, steps))
            })
            .collect::<Result<Vec<_>>>()?;
        self.steps = steps;
        Ok(outputs)
    }

    fn run_once(&mut self, ctx: RunContext<'_>) -> Result<()> {
        let engine = ctx.engine;
        let states: Vec<bool> = (0..ctx.inputs.len()).map(|i| self.is_state_input(i)).collect();
        for (i, input) in ctx.inputs.iter().enumerate() {
            if states[i] {
                engine.copy(input, self.external(i)?);
            }
        }

        ctx.scratch.clear();
        self.learned = false;
        self.graph.begin_sequence();
        for k in 0..self.steps {
            let t = self.step_index(k);
            for (i, input) in ctx.inputs.iter().enumerate() {
                if !states[i] {
                    engine.extract_slice(input, BlobDim::BatchLength, t, self.external(i)?);
                }
            }
            self.graph.forward_step(engine, ctx.training)?;
            for (mapping, output) in self.outputs.iter().flatten().zip(ctx.outputs.iter_mut()) {
                let step = self.graph.output(&mapping.layer, mapping.output)?;
                engine.insert_slice(step, BlobDim::BatchLength, t, output);
            }
            if ctx.training {
                self.graph.save_step(ctx.scratch)?;
            }
        }
        Ok(())
    }

    fn backward_once(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        self.through_time(
            ctx.inputs.len(),
            ctx.scratch,
            ctx.output_diffs,
            Some(ctx.input_diffs),
            ctx.engine,
            ctx.learning,
        )?;
        self.learned = ctx.learning;
        Ok(())
    }

    fn learn_once(&mut self, ctx: LearnContext<'_>) -> Result<()> {
        if std::mem::take(&mut self.learned) {
            return Ok(());
        }
        self.through_time(ctx.inputs.len(), ctx.scratch, ctx.output_diffs, None, ctx.engine, true)
    }

    fn is_learnable(&self) -> bool {
        self.graph.has_learnable_layers()
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        self.graph.parameters()
    }

    fn save(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.to_record()?)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
