use std::{
    collections::{BTreeSet, HashMap},
    rc::Rc,
};

use cortex_core::{Blob, BlobDesc, CpuMathEngine, Error, MathEngine, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    archive::{check_graph_version, FeedbackRecord, GraphRecord, LayerRecord, ARCHIVE_VERSION},
    layer::{BackwardContext, Layer, LearnContext, Param, RunContext},
    layers::{Sink, Source},
    registry::LayerRegistry,
    solver::Solver,
};

#[cfg(test)]
mod test;

/// Where an input slot takes its blob from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    /// Output `output` of the layer called `name`.
    Layer { name: String, output: usize },
    /// Blob bound to the graph from outside, see [`Graph::set_external`].
    External(usize),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Forwarded { training: bool },
    Backwarded,
}

struct Node {
    name: String,
    inputs: Vec<Option<Link>>,
    learning: bool,
    outputs: Vec<Blob>,
    scratch: Vec<Blob>,
    output_diffs: Vec<Blob>,
    input_diffs: Vec<Blob>,
    seeded_diffs: Vec<Option<Blob>>,
}

impl Node {
    fn new(name: String) -> Self {
        Self {
            name,
            inputs: Vec::new(),
            learning: true,
            outputs: Vec::new(),
            scratch: Vec::new(),
            output_diffs: Vec::new(),
            input_diffs: Vec::new(),
            seeded_diffs: Vec::new(),
        }
    }
}

/// Edge from a producer output back to a holding layer, delivering the
/// value of the previous step.
struct Feedback {
    holder: String,
    producer: String,
    output: usize,
    held: Option<Blob>,
    pending: Option<Blob>,
    outgoing: Option<Blob>,
}

#[derive(Default)]
struct External {
    blob: Option<Blob>,
    diff: Option<Blob>,
    requires_diff: bool,
}

#[derive(Copy, Clone, Debug)]
enum Input {
    Layer { node: usize, output: usize },
    External(usize),
}

#[derive(Copy, Clone, Debug, Default)]
struct Flags {
    backward: bool,
    learn: bool,
    collect: bool,
    retain_outputs: bool,
}

impl Flags {
    fn diff_relevant(&self) -> bool {
        self.backward || self.learn || self.collect
    }
}

#[derive(Copy, Clone, Debug)]
struct ResolvedFeedback {
    holder: usize,
    producer: usize,
    output: usize,
}

/// Everything derived from the structure at reshape time.
struct Plan {
    order: Vec<usize>,
    inputs: Vec<Vec<Input>>,
    input_descs: Vec<Vec<BlobDesc>>,
    output_descs: Vec<Vec<BlobDesc>>,
    consumers: Vec<Vec<Vec<(usize, usize)>>>,
    external_consumers: Vec<Vec<(usize, usize)>>,
    feedback: Vec<ResolvedFeedback>,
    holder_of: Vec<Option<usize>>,
    flags: Vec<Flags>,
    retain_externals: Vec<bool>,
}

/// A named collection of layers wired into a directed graph.
///
/// Any structural change marks the graph dirty. The next run reshapes it:
/// the execution order is recomputed with insertion order breaking ties,
/// every layer validates its inputs and outputs are reallocated where their
/// descriptors changed.
pub struct Graph {
    nodes: Vec<Node>,
    layers: Vec<Box<dyn Layer>>,
    feedbacks: Vec<Feedback>,
    externals: Vec<External>,
    engine: Rc<dyn MathEngine>,
    plan: Option<Rc<Plan>>,
    phase: Phase,
    step: usize,
    training: bool,
    learning: bool,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// An empty graph computing on [`CpuMathEngine`].
    pub fn new() -> Self {
        Self::with_engine(Rc::new(CpuMathEngine))
    }

    pub fn with_engine(engine: Rc<dyn MathEngine>) -> Self {
        Self {
            nodes: Vec::new(),
            layers: Vec::new(),
            feedbacks: Vec::new(),
            externals: Vec::new(),
            engine,
            plan: None,
            phase: Phase::Idle,
            step: 0,
            training: false,
            learning: true,
        }
    }

    pub fn engine(&self) -> &dyn MathEngine {
        &*self.engine
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn has_layer(&self, name: &str) -> bool {
        self.nodes.iter().any(|node| node.name == name)
    }

    /// Layer names in insertion order.
    pub fn layer_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.name.as_str()).collect()
    }

    pub fn add_layer(&mut self, name: impl Into<String>, layer: impl Layer) -> Result<()> {
        self.add_boxed_layer(name, Box::new(layer))
    }

    pub fn add_boxed_layer(
        &mut self,
        name: impl Into<String>,
        layer: Box<dyn Layer>,
    ) -> Result<()> {
        let name = name.into();
        if self.has_layer(&name) {
            return Err(Error::DuplicateName(name));
        }
        log::trace!("adding {} layer `{}`", layer.kind(), name);
        self.nodes.push(Node::new(name));
        self.layers.push(layer);
        self.invalidate();
        Ok(())
    }

    /// Removes a layer, disconnecting every link and feedback edge that
    /// refers to it.
    pub fn delete_layer(&mut self, name: &str) -> Result<Box<dyn Layer>> {
        let id = self.index_of(name)?;
        self.nodes.remove(id);
        let layer = self.layers.remove(id);
        for node in &mut self.nodes {
            for link in &mut node.inputs {
                if matches!(link, Some(Link::Layer { name: producer, .. }) if producer == name) {
                    *link = None;
                }
            }
        }
        self.feedbacks
            .retain(|feedback| feedback.holder != name && feedback.producer != name);
        self.invalidate();
        Ok(layer)
    }

    pub fn layer<T: Layer>(&self, name: &str) -> Result<&T> {
        let id = self.index_of(name)?;
        self.layers[id]
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| wrong_kind::<T>(name))
    }

    /// Typed access for setters. Marks the graph dirty.
    pub fn layer_mut<T: Layer>(&mut self, name: &str) -> Result<&mut T> {
        let id = self.index_of(name)?;
        self.invalidate();
        self.layers[id]
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| wrong_kind::<T>(name))
    }

    pub fn layer_dyn(&self, name: &str) -> Result<&dyn Layer> {
        let id = self.index_of(name)?;
        Ok(&*self.layers[id])
    }

    pub fn connect(
        &mut self,
        consumer: &str,
        input: usize,
        producer: &str,
        output: usize,
    ) -> Result<()> {
        self.index_of(producer)?;
        let link = Link::Layer {
            name: producer.to_owned(),
            output,
        };
        self.set_link(consumer, input, Some(link))
    }

    pub fn connect_external(&mut self, consumer: &str, input: usize, index: usize) -> Result<()> {
        self.set_link(consumer, input, Some(Link::External(index)))
    }

    pub fn disconnect(&mut self, consumer: &str, input: usize) -> Result<()> {
        self.set_link(consumer, input, None)
    }

    /// Adds a feedback edge: from the second step of a sequence on, `holder`
    /// receives what `producer` emitted on `output` in the previous step.
    /// Feedback edges take no part in the execution order.
    pub fn connect_feedback(&mut self, holder: &str, producer: &str, output: usize) -> Result<()> {
        let id = self.index_of(holder)?;
        self.index_of(producer)?;
        if !self.layers[id].accepts_feedback() {
            return Err(Error::Configuration(format!(
                "{} layer `{}` cannot hold a feedback edge",
                self.layers[id].kind(),
                holder
            )));
        }
        self.feedbacks.retain(|feedback| feedback.holder != holder);
        self.feedbacks.push(Feedback {
            holder: holder.to_owned(),
            producer: producer.to_owned(),
            output,
            held: None,
            pending: None,
            outgoing: None,
        });
        self.invalidate();
        Ok(())
    }

    fn set_link(&mut self, consumer: &str, input: usize, link: Option<Link>) -> Result<()> {
        let id = self.index_of(consumer)?;
        let arity = self.layers[id].input_count();
        if link.is_some() && input >= *arity.end() {
            return Err(Error::Configuration(format!(
                "`{}` accepts at most {} inputs, cannot connect input {}",
                consumer,
                arity.end(),
                input
            )));
        }
        let inputs = &mut self.nodes[id].inputs;
        if inputs.len() <= input {
            inputs.resize(input + 1, None);
        }
        inputs[input] = link;
        self.invalidate();
        Ok(())
    }

    /// Binds external input `index`. Rebinding a blob of the same shape
    /// keeps the graph clean.
    pub fn set_external(&mut self, index: usize, blob: Blob) {
        if self.externals.len() <= index {
            self.externals.resize_with(index + 1, External::default);
        }
        let external = &mut self.externals[index];
        let reshaped = external.blob.as_ref().map(Blob::desc) != Some(blob.desc());
        external.blob = Some(blob);
        if reshaped {
            self.invalidate();
        }
    }

    pub(crate) fn external_mut(&mut self, index: usize) -> Option<&mut Blob> {
        self.externals.get_mut(index).and_then(|external| external.blob.as_mut())
    }

    pub(crate) fn external_desc(&self, index: usize) -> Option<BlobDesc> {
        self.externals
            .get(index)
            .and_then(|external| external.blob.as_ref())
            .map(Blob::desc)
    }

    pub fn set_external_requires_diff(&mut self, index: usize, requires_diff: bool) {
        if self.externals.len() <= index {
            self.externals.resize_with(index + 1, External::default);
        }
        if self.externals[index].requires_diff != requires_diff {
            self.externals[index].requires_diff = requires_diff;
            self.invalidate();
        }
    }

    /// Gradient of external input `index` from the last backward step.
    pub fn external_diff(&self, index: usize) -> Option<&Blob> {
        self.externals.get(index).and_then(|external| external.diff.as_ref())
    }

    pub fn set_source_blob(&mut self, name: &str, blob: Blob) -> Result<()> {
        self.layer_mut::<Source>(name)?.set_blob(blob);
        Ok(())
    }

    /// Seeds the gradient of a layer output for the following backward
    /// passes. The seed is added to whatever consumers propagate.
    pub fn set_output_diff(&mut self, name: &str, output: usize, diff: Blob) -> Result<()> {
        let id = self.index_of(name)?;
        let node = &mut self.nodes[id];
        let desc = node
            .outputs
            .get(output)
            .map(Blob::desc)
            .ok_or_else(|| Error::State(format!("`{}` has no output {} yet", name, output)))?;
        if desc != diff.desc() {
            return Err(Error::Configuration(format!(
                "gradient {} does not match output {} of `{}` shaped {}",
                diff.desc(),
                output,
                name,
                desc
            )));
        }
        if node.seeded_diffs.len() <= output {
            node.seeded_diffs.resize(output + 1, None);
        }
        node.seeded_diffs[output] = Some(diff);
        Ok(())
    }

    /// Sets the gradient a sink feeds back to its producer. Unlike
    /// [`Graph::layer_mut`] this keeps the last forward pass valid.
    pub fn set_sink_diff(&mut self, name: &str, diff: Option<Blob>) -> Result<()> {
        let id = self.index_of(name)?;
        let received = self
            .plan
            .as_ref()
            .and_then(|plan| plan.input_descs[id].first().copied());
        if let (Some(diff), Some(desc)) = (&diff, received) {
            if diff.desc() != desc {
                return Err(Error::Configuration(format!(
                    "gradient {} does not match the input {} of `{}`",
                    diff.desc(),
                    desc,
                    name
                )));
            }
        }
        self.layers[id]
            .as_any_mut()
            .downcast_mut::<Sink>()
            .ok_or_else(|| wrong_kind::<Sink>(name))?
            .set_diff(diff);
        Ok(())
    }

    pub fn clear_output_diffs(&mut self) {
        for node in &mut self.nodes {
            node.seeded_diffs.clear();
        }
    }

    /// Training mode: backward passes may follow and dropout is active.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn enable_learning(&mut self) {
        self.set_learning(true);
    }

    pub fn disable_learning(&mut self) {
        self.set_learning(false);
    }

    fn set_learning(&mut self, learning: bool) {
        if self.learning != learning {
            self.learning = learning;
            self.invalidate();
        }
    }

    pub fn is_learning_enabled(&self) -> bool {
        self.learning
    }

    /// Freezes or unfreezes the parameters of one layer.
    pub fn set_layer_learning(&mut self, name: &str, learning: bool) -> Result<()> {
        let id = self.index_of(name)?;
        self.nodes[id].learning = learning;
        self.invalidate();
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.plan.is_none()
    }

    pub fn invalidate(&mut self) {
        self.plan = None;
        self.phase = Phase::Idle;
    }

    pub fn force_reshape(&mut self) -> Result<()> {
        self.invalidate();
        self.reshape()
    }

    /// Layer names in execution order.
    pub fn execution_order(&mut self) -> Result<Vec<&str>> {
        self.reshape()?;
        let plan = self.current_plan()?;
        Ok(plan
            .order
            .iter()
            .map(|&id| self.nodes[id].name.as_str())
            .collect())
    }

    pub(crate) fn has_learnable_layers(&self) -> bool {
        self.layers.iter().any(|layer| layer.is_learnable())
    }

    /// Rebuilds the execution plan when the graph is dirty. On failure the
    /// graph stays dirty.
    pub fn reshape(&mut self) -> Result<()> {
        if self.plan.is_some() {
            return Ok(());
        }
        self.phase = Phase::Idle;
        let plan = self.build_plan()?;
        for (node, descs) in self.nodes.iter_mut().zip(&plan.output_descs) {
            fit(&mut node.outputs, descs);
        }
        log::debug!(
            "reshaped graph of {} layers: {}",
            self.nodes.len(),
            plan.order.iter().map(|&id| &self.nodes[id].name).join(" -> ")
        );
        self.plan = Some(Rc::new(plan));
        Ok(())
    }

    fn build_plan(&mut self) -> Result<Plan> {
        let count = self.nodes.len();
        let index: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(id, node)| (node.name.as_str(), id))
            .collect();
        let lookup = |name: &str| {
            index
                .get(name)
                .copied()
                .ok_or_else(|| Error::LayerNotFound(name.to_owned()))
        };

        let mut inputs = Vec::with_capacity(count);
        for (id, node) in self.nodes.iter().enumerate() {
            let connected = node
                .inputs
                .iter()
                .rposition(Option::is_some)
                .map_or(0, |last| last + 1);
            let arity = self.layers[id].input_count();
            if !arity.contains(&connected) {
                return Err(Error::architecture(format!(
                    "expects {} inputs, {} connected",
                    describe_arity(&arity),
                    connected
                ))
                .in_layer(&node.name));
            }
            let mut resolved = Vec::with_capacity(connected);
            for (slot, link) in node.inputs[..connected].iter().enumerate() {
                let input = match link {
                    Some(Link::Layer { name, output }) => Input::Layer {
                        node: lookup(name)?,
                        output: *output,
                    },
                    Some(Link::External(k)) => Input::External(*k),
                    None => {
                        return Err(Error::architecture(format!("input {} is not connected", slot))
                            .in_layer(&node.name))
                    }
                };
                resolved.push(input);
            }
            inputs.push(resolved);
        }

        let mut holder_of = vec![None; count];
        let mut feedback = Vec::with_capacity(self.feedbacks.len());
        for (f, edge) in self.feedbacks.iter().enumerate() {
            let resolved = ResolvedFeedback {
                holder: lookup(&edge.holder)?,
                producer: lookup(&edge.producer)?,
                output: edge.output,
            };
            holder_of[resolved.holder] = Some(f);
            feedback.push(resolved);
        }

        let order = topological_order(&inputs).map_err(|stuck| {
            Error::Architecture {
                layer: self.nodes[stuck[0]].name.clone(),
                message: format!(
                    "cycle without a feedback edge through {}",
                    stuck.iter().map(|&id| &self.nodes[id].name).join(", ")
                ),
            }
        })?;

        let mut input_descs = vec![Vec::new(); count];
        let mut output_descs: Vec<Vec<BlobDesc>> = vec![Vec::new(); count];
        for &id in &order {
            let name = &self.nodes[id].name;
            let descs = inputs[id]
                .iter()
                .map(|input| match *input {
                    Input::Layer { node, output } => {
                        output_descs[node].get(output).copied().ok_or_else(|| {
                            Error::architecture(format!(
                                "`{}` has {} outputs, output {} is connected",
                                self.nodes[node].name,
                                output_descs[node].len(),
                                output
                            ))
                        })
                    }
                    Input::External(k) => self
                        .externals
                        .get(k)
                        .and_then(|external| external.blob.as_ref())
                        .map(Blob::desc)
                        .ok_or_else(|| {
                            Error::architecture(format!("external input {} is not bound", k))
                        }),
                })
                .collect::<Result<Vec<_>>>()
                .map_err(|e| e.in_layer(name))?;
            let produced = self.layers[id]
                .reshape(&descs)
                .map_err(|e| e.in_layer(name))?;
            log::trace!("`{}`: {:?} -> {:?}", name, descs, produced);
            input_descs[id] = descs;
            output_descs[id] = produced;
        }

        for edge in &feedback {
            let holder = &self.nodes[edge.holder].name;
            let produced = output_descs[edge.producer].get(edge.output).copied().ok_or_else(|| {
                Error::architecture(format!(
                    "feedback producer `{}` has no output {}",
                    self.nodes[edge.producer].name, edge.output
                ))
                .in_layer(holder)
            })?;
            let held = output_descs[edge.holder].first().copied();
            if held != Some(produced) {
                return Err(Error::architecture(format!(
                    "feedback from `{}` is shaped {}, the holder produces {:?}",
                    self.nodes[edge.producer].name, produced, held
                ))
                .in_layer(holder));
            }
        }

        let mut consumers: Vec<Vec<Vec<(usize, usize)>>> = output_descs
            .iter()
            .map(|descs| vec![Vec::new(); descs.len()])
            .collect();
        let mut external_consumers = vec![Vec::new(); self.externals.len()];
        for (id, resolved) in inputs.iter().enumerate() {
            for (slot, input) in resolved.iter().enumerate() {
                match *input {
                    Input::Layer { node, output } => consumers[node][output].push((id, slot)),
                    Input::External(k) => external_consumers[k].push((id, slot)),
                }
            }
        }

        let mut flags: Vec<Flags> = (0..count)
            .map(|id| {
                let layer = &self.layers[id];
                Flags {
                    learn: self.learning && self.nodes[id].learning && layer.is_learnable(),
                    collect: layer.collects_output_diff(),
                    ..Flags::default()
                }
            })
            .collect();
        loop {
            let mut changed = false;
            for id in 0..count {
                if flags[id].backward {
                    continue;
                }
                let from_inputs = inputs[id].iter().any(|input| match *input {
                    Input::Layer { node, .. } => flags[node].diff_relevant(),
                    Input::External(k) => self.externals[k].requires_diff,
                });
                let from_feedback = holder_of[id]
                    .map_or(false, |f: usize| flags[feedback[f].producer].diff_relevant());
                if from_inputs || from_feedback {
                    flags[id].backward = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut retain_externals = vec![false; self.externals.len()];
        for id in 0..count {
            if !(flags[id].backward || flags[id].learn) {
                continue;
            }
            let needs = self.layers[id].blobs_for_backward();
            if needs.outputs {
                flags[id].retain_outputs = true;
            }
            if needs.inputs {
                for input in &inputs[id] {
                    match *input {
                        Input::Layer { node, .. } => flags[node].retain_outputs = true,
                        Input::External(k) => retain_externals[k] = true,
                    }
                }
            }
        }

        Ok(Plan {
            order,
            inputs,
            input_descs,
            output_descs,
            consumers,
            external_consumers,
            feedback,
            holder_of,
            flags,
            retain_externals,
        })
    }

    fn current_plan(&self) -> Result<Rc<Plan>> {
        self.plan
            .as_ref()
            .map(Rc::clone)
            .ok_or_else(|| Error::State("the graph was modified since it was last reshaped".into()))
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.nodes
            .iter()
            .position(|node| node.name == name)
            .ok_or_else(|| Error::LayerNotFound(name.to_owned()))
    }

    /// Forward pass over the whole graph as a single step.
    pub fn run_once(&mut self) -> Result<()> {
        let engine = Rc::clone(&self.engine);
        self.begin_sequence();
        self.forward_step(&*engine, self.training)
    }

    /// Backward pass after [`Graph::run_once`] in training mode. Parameter
    /// gradients accumulate when learning is enabled.
    pub fn run_backward_once(&mut self) -> Result<()> {
        let engine = Rc::clone(&self.engine);
        self.begin_backward();
        self.backward_step(&*engine, true, self.learning)
    }

    /// A training forward pass followed by the backward pass.
    pub fn run_and_backward_once(&mut self) -> Result<()> {
        let engine = Rc::clone(&self.engine);
        self.begin_sequence();
        self.forward_step(&*engine, true)?;
        self.begin_backward();
        self.backward_step(&*engine, true, self.learning)
    }

    pub fn run_and_learn_once(&mut self, solver: &mut dyn Solver) -> Result<()> {
        self.run_and_backward_once()?;
        self.apply_solver(solver)
    }

    /// Updates every unfrozen parameter with its accumulated gradient.
    pub fn apply_solver(&mut self, solver: &mut dyn Solver) -> Result<()> {
        if !self.learning {
            return Ok(());
        }
        let mut params = self.parameters();
        solver.train(&mut params)
    }

    pub(crate) fn parameters(&mut self) -> Vec<Param<'_>> {
        self.layers
            .iter_mut()
            .zip(&self.nodes)
            .filter(|(_, node)| node.learning)
            .flat_map(|(layer, _)| layer.parameters())
            .collect()
    }

    pub(crate) fn begin_sequence(&mut self) {
        self.step = 0;
        for feedback in &mut self.feedbacks {
            feedback.held = None;
        }
    }

    pub(crate) fn forward_step(&mut self, engine: &dyn MathEngine, training: bool) -> Result<()> {
        self.reshape()?;
        let plan = self.current_plan()?;
        let first_step = self.step == 0;
        for &id in &plan.order {
            let mut outputs = std::mem::take(&mut self.nodes[id].outputs);
            let mut scratch = std::mem::take(&mut self.nodes[id].scratch);
            let result = {
                let inputs = gather(&self.nodes, &self.externals, &plan.inputs[id]);
                let feedback = match plan.holder_of[id] {
                    Some(f) if !first_step => self.feedbacks[f].held.as_ref(),
                    _ => None,
                };
                self.layers[id].run_once(RunContext {
                    inputs: &inputs,
                    outputs: &mut outputs,
                    scratch: &mut scratch,
                    engine,
                    training,
                    first_step,
                    feedback,
                })
            };
            let node = &mut self.nodes[id];
            node.outputs = outputs;
            node.scratch = scratch;
            result.map_err(|e| e.in_layer(&node.name))?;
        }
        for (f, edge) in plan.feedback.iter().enumerate() {
            self.feedbacks[f].held = Some(self.nodes[edge.producer].outputs[edge.output].clone());
        }
        self.step += 1;
        self.phase = Phase::Forwarded { training };
        Ok(())
    }

    pub(crate) fn begin_backward(&mut self) {
        for feedback in &mut self.feedbacks {
            feedback.pending = None;
        }
    }

    /// Walks the execution order backwards once. Layers whose outputs carry
    /// no gradient of interest are skipped.
    pub(crate) fn backward_step(
        &mut self,
        engine: &dyn MathEngine,
        first_step: bool,
        learn: bool,
    ) -> Result<()> {
        let plan = match self.phase {
            Phase::Forwarded { training: true } => self.current_plan()?,
            Phase::Forwarded { training: false } => {
                return Err(Error::State(
                    "the last forward pass ran without training mode".into(),
                ))
            }
            _ => {
                return Err(Error::State(
                    "backward needs a forward pass over the current structure".into(),
                ))
            }
        };

        for &id in plan.order.iter().rev() {
            let flags = plan.flags[id];
            let learn_now = learn && flags.learn;
            if !(flags.backward || learn_now || flags.collect) {
                continue;
            }

            let mut output_diffs = std::mem::take(&mut self.nodes[id].output_diffs);
            fit(&mut output_diffs, &plan.output_descs[id]);
            for (output, diff) in output_diffs.iter_mut().enumerate() {
                engine.fill(diff, 0.);
                if let Some(Some(seed)) = self.nodes[id].seeded_diffs.get(output) {
                    engine.add_in_place(diff, seed);
                }
                for &(consumer, slot) in &plan.consumers[id][output] {
                    if plan.flags[consumer].backward {
                        engine.add_in_place(diff, &self.nodes[consumer].input_diffs[slot]);
                    }
                }
                for (f, edge) in plan.feedback.iter().enumerate() {
                    if edge.producer != id || edge.output != output {
                        continue;
                    }
                    if let Some(pending) = &self.feedbacks[f].pending {
                        engine.add_in_place(diff, pending);
                    }
                }
            }

            let mut result = Ok(());
            if flags.backward {
                let mut input_diffs = std::mem::take(&mut self.nodes[id].input_diffs);
                fit(&mut input_diffs, &plan.input_descs[id]);
                for diff in input_diffs.iter_mut() {
                    engine.fill(diff, 0.);
                }
                result = if self.layers[id].supports_backward() {
                    let holder = plan.holder_of[id].filter(|_| !first_step);
                    let mut outgoing = holder.map(|f| {
                        let desc = plan.output_descs[id][0];
                        let mut diff = self.feedbacks[f]
                            .outgoing
                            .take()
                            .filter(|diff| diff.desc() == desc)
                            .unwrap_or_else(|| Blob::zeros(desc));
                        engine.fill(&mut diff, 0.);
                        diff
                    });
                    let result = {
                        let inputs = gather(&self.nodes, &self.externals, &plan.inputs[id]);
                        let node = &self.nodes[id];
                        self.layers[id].backward_once(BackwardContext {
                            inputs: &inputs,
                            outputs: &node.outputs,
                            scratch: &node.scratch,
                            output_diffs: &output_diffs,
                            input_diffs: &mut input_diffs,
                            engine,
                            first_step,
                            learning: learn_now,
                            feedback_diff: outgoing.as_mut(),
                        })
                    };
                    if let Some(f) = holder {
                        self.feedbacks[f].outgoing = outgoing;
                    }
                    result
                } else {
                    Err(Error::architecture(format!(
                        "{} layer does not support backward",
                        self.layers[id].kind()
                    )))
                };
                self.nodes[id].input_diffs = input_diffs;
            }

            if result.is_ok() && learn_now {
                let inputs = gather(&self.nodes, &self.externals, &plan.inputs[id]);
                let node = &self.nodes[id];
                result = self.layers[id].learn_once(LearnContext {
                    inputs: &inputs,
                    outputs: &node.outputs,
                    scratch: &node.scratch,
                    output_diffs: &output_diffs,
                    engine,
                });
            }

            let node = &mut self.nodes[id];
            node.output_diffs = output_diffs;
            result.map_err(|e| e.in_layer(&node.name))?;
        }

        for (f, edge) in plan.feedback.iter().enumerate() {
            let routed = !first_step && plan.flags[edge.holder].backward;
            let feedback = &mut self.feedbacks[f];
            feedback.pending = if routed { feedback.outgoing.take() } else { None };
        }

        for (k, consumers) in plan.external_consumers.iter().enumerate() {
            let external = &self.externals[k];
            let desc = match (&external.blob, external.requires_diff) {
                (Some(blob), true) => blob.desc(),
                _ => continue,
            };
            let mut diff = self.externals[k]
                .diff
                .take()
                .filter(|diff| diff.desc() == desc)
                .unwrap_or_else(|| Blob::zeros(desc));
            engine.fill(&mut diff, 0.);
            for &(consumer, slot) in consumers {
                if plan.flags[consumer].backward {
                    engine.add_in_place(&mut diff, &self.nodes[consumer].input_diffs[slot]);
                }
            }
            self.externals[k].diff = Some(diff);
        }

        self.phase = Phase::Backwarded;
        Ok(())
    }

    /// Appends the blobs the backward pass of the current step reads.
    pub(crate) fn save_step(&self, record: &mut Vec<Blob>) -> Result<()> {
        let plan = self.current_plan()?;
        for (id, node) in self.nodes.iter().enumerate() {
            if plan.flags[id].retain_outputs {
                record.extend(node.outputs.iter().cloned());
            }
            record.extend(node.scratch.iter().cloned());
        }
        for (k, external) in self.externals.iter().enumerate() {
            if plan.retain_externals.get(k).copied().unwrap_or(false) {
                record.extend(external.blob.iter().cloned());
            }
        }
        Ok(())
    }

    /// Restores a record written by [`Graph::save_step`].
    pub(crate) fn load_step(&mut self, record: &[Blob]) -> Result<()> {
        let plan = self.current_plan()?;
        let mut blobs = record.iter();
        let mut next = || {
            blobs
                .next()
                .cloned()
                .ok_or_else(|| Error::State("step record is shorter than the graph".into()))
        };
        for (id, node) in self.nodes.iter_mut().enumerate() {
            if plan.flags[id].retain_outputs {
                for output in node.outputs.iter_mut() {
                    *output = next()?;
                }
            }
            for blob in node.scratch.iter_mut() {
                *blob = next()?;
            }
        }
        for (k, external) in self.externals.iter_mut().enumerate() {
            if !plan.retain_externals.get(k).copied().unwrap_or(false) {
                continue;
            }
            if let Some(blob) = external.blob.as_mut() {
                *blob = next()?;
            }
        }
        self.phase = Phase::Forwarded { training: true };
        Ok(())
    }

    fn check_forwarded(&self) -> Result<()> {
        match self.phase {
            Phase::Forwarded { .. } | Phase::Backwarded => Ok(()),
            Phase::Idle => Err(Error::State(
                "blobs are available after a forward pass".into(),
            )),
        }
    }

    pub fn output(&self, name: &str, output: usize) -> Result<&Blob> {
        self.check_forwarded()?;
        let id = self.index_of(name)?;
        self.nodes[id].outputs.get(output).ok_or_else(|| {
            Error::architecture(format!("no output {}", output)).in_layer(name)
        })
    }

    pub(crate) fn output_desc(&self, name: &str, output: usize) -> Result<BlobDesc> {
        let plan = self.current_plan()?;
        let id = self.index_of(name)?;
        plan.output_descs[id].get(output).copied().ok_or_else(|| {
            Error::architecture(format!("no output {}", output)).in_layer(name)
        })
    }

    /// Gradient of a layer output from the last backward pass.
    pub fn output_diff(&self, name: &str, output: usize) -> Result<&Blob> {
        if self.phase != Phase::Backwarded {
            return Err(Error::State("gradients are available after a backward pass".into()));
        }
        let id = self.index_of(name)?;
        self.nodes[id].output_diffs.get(output).ok_or_else(|| {
            Error::State(format!("no gradient was computed for output {} of `{}`", output, name))
        })
    }

    /// Blob a layer received on `input` in the last forward pass.
    pub fn input_blob(&self, name: &str, input: usize) -> Result<&Blob> {
        self.check_forwarded()?;
        let plan = self.current_plan()?;
        let id = self.index_of(name)?;
        let resolved = plan.inputs[id].get(input).ok_or_else(|| {
            Error::architecture(format!("input {} is not connected", input)).in_layer(name)
        })?;
        match *resolved {
            Input::Layer { node, output } => Ok(&self.nodes[node].outputs[output]),
            Input::External(k) => self.externals[k]
                .blob
                .as_ref()
                .ok_or_else(|| Error::State(format!("external input {} is not bound", k))),
        }
    }

    /// What a sink received in the last forward pass.
    pub fn sink_blob(&self, name: &str) -> Result<&Blob> {
        self.input_blob(name, 0)
    }

    pub fn to_record(&self) -> Result<GraphRecord> {
        let layers = self
            .nodes
            .iter()
            .zip(&self.layers)
            .map(|(node, layer)| {
                Ok(LayerRecord {
                    kind: layer.kind().to_owned(),
                    name: node.name.clone(),
                    version: layer.version(),
                    inputs: node.inputs.clone(),
                    learning: node.learning,
                    body: layer.save().map_err(|e| e.in_layer(&node.name))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let feedbacks = self
            .feedbacks
            .iter()
            .map(|feedback| FeedbackRecord {
                holder: feedback.holder.clone(),
                producer: feedback.producer.clone(),
                output: feedback.output,
            })
            .collect();
        Ok(GraphRecord {
            version: ARCHIVE_VERSION,
            layers,
            feedbacks,
        })
    }

    pub fn from_record(record: GraphRecord, registry: &LayerRegistry) -> Result<Self> {
        check_graph_version(record.version)?;
        let mut graph = Self::new();
        for layer in record.layers {
            let built = registry
                .create(&layer.kind, layer.version, layer.body)
                .map_err(|e| e.in_layer(&layer.name))?;
            graph.add_boxed_layer(layer.name, built)?;
            if let Some(node) = graph.nodes.last_mut() {
                node.inputs = layer.inputs;
                node.learning = layer.learning;
            }
        }
        for feedback in record.feedbacks {
            graph.connect_feedback(&feedback.holder, &feedback.producer, feedback.output)?;
        }
        log::debug!(
            "loaded graph of {} layers written with version {}",
            graph.len(),
            record.version
        );
        Ok(graph)
    }

    /// Serializes structure, configuration and parameters to JSON.
    pub fn save(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_record()?)?)
    }

    pub fn load(json: &str, registry: &LayerRegistry) -> Result<Self> {
        Self::from_record(serde_json::from_str(json)?, registry)
    }
}

fn wrong_kind<T>(name: &str) -> Error {
    Error::Configuration(format!(
        "layer `{}` is not a {}",
        name,
        std::any::type_name::<T>()
    ))
}

fn describe_arity(arity: &std::ops::RangeInclusive<usize>) -> String {
    match (*arity.start(), *arity.end()) {
        (min, max) if min == max => min.to_string(),
        (min, usize::MAX) => format!("at least {}", min),
        (min, max) => format!("{} to {}", min, max),
    }
}

/// Kahn's algorithm over layer links, always releasing the ready layer that
/// was inserted first. On a cycle, returns the layers left unordered.
fn topological_order(inputs: &[Vec<Input>]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let count = inputs.len();
    let mut indegree = vec![0_usize; count];
    let mut successors = vec![Vec::new(); count];
    for (id, resolved) in inputs.iter().enumerate() {
        for input in resolved {
            if let Input::Layer { node, .. } = *input {
                indegree[id] += 1;
                successors[node].push(id);
            }
        }
    }
    let mut ready: BTreeSet<usize> = (0..count).filter(|&id| indegree[id] == 0).collect();
    let mut order = Vec::with_capacity(count);
    while let Some(id) = ready.pop_first() {
        order.push(id);
        for &next in &successors[id] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.insert(next);
            }
        }
    }
    if order.len() == count {
        Ok(order)
    } else {
        Err((0..count).filter(|&id| indegree[id] > 0).collect())
    }
}

fn gather<'a>(nodes: &'a [Node], externals: &'a [External], inputs: &[Input]) -> Vec<&'a Blob> {
    inputs
        .iter()
        .map(|input| match *input {
            Input::Layer { node, output } => &nodes[node].outputs[output],
            Input::External(k) => externals[k]
                .blob
                .as_ref()
                .expect("external inputs are bound before reshape succeeds"),
        })
        .collect()
}

/// Resizes `blobs` to `descs`, reallocating only the blobs whose descriptor
/// changed.
fn fit(blobs: &mut Vec<Blob>, descs: &[BlobDesc]) {
    blobs.truncate(descs.len());
    for (blob, desc) in blobs.iter_mut().zip(descs) {
        if blob.desc() != *desc {
            *blob = Blob::zeros(*desc);
        }
    }
    let kept = blobs.len();
    blobs.extend(descs[kept..].iter().map(|&desc| Blob::zeros(desc)));
}
