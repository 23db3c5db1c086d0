use std::{any::Any, ops::RangeInclusive};

use cortex_core::{
    check_architecture, ActivationKind, Blob, BlobDesc, BlobDim, CpuMathEngine, Error, MathEngine,
    Result,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    archive::{decode, plain, Decoder},
    layer::{BackwardContext, Layer, LearnContext, Param, RunContext},
    layers::{
        dropout::check_rate, Activation, BackLink, Dropout, EltwiseMul, EltwiseSum, FullyConnected,
        Recurrent, Split,
    },
    registry::LayerRegistry,
};

#[cfg(test)]
mod test;

const INPUT_DROPOUT: &str = "InputDropout";
const RECUR_DROPOUT: &str = "RecurDropout";
const MAIN_BACK_LINK: &str = "MainBackLink";
const STATE_BACK_LINK: &str = "StateBackLink";
const INPUT_HIDDEN: &str = "InputHidden";
const RECUR_HIDDEN: &str = "RecurHidden";
const HIDDEN_SUM: &str = "HiddenSum";
const GATES: &str = "Gates";
const MAIN_TANH: &str = "MainTanh";
const FORGET_ACTIVATION: &str = "ForgetActivation";
const INPUT_ACTIVATION: &str = "InputActivation";
const RESET_ACTIVATION: &str = "ResetActivation";
const INPUT_GATE: &str = "InputGate";
const FORGET_GATE: &str = "ForgetGate";
const NEW_STATE: &str = "NewState";
const OUTPUT_TANH: &str = "OutputTanh";
const RESET_GATE: &str = "ResetGate";

/// Regions of the combined projection, in channel order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LstmGate {
    Main,
    Forget,
    Input,
    Reset,
}

impl LstmGate {
    pub const COUNT: usize = 4;
    pub const ALL: [LstmGate; LstmGate::COUNT] = [
        LstmGate::Main,
        LstmGate::Forget,
        LstmGate::Input,
        LstmGate::Reset,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    fn activation_layer(self) -> &'static str {
        match self {
            LstmGate::Main => MAIN_TANH,
            LstmGate::Forget => FORGET_ACTIVATION,
            LstmGate::Input => INPUT_ACTIVATION,
            LstmGate::Reset => RESET_ACTIVATION,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct LstmRecord {
    hidden_size: usize,
    dropout_rate: f32,
    recurrent_activation: ActivationKind,
    compatibility: bool,
    reverse: bool,
    input_weights: Option<Blob>,
    input_free_term: Option<Blob>,
    recur_weights: Option<Blob>,
    recur_free_term: Option<Blob>,
}

/// Layout written before the input and the recurrent projections were
/// separated: one projection of the concatenated data and previous output.
#[derive(Deserialize)]
struct LegacyLstmRecord {
    hidden_size: usize,
    #[serde(default)]
    dropout_rate: f32,
    recurrent_activation: ActivationKind,
    #[serde(default)]
    compatibility: bool,
    #[serde(default)]
    reverse: bool,
    weights: Option<Blob>,
    free_term: Option<Blob>,
}

fn upgrade_legacy(body: Value, _: &LayerRegistry) -> Result<LstmRecord> {
    let legacy: LegacyLstmRecord = serde_json::from_value(body)?;
    log::warn!(
        "splitting the combined projection of a legacy LSTM record with {} hidden units",
        legacy.hidden_size
    );
    let hidden_size = legacy.hidden_size;
    let (input_weights, recur_weights) = match legacy.weights {
        Some(weights) => {
            let desc = weights.desc();
            if desc.batch_width() != LstmGate::COUNT * hidden_size
                || desc.object_size() != desc.channels()
                || desc.channels() <= hidden_size
            {
                return Err(Error::Configuration(format!(
                    "legacy LSTM weights {} do not fit {} hidden units",
                    desc, hidden_size
                )));
            }
            let mut parts = [
                Blob::zeros(desc.with(BlobDim::Channels, desc.channels() - hidden_size)),
                Blob::zeros(desc.with(BlobDim::Channels, hidden_size)),
            ];
            CpuMathEngine.split_by_dim(BlobDim::Channels, &weights, &mut parts);
            let [input, recur] = parts;
            (Some(input), Some(recur))
        }
        None => (None, None),
    };
    // The combined projection added its free term once.
    let recur_free_term = legacy
        .free_term
        .as_ref()
        .map(|free_term| Blob::zeros(free_term.desc()));
    Ok(LstmRecord {
        hidden_size,
        dropout_rate: legacy.dropout_rate,
        recurrent_activation: legacy.recurrent_activation,
        compatibility: legacy.compatibility,
        reverse: legacy.reverse,
        input_weights,
        input_free_term: legacy.free_term,
        recur_weights,
        recur_free_term,
    })
}

/// Long short-term memory cell over a sequence.
///
/// Inputs are the data sequence and, optionally, the initial state and the
/// initial output, both single steps of `hidden_size` channels. Outputs are
/// the output sequence and the state sequence.
///
/// The cell is a [`Recurrent`] composite built from primitive layers. The
/// hidden size, the recurrent activation and switching dropout on or off
/// rebuild it; weights and nonzero dropout rates are set on the existing
/// layers.
pub struct Lstm {
    cell: Recurrent,
    hidden_size: usize,
    dropout_rate: f32,
    activation: ActivationKind,
    compatibility: bool,
    seed: Option<u64>,
}

impl Lstm {
    pub const KIND: &'static str = "Lstm";
    const VERSION: u32 = 2001;
    const DECODERS: &'static [Decoder<LstmRecord>] = &[
        Decoder {
            min_version: 1000,
            max_version: 2000,
            decode: upgrade_legacy,
        },
        Decoder {
            min_version: 2001,
            max_version: 2001,
            decode: plain::<LstmRecord>,
        },
    ];

    pub fn new(hidden_size: usize) -> Result<Self> {
        Self::with_config(hidden_size, None)
    }

    /// Makes the initial weights and the dropout masks reproducible.
    pub fn with_seed(hidden_size: usize, seed: u64) -> Result<Self> {
        Self::with_config(hidden_size, Some(seed))
    }

    fn with_config(hidden_size: usize, seed: Option<u64>) -> Result<Self> {
        check_hidden_size(hidden_size)?;
        let mut lstm = Self {
            cell: Recurrent::new(),
            hidden_size,
            dropout_rate: 0.,
            activation: ActivationKind::Sigmoid,
            compatibility: false,
            seed,
        };
        let (input_hidden, recur_hidden) = (lstm.projection(0)?, lstm.projection(1)?);
        lstm.build(input_hidden, recur_hidden)?;
        Ok(lstm)
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Rebuilds the cell with freshly initialized projections.
    pub fn set_hidden_size(&mut self, hidden_size: usize) -> Result<()> {
        check_hidden_size(hidden_size)?;
        if hidden_size != self.hidden_size {
            self.hidden_size = hidden_size;
            let (input_hidden, recur_hidden) = (self.projection(0)?, self.projection(1)?);
            self.build(input_hidden, recur_hidden)?;
        }
        Ok(())
    }

    pub fn dropout_rate(&self) -> f32 {
        self.dropout_rate
    }

    pub fn set_dropout_rate(&mut self, rate: f32) -> Result<()> {
        check_rate(rate)?;
        let rebuild = (rate > 0.) != (self.dropout_rate > 0.);
        self.dropout_rate = rate;
        if rebuild {
            let (input_hidden, recur_hidden) = self.projections()?;
            self.build(input_hidden, recur_hidden)?;
        } else if rate > 0. {
            let graph = self.cell.graph_mut();
            graph.layer_mut::<Dropout>(INPUT_DROPOUT)?.set_rate(rate)?;
            graph.layer_mut::<Dropout>(RECUR_DROPOUT)?.set_rate(rate)?;
        }
        Ok(())
    }

    pub fn recurrent_activation(&self) -> ActivationKind {
        self.activation
    }

    /// Activation of the forget, input and reset gates.
    pub fn set_recurrent_activation(&mut self, activation: ActivationKind) -> Result<()> {
        if activation != self.activation {
            self.activation = activation;
            let (input_hidden, recur_hidden) = self.projections()?;
            self.build(input_hidden, recur_hidden)?;
        }
        Ok(())
    }

    pub fn is_in_compatibility_mode(&self) -> bool {
        self.compatibility
    }

    /// In compatibility mode the first output is `tanh(state)`, without the
    /// reset gate.
    pub fn set_compatibility_mode(&mut self, compatibility: bool) -> Result<()> {
        if compatibility != self.compatibility {
            self.compatibility = compatibility;
            let output = self.main_output();
            self.cell.set_output_mapping(0, output, 0)?;
        }
        Ok(())
    }

    pub fn is_reverse_sequence(&self) -> bool {
        self.cell.is_reverse_sequence()
    }

    pub fn set_reverse_sequence(&mut self, reverse: bool) {
        self.cell.set_reverse_sequence(reverse);
    }

    /// The internal composite, `MainBackLink` and `StateBackLink` holding
    /// the previous output and state.
    pub fn cell(&self) -> &Recurrent {
        &self.cell
    }

    pub fn input_weights(&self) -> Option<&Blob> {
        self.projection_layer(INPUT_HIDDEN).and_then(FullyConnected::weights)
    }

    /// Weights of the data projection, `4 × hidden_size` rows ordered as
    /// [`LstmGate::ALL`].
    pub fn set_input_weights(&mut self, weights: Option<Blob>) -> Result<()> {
        self.projection_layer_mut(INPUT_HIDDEN)?.set_weights(weights)
    }

    pub fn input_free_term(&self) -> Option<&Blob> {
        self.projection_layer(INPUT_HIDDEN).and_then(FullyConnected::free_term)
    }

    pub fn set_input_free_term(&mut self, free_term: Option<Blob>) -> Result<()> {
        self.projection_layer_mut(INPUT_HIDDEN)?.set_free_term(free_term)
    }

    pub fn recur_weights(&self) -> Option<&Blob> {
        self.projection_layer(RECUR_HIDDEN).and_then(FullyConnected::weights)
    }

    pub fn set_recur_weights(&mut self, weights: Option<Blob>) -> Result<()> {
        self.projection_layer_mut(RECUR_HIDDEN)?.set_weights(weights)
    }

    pub fn recur_free_term(&self) -> Option<&Blob> {
        self.projection_layer(RECUR_HIDDEN).and_then(FullyConnected::free_term)
    }

    pub fn set_recur_free_term(&mut self, free_term: Option<Blob>) -> Result<()> {
        self.projection_layer_mut(RECUR_HIDDEN)?.set_free_term(free_term)
    }

    pub(crate) fn load(
        version: u32,
        body: Value,
        registry: &LayerRegistry,
    ) -> Result<Box<dyn Layer>> {
        let record = decode(Self::KIND, version, body, registry, Self::DECODERS)?;
        check_hidden_size(record.hidden_size)?;
        check_rate(record.dropout_rate)?;
        let mut lstm = Self {
            cell: Recurrent::new(),
            hidden_size: record.hidden_size,
            dropout_rate: record.dropout_rate,
            activation: record.recurrent_activation,
            compatibility: record.compatibility,
            seed: None,
        };
        lstm.cell.set_reverse_sequence(record.reverse);
        let mut input_hidden = lstm.projection(0)?;
        input_hidden.set_weights(record.input_weights)?;
        input_hidden.set_free_term(record.input_free_term)?;
        let mut recur_hidden = lstm.projection(1)?;
        recur_hidden.set_weights(record.recur_weights)?;
        recur_hidden.set_free_term(record.recur_free_term)?;
        lstm.build(input_hidden, recur_hidden)?;
        Ok(Box::new(lstm))
    }

    fn main_output(&self) -> &'static str {
        if self.compatibility {
            OUTPUT_TANH
        } else {
            RESET_GATE
        }
    }

    fn seeded(&self, offset: u64) -> Option<u64> {
        self.seed.map(|seed| seed.wrapping_add(offset))
    }

    fn projection(&self, offset: u64) -> Result<FullyConnected> {
        let layer = FullyConnected::new(LstmGate::COUNT * self.hidden_size)?;
        Ok(match self.seeded(offset) {
            Some(seed) => layer.with_seed(seed),
            None => layer,
        })
    }

    fn dropout(&self, offset: u64) -> Result<Dropout> {
        let layer = Dropout::new(self.dropout_rate)?;
        Ok(match self.seeded(offset) {
            Some(seed) => layer.with_seed(seed),
            None => layer,
        })
    }

    /// Current projections, carried over a rebuild.
    fn projections(&self) -> Result<(FullyConnected, FullyConnected)> {
        let graph = self.cell.graph();
        Ok((
            graph.layer::<FullyConnected>(INPUT_HIDDEN)?.clone(),
            graph.layer::<FullyConnected>(RECUR_HIDDEN)?.clone(),
        ))
    }

    fn projection_layer(&self, name: &str) -> Option<&FullyConnected> {
        self.cell.graph().layer::<FullyConnected>(name).ok()
    }

    fn projection_layer_mut(&mut self, name: &str) -> Result<&mut FullyConnected> {
        self.cell.graph_mut().layer_mut::<FullyConnected>(name)
    }

    /// Replaces the whole cell by a fresh one wired for the current
    /// configuration.
    fn build(&mut self, input_hidden: FullyConnected, recur_hidden: FullyConnected) -> Result<()> {
        let hidden_size = self.hidden_size;
        let mut cell = Recurrent::new();
        cell.set_reverse_sequence(self.cell.is_reverse_sequence());
        let graph = cell.graph_mut();

        graph.add_layer(MAIN_BACK_LINK, BackLink::new(hidden_size))?;
        graph.add_layer(STATE_BACK_LINK, BackLink::new(hidden_size))?;
        graph.add_layer(INPUT_HIDDEN, input_hidden)?;
        graph.add_layer(RECUR_HIDDEN, recur_hidden)?;
        let data = if self.dropout_rate > 0. {
            graph.add_layer(INPUT_DROPOUT, self.dropout(2)?)?;
            graph.add_layer(RECUR_DROPOUT, self.dropout(3)?)?;
            graph.connect(INPUT_HIDDEN, 0, INPUT_DROPOUT, 0)?;
            graph.connect(RECUR_DROPOUT, 0, MAIN_BACK_LINK, 0)?;
            graph.connect(RECUR_HIDDEN, 0, RECUR_DROPOUT, 0)?;
            INPUT_DROPOUT
        } else {
            graph.connect(RECUR_HIDDEN, 0, MAIN_BACK_LINK, 0)?;
            INPUT_HIDDEN
        };

        graph.add_layer(HIDDEN_SUM, EltwiseSum::new())?;
        graph.connect(HIDDEN_SUM, 0, INPUT_HIDDEN, 0)?;
        graph.connect(HIDDEN_SUM, 1, RECUR_HIDDEN, 0)?;

        let regions = vec![hidden_size; LstmGate::COUNT - 1];
        graph.add_layer(GATES, Split::channels(regions)?)?;
        graph.connect(GATES, 0, HIDDEN_SUM, 0)?;
        for gate in LstmGate::ALL {
            let activation = match gate {
                LstmGate::Main => ActivationKind::Tanh,
                _ => self.activation,
            };
            graph.add_layer(gate.activation_layer(), Activation::new(activation))?;
            graph.connect(gate.activation_layer(), 0, GATES, gate.index())?;
        }

        graph.add_layer(INPUT_GATE, EltwiseMul::new())?;
        graph.connect(INPUT_GATE, 0, INPUT_ACTIVATION, 0)?;
        graph.connect(INPUT_GATE, 1, MAIN_TANH, 0)?;

        graph.add_layer(FORGET_GATE, EltwiseMul::new())?;
        graph.connect(FORGET_GATE, 0, FORGET_ACTIVATION, 0)?;
        graph.connect(FORGET_GATE, 1, STATE_BACK_LINK, 0)?;

        graph.add_layer(NEW_STATE, EltwiseSum::new())?;
        graph.connect(NEW_STATE, 0, INPUT_GATE, 0)?;
        graph.connect(NEW_STATE, 1, FORGET_GATE, 0)?;

        graph.add_layer(OUTPUT_TANH, Activation::new(ActivationKind::Tanh))?;
        graph.connect(OUTPUT_TANH, 0, NEW_STATE, 0)?;

        graph.add_layer(RESET_GATE, EltwiseMul::new())?;
        graph.connect(RESET_GATE, 0, RESET_ACTIVATION, 0)?;
        graph.connect(RESET_GATE, 1, OUTPUT_TANH, 0)?;

        graph.connect_feedback(MAIN_BACK_LINK, RESET_GATE, 0)?;
        graph.connect_feedback(STATE_BACK_LINK, NEW_STATE, 0)?;

        cell.set_input_mapping(0, data, 0)?;
        cell.set_input_mapping(1, STATE_BACK_LINK, 0)?;
        cell.set_input_mapping(2, MAIN_BACK_LINK, 0)?;
        cell.set_output_mapping(0, self.main_output(), 0)?;
        cell.set_output_mapping(1, NEW_STATE, 0)?;

        log::debug!(
            "built LSTM cell: {} hidden units, {:?} gates, dropout {}",
            hidden_size,
            self.activation,
            self.dropout_rate
        );
        self.cell = cell;
        Ok(())
    }
}

fn check_hidden_size(hidden_size: usize) -> Result<()> {
    if hidden_size == 0 {
        return Err(Error::Configuration(
            "an LSTM needs at least one hidden unit".into(),
        ));
    }
    Ok(())
}

impl Layer for Lstm {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn version(&self) -> u32 {
        Self::VERSION
    }

    fn input_count(&self) -> RangeInclusive<usize> {
        1..=3
    }

    fn reshape(&mut self, inputs: &[BlobDesc]) -> Result<Vec<BlobDesc>> {
        let data = inputs[0];
        check_architecture!(
            data.list_size() == 1,
            "LSTM data {} must have a list size of 1",
            data
        );
        for state in &inputs[1..] {
            check_architecture!(
                state.batch_length() == 1 && state.list_size() == 1,
                "initial state {} must be a single step with a list size of 1",
                state
            );
            check_architecture!(
                state.batch_width() == data.batch_width(),
                "initial state {} does not match the batch width of data {}",
                state,
                data
            );
            check_architecture!(
                state.object_size() == self.hidden_size,
                "initial state {} must hold {} elements per object",
                state,
                self.hidden_size
            );
        }
        self.cell.reshape(inputs)
    }

    fn run_once(&mut self, ctx: RunContext<'_>) -> Result<()> {
        self.cell.run_once(ctx)
    }

    fn backward_once(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        self.cell.backward_once(ctx)
    }

    fn learn_once(&mut self, ctx: LearnContext<'_>) -> Result<()> {
        self.cell.learn_once(ctx)
    }

    fn is_learnable(&self) -> bool {
        true
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        self.cell.parameters()
    }

    fn save(&self) -> Result<Value> {
        Ok(serde_json::to_value(LstmRecord {
            hidden_size: self.hidden_size,
            dropout_rate: self.dropout_rate,
            recurrent_activation: self.activation,
            compatibility: self.compatibility,
            reverse: self.cell.is_reverse_sequence(),
            input_weights: self.input_weights().cloned(),
            input_free_term: self.input_free_term().cloned(),
            recur_weights: self.recur_weights().cloned(),
            recur_free_term: self.recur_free_term().cloned(),
        })?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
