// rec — Recurrent layer over the time axis
//
// Runs a cell over the concatenated sources, laid out time-major. The
// output is (time, batch, n_out), time-major, with the input's sequence
// lengths (or the ones derived from an end label, see `unroll`).
//
//   direction  1     forward
//   direction -1     backward: each example's valid prefix is reversed,
//                    run forward and reversed back
//   bidirectional    a forward cell (`fw/`) and a backward cell (`bw/`) of
//                    n_out / 2 each; outputs and states concatenated
//
// `unit: "lstm"` picks `nativelstm`, or `lstmblock` when attention or
// output feedback is requested. Only step cells can run those, and neither
// combines with bidirectional.
//
// STATE:
//
//   The last hidden state of the layer is the final carried state of every
//   cell, [c, h] for LSTMs, so its width is `state_parts * n_hidden` per
//   direction. `initial_state` names layers whose last hidden states are
//   concatenated and split the same way.

mod cell;
mod cell_layer;
mod unroll;

pub use cell::{Cell, CellKind, Unit};
pub use cell_layer::{RnnCellClass, RnnCellLayer};
pub use unroll::{step_input_dim, Attention, Feedback, LoopOutput, StepLoop};

use serde::Deserialize;
use tracing::debug;

use wren_core::{DType, Dim, Error, Result, Tensor, TensorDescriptor};

use crate::concat::{concat_sources_with_dropout, concat_template};
use crate::layer::{
    default_output, feature_dim, last_hidden_state, HiddenState, Layer, LayerBase, LayerClass, LayerSpec,
    RecurrentState,
};
use crate::network::Network;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LayerNames {
    One(String),
    Many(Vec<String>),
}

impl LayerNames {
    fn names(&self) -> Vec<&str> {
        match self {
            LayerNames::One(name) => vec![name.as_str()],
            LayerNames::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// `true`, `false` or an options record.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Toggle<T> {
    Flag(bool),
    Opts(T),
}

impl<T: Default> Toggle<T> {
    fn enabled(self) -> Option<T> {
        match self {
            Toggle::Flag(true) => Some(T::default()),
            Toggle::Flag(false) => None,
            Toggle::Opts(opts) => Some(opts),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AttentionOpts {}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FeedbackOpts {
    #[serde(default)]
    end_label: Option<usize>,
}

fn default_unit() -> String {
    "lstm".to_string()
}

fn default_direction() -> i8 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecOpts {
    #[serde(default = "default_unit")]
    unit: String,
    #[serde(default)]
    bidirectional: bool,
    #[serde(default = "default_direction")]
    direction: i8,
    #[serde(default = "default_true")]
    input_projection: bool,
    #[serde(default)]
    initial_state: Option<LayerNames>,
    #[serde(default)]
    attention: Option<Toggle<AttentionOpts>>,
    #[serde(default)]
    output_feedback: Option<Toggle<FeedbackOpts>>,
    #[serde(default)]
    max_seq_len: Option<usize>,
}

/// The validated choice of cell, direction and extras.
#[derive(Debug, Clone, PartialEq)]
struct Plan {
    unit: Unit,
    bidirectional: bool,
    backward: bool,
    attention: bool,
    feedback: Option<Feedback>,
}

impl Plan {
    fn needs_step(&self) -> bool {
        self.attention || self.feedback.is_some()
    }

    /// (parameter prefix, runs backward) per cell.
    fn directions(&self) -> Vec<(&'static str, bool)> {
        if self.bidirectional {
            vec![("fw/", false), ("bw/", true)]
        } else {
            vec![("", self.backward)]
        }
    }
}

impl RecOpts {
    fn plan(&self, layer: &str) -> Result<Plan> {
        if self.direction != 1 && self.direction != -1 {
            return Err(Error::invalid_option(
                layer,
                "direction",
                format!("expected 1 or -1, got {}", self.direction),
            ));
        }
        if self.bidirectional && self.direction != 1 {
            return Err(Error::invalid_option(layer, "direction", "cannot be set together with bidirectional"));
        }
        let attention = self.attention.clone().and_then(Toggle::enabled).is_some();
        let feedback = self
            .output_feedback
            .clone()
            .and_then(Toggle::enabled)
            .map(|f| Feedback { end_label: f.end_label });
        let needs_step = attention || feedback.is_some();
        if needs_step && self.bidirectional {
            return Err(Error::unsupported(layer, "attention and output_feedback cannot be bidirectional"));
        }
        let unit = Unit::from_name(&self.unit, needs_step)?;
        if needs_step && unit.kind() != CellKind::Step {
            return Err(Error::unsupported(
                layer,
                format!(
                    "attention and output_feedback need a step cell, '{}' is a {} cell",
                    unit.name(),
                    unit.kind()
                ),
            ));
        }
        if needs_step && !self.input_projection {
            return Err(Error::unsupported(layer, "attention and output_feedback need input_projection"));
        }
        Ok(Plan {
            unit,
            bidirectional: self.bidirectional,
            backward: self.direction == -1,
            attention,
            feedback,
        })
    }
}

/// The input must be (batch, time, feature) in some order.
fn check_input(layer: &str, data: &TensorDescriptor) -> Result<usize> {
    if data.sparse {
        return Err(Error::unsupported(layer, format!("rec needs dense input, got {}", data.description())));
    }
    if data.time_axis.is_none() || data.batch_axis.is_none() || data.ndim() != 2 {
        return Err(Error::unsupported(
            layer,
            format!("rec needs (batch, time, feature) input, got {}", data.description()),
        ));
    }
    feature_dim(layer, data)
}

fn rec_output(name: String, n_out: usize, dtype: DType) -> TensorDescriptor {
    TensorDescriptor::new(name, vec![Dim::Dynamic, Dim::Static(n_out)], Some(n_out), false, dtype)
        .copy_as_time_major()
}

/// Concatenated last hidden states of the `initial_state` layers.
fn initial_state(net: &mut Network, layer: &str, names: &LayerNames) -> Result<HiddenState> {
    let mut states = Vec::new();
    for name in names.names() {
        let src = net.get_layer(name)?;
        let state = last_hidden_state(src.as_ref()).ok_or_else(|| {
            Error::unsupported(layer, format!("initial_state layer '{name}' has no hidden state"))
        })?;
        states.push(state);
    }
    HiddenState::concat(states).ok_or_else(|| Error::invalid_option(layer, "initial_state", "names no layer"))
}

/// `rec`.
pub struct RecClass;

impl LayerClass for RecClass {
    fn kind(&self) -> &'static str {
        "rec"
    }

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let opts: RecOpts = spec.options()?;
        let plan = opts.plan(&spec.name)?;
        spec.require_sources()?;
        let data = concat_template(&spec.name, &spec.sources)?;
        check_input(&spec.name, &data)?;
        let n_out = default_output(spec)?
            .dim
            .ok_or_else(|| Error::missing_shape(&spec.name, "n_out"))?;
        if plan.bidirectional && n_out % 2 != 0 {
            return Err(Error::invalid_option(
                &spec.name,
                "n_out",
                format!("must be even for a bidirectional layer, got {n_out}"),
            ));
        }
        if let Some(end) = plan.feedback.and_then(|f| f.end_label) {
            if end >= n_out {
                return Err(Error::invalid_option(
                    &spec.name,
                    "output_feedback",
                    format!("end_label {end} is not below n_out {n_out}"),
                ));
            }
        }
        let dtype = if data.dtype.is_float() { data.dtype } else { DType::F32 };
        Ok(rec_output(format!("{}_output", spec.name), n_out, dtype))
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let opts: RecOpts = spec.options()?;
        let plan = opts.plan(&spec.name)?;
        let n_out = output.dim.ok_or_else(|| Error::missing_shape(&spec.name, "n_out"))?;
        let input = concat_sources_with_dropout(net, &spec.name, &spec.sources, spec.desc.dropout)?
            .copy_as_time_major();
        let n_in = check_input(&spec.name, &input)?;
        let mut x = input.placeholder()?.clone();
        let mut lengths = input.lengths()?.clone();
        let initial = match &opts.initial_state {
            Some(names) => Some(initial_state(net, &spec.name, names)?),
            None => None,
        };

        let directions = plan.directions();
        let n_hidden = n_out / directions.len();
        let state_size = plan.unit.state_parts() * n_hidden;
        if let Some(state) = &initial {
            if state.dim != directions.len() * state_size {
                return Err(Error::shape_mismatch(
                    &spec.name,
                    format!("initial state of width {}", directions.len() * state_size),
                    format!("width {}", state.dim),
                ));
            }
        }
        let cell_in = step_input_dim(n_in, n_hidden, plan.attention, plan.feedback.is_some());
        if !opts.input_projection && cell_in != plan.unit.gates() * n_hidden {
            return Err(Error::shape_mismatch(
                &spec.name,
                format!("input width {} without input_projection", plan.unit.gates() * n_hidden),
                format!("width {cell_in}"),
            ));
        }
        if plan.needs_step() {
            let cap = opts
                .max_seq_len
                .or(net.max_seq_len())
                .or_else(|| net.resolver().sequence_length_hint(&input.name));
            if let Some(max) = cap {
                x = x.slice(0, None, Some(max), 1);
                lengths = lengths.minimum_scalar(max as f64);
            }
        }

        let mut base = LayerBase::new(self.kind(), spec, output);
        base.recurrent = true;
        let mut ys = Vec::new();
        let mut final_states = Vec::new();
        let mut out_lengths = None;
        for (k, (prefix, backward)) in directions.into_iter().enumerate() {
            let cell = Cell::new(
                net,
                &mut base,
                plan.unit,
                prefix,
                opts.input_projection.then_some(cell_in),
                n_hidden,
            );
            let attention = plan
                .attention
                .then(|| Attention::new(net, &mut base, prefix, n_hidden, n_in));
            let init = match &initial {
                Some(state) => (0..plan.unit.state_parts())
                    .map(|j| {
                        let offset = k * state_size + j * n_hidden;
                        state.tensor.narrow(1, offset, n_hidden)
                    })
                    .collect(),
                None => cell.zero_state(&x),
            };
            let xin = if backward { x.reverse_sequence(&lengths, 0, 1) } else { x.clone() };
            let out = if plan.needs_step() {
                StepLoop::new(&cell)
                    .with_attention(attention.as_ref())
                    .with_feedback(plan.feedback)
                    .run(&xin, &lengths, &init)
            } else {
                cell.run(&xin, &lengths, &init)
            };
            let y = if backward {
                out.y.reverse_sequence(&out.lengths, 0, 1)
            } else {
                out.y
            };
            ys.push(y);
            final_states.extend(out.final_state);
            out_lengths.get_or_insert(out.lengths);
        }

        let name = base.name.clone();
        let missing = || Error::msg(format!("rec layer '{name}' ran no cell"));
        let y = Tensor::cat(&ys, 2).ok_or_else(missing)?;
        let state = Tensor::cat(&final_states, 1).ok_or_else(missing)?;
        let out_lengths = out_lengths.ok_or_else(missing)?;
        debug!(layer = %base.name, unit = plan.unit.name(), n_hidden, "recurrent cells built");

        base.output.placeholder = Some(y.clone());
        base.output.dynamic_lengths.insert(0, out_lengths);
        Ok(Box::new(RecLayer {
            base,
            unit: plan.unit,
            hidden: y,
            state: HiddenState {
                tensor: state,
                dim: final_states.len() * n_hidden,
            },
        }))
    }
}

/// A built `rec` layer.
pub struct RecLayer {
    base: LayerBase,
    unit: Unit,
    hidden: Tensor,
    state: HiddenState,
}

impl RecLayer {
    pub fn unit(&self) -> Unit {
        self.unit
    }
}

impl RecurrentState for RecLayer {
    fn hidden_state(&self) -> Option<&Tensor> {
        Some(&self.hidden)
    }

    fn last_hidden_state(&self) -> Option<HiddenState> {
        Some(self.state.clone())
    }
}

impl Layer for RecLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn as_recurrent(&self) -> Option<&dyn RecurrentState> {
        Some(self)
    }
}
