// rnn_cell — One step of a recurrent cell
//
// Input (batch, n_in) with no time axis, output (batch, n_out). The cell's
// parameters live under `rec/` of the layer. `prev_state` names a layer
// whose last hidden state feeds the step, split into the cell's parts;
// without it the step starts from the zero state. The resulting state is
// the layer's last hidden state, [c, h] for LSTMs.

use serde::Deserialize;
use tracing::debug;

use wren_core::{DType, Dim, Error, Result, Tensor, TensorDescriptor};

use super::cell::{Cell, CellKind, Unit};
use crate::concat::{concat_sources_with_dropout, concat_template};
use crate::layer::{
    default_output, feature_dim, last_hidden_state, HiddenState, Layer, LayerBase, LayerClass, LayerSpec,
    RecurrentState,
};
use crate::network::Network;

fn default_unit() -> String {
    "lstm".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RnnCellOpts {
    #[serde(default = "default_unit")]
    unit: String,
    #[serde(default)]
    prev_state: Option<String>,
}

impl RnnCellOpts {
    fn unit(&self, layer: &str) -> Result<Unit> {
        let unit = Unit::from_name(&self.unit, true)?;
        if unit.kind() != CellKind::Step {
            return Err(Error::unsupported(
                layer,
                format!("rnn_cell needs a step cell, '{}' is a {} cell", unit.name(), unit.kind()),
            ));
        }
        Ok(unit)
    }
}

/// The input must be a single frame, (batch, feature).
fn check_frame(layer: &str, data: &TensorDescriptor) -> Result<usize> {
    if data.sparse || data.time_axis.is_some() || data.batch_axis.is_none() || data.ndim() != 1 {
        return Err(Error::unsupported(
            layer,
            format!("rnn_cell needs dense (batch, feature) input, got {}", data.description()),
        ));
    }
    feature_dim(layer, data)
}

/// `rnn_cell`.
pub struct RnnCellClass;

impl LayerClass for RnnCellClass {
    fn kind(&self) -> &'static str {
        "rnn_cell"
    }

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let opts: RnnCellOpts = spec.options()?;
        opts.unit(&spec.name)?;
        spec.require_sources()?;
        let data = concat_template(&spec.name, &spec.sources)?;
        check_frame(&spec.name, &data)?;
        let n_out = default_output(spec)?
            .dim
            .ok_or_else(|| Error::missing_shape(&spec.name, "n_out"))?;
        let dtype = if data.dtype.is_float() { data.dtype } else { DType::F32 };
        Ok(TensorDescriptor::new(
            format!("{}_output", spec.name),
            vec![Dim::Static(n_out)],
            Some(n_out),
            false,
            dtype,
        ))
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let opts: RnnCellOpts = spec.options()?;
        let unit = opts.unit(&spec.name)?;
        let n_out = output.dim.ok_or_else(|| Error::missing_shape(&spec.name, "n_out"))?;
        let input = concat_sources_with_dropout(net, &spec.name, &spec.sources, spec.desc.dropout)?;
        let n_in = check_frame(&spec.name, &input)?;
        let x = input.placeholder()?.clone();

        let prev = match &opts.prev_state {
            Some(name) => {
                let src = net.get_layer(name)?;
                let state = last_hidden_state(src.as_ref()).ok_or_else(|| {
                    Error::unsupported(&spec.name, format!("prev_state layer '{name}' has no hidden state"))
                })?;
                let width = unit.state_parts() * n_out;
                if state.dim != width {
                    return Err(Error::shape_mismatch(
                        &spec.name,
                        format!("prev_state of width {width}"),
                        format!("width {}", state.dim),
                    ));
                }
                Some(state)
            }
            None => None,
        };

        let mut base = LayerBase::new(self.kind(), spec, output);
        let cell = Cell::new(net, &mut base, unit, "rec/", Some(n_in), n_out);
        let state = match &prev {
            Some(prev) => (0..unit.state_parts())
                .map(|j| prev.tensor.narrow(1, j * n_out, n_out))
                .collect(),
            None => cell.zero_state(&x),
        };
        let (y, next) = cell.step(&x, &state);
        let tensor = Tensor::cat(&next, 1)
            .ok_or_else(|| Error::msg(format!("rnn_cell layer '{}' carries no state", base.name)))?;
        debug!(layer = %base.name, unit = unit.name(), n_out, "cell step built");

        base.output.placeholder = Some(y);
        Ok(Box::new(RnnCellLayer {
            base,
            unit,
            state: HiddenState {
                tensor,
                dim: cell.state_size(),
            },
        }))
    }
}

/// A built `rnn_cell` layer.
pub struct RnnCellLayer {
    base: LayerBase,
    unit: Unit,
    state: HiddenState,
}

impl RnnCellLayer {
    pub fn unit(&self) -> Unit {
        self.unit
    }
}

impl RecurrentState for RnnCellLayer {
    fn last_hidden_state(&self) -> Option<HiddenState> {
        Some(self.state.clone())
    }
}

impl Layer for RnnCellLayer {
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
