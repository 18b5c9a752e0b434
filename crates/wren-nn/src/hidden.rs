// get_last_hidden_state — the terminal recurrent state as a (batch, n_out) layer
//
// Each source contributes its last hidden state (its own, or the ones of
// its sources, see `layer::last_hidden_state`). A source without any state
// is an error. Several states are concatenated, or added when
// `combine: "add"`; the result must have width `n_out`.
//
// The layer is itself a state carrier, so it can feed `initial_state` of a
// recurrent layer.

use serde::Deserialize;

use wren_core::{Dim, Error, Result, Tensor, TensorDescriptor};

use crate::layer::{last_hidden_state, HiddenState, Layer, LayerBase, LayerClass, LayerSpec, RecurrentState};
use crate::network::Network;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StateCombine {
    #[default]
    Concat,
    Add,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HiddenStateOpts {
    #[serde(default)]
    combine: StateCombine,
}

/// (batch, n) with no time axis.
fn state_descriptor(name: String, n: usize) -> TensorDescriptor {
    let mut out = TensorDescriptor::dense(name, vec![Dim::Static(n)]);
    out.time_axis = None;
    out
}

/// `get_last_hidden_state`.
pub struct GetLastHiddenStateClass;

impl LayerClass for GetLastHiddenStateClass {
    fn kind(&self) -> &'static str {
        "get_last_hidden_state"
    }

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let _: HiddenStateOpts = spec.options()?;
        spec.require_sources()?;
        spec.forbid("out_type", spec.desc.out_type.is_some())?;
        let n_out = spec.desc.n_out.ok_or_else(|| Error::missing_shape(&spec.name, "n_out"))?;
        Ok(state_descriptor(format!("{}_output", spec.name), n_out))
    }

    fn build(&self, _net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let opts: HiddenStateOpts = spec.options()?;
        let mut states = Vec::with_capacity(spec.sources.len());
        for src in &spec.sources {
            let state = last_hidden_state(src.as_ref()).ok_or_else(|| {
                Error::unsupported(&spec.name, format!("source '{}' has no hidden state", src.base().name))
            })?;
            states.push(state);
        }
        let state = match (opts.combine, states.len()) {
            (_, 1) => states.pop(),
            (StateCombine::Concat, _) => HiddenState::concat(states),
            (StateCombine::Add, _) => {
                let dim = states[0].dim;
                if let Some(other) = states.iter().find(|s| s.dim != dim) {
                    return Err(Error::shape_mismatch(
                        &spec.name,
                        format!("hidden states of width {dim}"),
                        format!("width {}", other.dim),
                    ));
                }
                let tensors: Vec<Tensor> = states.into_iter().map(|s| s.tensor).collect();
                Tensor::add_n(&tensors).map(|tensor| HiddenState { tensor, dim })
            }
        };
        let state = state.ok_or_else(|| Error::invalid_option(&spec.name, "from", "needs at least one source"))?;
        let n_out = output.dim.unwrap_or_default();
        if state.dim != n_out {
            return Err(Error::shape_mismatch(
                &spec.name,
                format!("n_out {n_out}"),
                format!("hidden state of width {}", state.dim),
            ));
        }
        let mut base = LayerBase::new(self.kind(), spec, output);
        base.output.placeholder = Some(state.tensor.clone());
        Ok(Box::new(HiddenStateLayer { base, state }))
    }
}

/// A layer whose output is a hidden state.
pub struct HiddenStateLayer {
    base: LayerBase,
    state: HiddenState,
}

impl RecurrentState for HiddenStateLayer {
    fn last_hidden_state(&self) -> Option<HiddenState> {
        Some(self.state.clone())
    }
}

impl Layer for HiddenStateLayer {
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
