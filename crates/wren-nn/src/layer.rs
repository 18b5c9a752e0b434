// Layer protocol — How every layer class is inferred, built and queried
//
// Building a layer is a two-phase contract, implemented by each
// LayerClass:
//
//   1. infer_output(net, spec) -> TensorDescriptor
//        Pure shape inference from the options and the sources'
//        descriptors. No tensor handle is needed, so the shape of a layer
//        can be known before anything is recorded.
//
//   2. build(net, spec, output) -> Box<dyn Layer>
//        Records the ops, attaches the placeholder (and the per-example
//        lengths) to `output` and returns the finished layer.
//
// The Network drives both phases. It resolves sources first, so `spec`
// always carries fully built sources; it then applies the universal
// post-processing (batch norm) and checks the result.
//
// BUILT LAYERS:
//
//   A built layer is shared as `LayerRef = Rc<dyn Layer>`. All layers carry
//   a LayerBase (name, sources, output, params, loss, ...). Classes with
//   extra state (recurrent, subnetwork) wrap it in their own struct and
//   override the optional hooks of the Layer trait.
//
// RECURRENT STATE:
//
//   Only layers that actually carry a recurrent state implement
//   RecurrentState. For every other layer `last_hidden_state` walks the
//   declared sources instead.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use wren_core::{format_shape, DType, Dim, Error, Init, Op, Result, Tensor, TensorDescriptor};

use crate::activation::Activation;
use crate::description::LayerDescription;
use crate::loss::Loss;
use crate::network::Network;

/// A built layer, shared by all its consumers.
pub type LayerRef = Rc<dyn Layer>;

/// A value before and after an activation function.
#[derive(Debug, Clone)]
pub struct OutputWithActivation {
    pub x: Tensor,
    pub y: Tensor,
    pub activation: Option<Activation>,
}

impl OutputWithActivation {
    /// Apply `activation` (if any) to `x`.
    pub fn new(x: Tensor, activation: Option<Activation>) -> Self {
        let y = match &activation {
            Some(act) => act.apply(&x),
            None => x.clone(),
        };
        OutputWithActivation { x, y, activation }
    }

    pub fn is_softmax(&self) -> bool {
        self.activation.as_ref().is_some_and(Activation::is_softmax)
    }

    /// Unnormalized log-probabilities, if the activation makes them available.
    pub fn logits(&self) -> Option<&Tensor> {
        match &self.activation {
            Some(act) if act.is_softmax() => Some(&self.x),
            Some(act) if act.is_log_softmax() => Some(&self.y),
            _ => None,
        }
    }
}

/// The terminal state of a recurrent computation, shape (batch, dim).
#[derive(Debug, Clone, PartialEq)]
pub struct HiddenState {
    pub tensor: Tensor,
    pub dim: usize,
}

impl HiddenState {
    /// Concatenate along the feature axis.
    pub fn concat(states: Vec<HiddenState>) -> Option<HiddenState> {
        let dim = states.iter().map(|s| s.dim).sum();
        let tensors: Vec<Tensor> = states.into_iter().map(|s| s.tensor).collect();
        Tensor::cat(&tensors, 1).map(|tensor| HiddenState { tensor, dim })
    }
}

/// Implemented by layers that carry a recurrent state.
pub trait RecurrentState {
    /// Per-frame hidden states, shape (time, batch, dim), if exposed.
    fn hidden_state(&self) -> Option<&Tensor> {
        None
    }

    /// The state after the last frame of every example.
    fn last_hidden_state(&self) -> Option<HiddenState>;
}

/// Scalars a layer contributes to the training objective.
#[derive(Debug, Clone, Default)]
pub struct LayerObjective {
    pub loss: Option<Tensor>,
    pub error: Option<Tensor>,
    pub constraints: Option<Tensor>,
}

/// Fields shared by every built layer.
pub struct LayerBase {
    pub name: String,
    pub kind: &'static str,
    pub sources: Vec<LayerRef>,
    pub output: TensorDescriptor,
    pub output_before_activation: Option<OutputWithActivation>,
    /// Keyed by local name ("W", "b", ...).
    pub params: BTreeMap<String, Tensor>,
    pub target: Option<String>,
    pub target_data: Option<TensorDescriptor>,
    pub loss: Option<Box<dyn Loss>>,
    is_output_layer: Option<bool>,
    pub l2: Option<f64>,
    pub spatial_smoothing: f64,
    pub trainable: bool,
    /// Must not be shuffled along time.
    pub recurrent: bool,
    /// Monitoring scalars.
    pub stats: BTreeMap<String, Tensor>,
}

impl fmt::Debug for LayerBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{class={}, out_type={}}}", self.name, self.kind, self.output)
    }
}

impl LayerBase {
    /// Take over the resolved pieces of `spec` for a layer with `output`.
    pub fn new(kind: &'static str, spec: LayerSpec, output: TensorDescriptor) -> Self {
        let recurrent = spec.loss.as_ref().is_some_and(|l| l.recurrent());
        LayerBase {
            name: spec.name,
            kind,
            sources: spec.sources,
            output,
            output_before_activation: None,
            params: BTreeMap::new(),
            target: spec.target,
            target_data: spec.target_data,
            loss: spec.loss,
            is_output_layer: spec.desc.is_output_layer,
            l2: spec.desc.l2,
            spatial_smoothing: spec.desc.spatial_smoothing,
            trainable: spec.desc.trainable,
            recurrent,
            stats: BTreeMap::new(),
        }
    }

    /// Explicit flag, else: has a target, or is named "output".
    pub fn is_output_layer(&self) -> bool {
        self.is_output_layer
            .unwrap_or_else(|| self.target.is_some() || self.name == "output")
    }

    /// Record a parameter `layer/name` and keep it under `name`.
    pub fn add_param(
        &mut self,
        net: &Network,
        name: &str,
        shape: Vec<usize>,
        init: Init,
        trainable: bool,
    ) -> Tensor {
        let full = format!("{}{}/{}", net.param_prefix(), self.name, name);
        let p = net
            .graph()
            .param(full, shape, init, trainable && self.trainable, DType::F32);
        self.params.insert(name.to_string(), p.clone());
        p
    }

    /// Set the output from a pre-activation value.
    pub fn set_activation_output(&mut self, x: Tensor, activation: Option<Activation>) {
        let owa = OutputWithActivation::new(x, activation);
        self.output.placeholder = Some(owa.y.clone());
        self.output_before_activation = Some(owa);
    }

    /// Regularization terms, absent when none is configured.
    pub fn constraints(&self) -> Result<Option<Tensor>> {
        let mut terms = Vec::new();
        if let Some(l2) = self.l2.filter(|v| *v != 0.0) {
            // 2 * sum(l2_loss(p)) == sum(p^2)
            let norms: Vec<Tensor> = self.params.values().map(|p| p.square().sum_all()).collect();
            if let Some(norm) = Tensor::add_n(&norms) {
                terms.push(norm.mul_scalar(l2));
            }
        }
        if self.spatial_smoothing != 0.0 {
            terms.push(
                self.spatial_smoothing_energy()?
                    .mul_scalar(self.spatial_smoothing),
            );
        }
        Ok(Tensor::add_n(&terms))
    }

    fn spatial_smoothing_energy(&self) -> Result<Tensor> {
        let dim = self
            .output
            .dim
            .ok_or_else(|| Error::missing_shape(&self.name, "dim for spatial_smoothing"))?;
        let lengths = self.output.sequence_lengths().ok_or_else(|| {
            Error::unsupported(&self.name, "spatial_smoothing needs an output with a time axis")
        })?;
        let x = self.output.placeholder()?;
        let energy = x.apply(Op::SpatialSmoothingEnergy { dim }, &[], x.dtype());
        Ok(energy
            .flatten_with_seq_len_mask(lengths, self.output.is_time_major())
            .sum_all())
    }

    /// Loss, error and constraints from the configured loss.
    pub fn default_objective(&self) -> Result<LayerObjective> {
        let mut out = LayerObjective {
            constraints: self.constraints()?,
            ..LayerObjective::default()
        };
        if let Some(loss) = &self.loss {
            let target = self.target_data.as_ref().ok_or_else(|| Error::UnknownTarget {
                layer: self.name.clone(),
                target: self.target.clone().unwrap_or_default(),
            })?;
            let inputs = loss.init(
                &self.name,
                &self.output,
                self.output_before_activation.as_ref(),
                target,
            )?;
            out.loss = Some(loss.value(&inputs)?);
            out.error = Some(loss.error(&inputs)?);
        }
        Ok(out)
    }
}

/// A built layer.
pub trait Layer {
    fn base(&self) -> &LayerBase;

    fn base_mut(&mut self) -> &mut LayerBase;

    /// The recurrent-state capability, for layers that have one.
    fn as_recurrent(&self) -> Option<&dyn RecurrentState> {
        None
    }

    /// Contribution to the network objective.
    fn objective(&self) -> Result<LayerObjective> {
        self.base().default_objective()
    }
}

impl fmt::Debug for dyn Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.base().fmt(f)
    }
}

/// A layer that is nothing but its LayerBase.
#[derive(Debug)]
pub struct PlainLayer {
    base: LayerBase,
}

impl PlainLayer {
    pub fn boxed(base: LayerBase) -> Box<dyn Layer> {
        Box::new(PlainLayer { base })
    }
}

impl Layer for PlainLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }
}

/// The terminal state of `layer`: its own if it has one, else the states of
/// its sources, concatenated. Sources without a state are skipped.
pub fn last_hidden_state(layer: &dyn Layer) -> Option<HiddenState> {
    if let Some(state) = layer.as_recurrent().and_then(|r| r.last_hidden_state()) {
        return Some(state);
    }
    let states: Vec<HiddenState> = layer
        .base()
        .sources
        .iter()
        .filter_map(|s| last_hidden_state(s.as_ref()))
        .collect();
    HiddenState::concat(states)
}

/// Everything resolved for a layer before its class runs.
pub struct LayerSpec {
    pub name: String,
    pub desc: LayerDescription,
    pub sources: Vec<LayerRef>,
    pub loss: Option<Box<dyn Loss>>,
    pub target: Option<String>,
    pub target_data: Option<TensorDescriptor>,
}

impl LayerSpec {
    /// Class-specific options.
    pub fn options<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        self.desc.class_options(&self.name)
    }

    /// Reject options a class does not support.
    pub fn forbid(&self, option: &str, set: bool) -> Result<()> {
        if set {
            return Err(Error::invalid_option(
                &self.name,
                option,
                format!("not supported by class '{}'", self.desc.class),
            ));
        }
        Ok(())
    }

    pub fn require_sources(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::invalid_option(&self.name, "from", "needs at least one source"));
        }
        Ok(())
    }
}

/// Options of classes that take nothing beyond the universal ones.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct NoOptions {}

/// A layer class: shape inference plus construction.
pub trait LayerClass: Sync {
    /// Name in graph descriptions.
    fn kind(&self) -> &'static str;

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        default_output(spec)
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>>;
}

/// Output shape from `out_type`, `n_out` or the target, laid out like the
/// first source.
pub fn default_output(spec: &LayerSpec) -> Result<TensorDescriptor> {
    let name = &spec.name;
    let mut n_out = spec.desc.n_out;
    if spec.desc.out_type.is_none() && n_out.is_none() {
        if let Some(target) = &spec.target_data {
            let dim = target
                .dim
                .ok_or_else(|| Error::missing_shape(name, format!("dim of target '{}'", target.name)))?;
            n_out = Some(match &spec.loss {
                Some(loss) => loss.auto_output_layer_dim(dim),
                None => dim,
            });
        }
    }
    let mut opts = spec.desc.out_type.clone().unwrap_or_default();
    match (opts.dim, n_out) {
        (Some(dim), Some(n)) if dim != n => {
            return Err(Error::shape_mismatch(name, format!("n_out {n}"), format!("out_type dim {dim}")))
        }
        (None, Some(n)) => opts.dim = Some(n),
        _ => {}
    }
    let first = spec.sources.first().map(|s| &s.base().output);
    if opts.shape.is_none() {
        match (first, opts.dim) {
            (Some(src), Some(dim)) if !opts.sparse => {
                let mut shape: Vec<Dim> = if src.sparse {
                    src.shape.clone()
                } else {
                    src.shape[..src.shape.len().saturating_sub(1)].to_vec()
                };
                shape.push(Dim::Static(dim));
                opts.shape = Some(shape);
            }
            (Some(src), Some(_)) => {
                let keep = if src.sparse { src.shape.len() } else { src.shape.len().saturating_sub(1) };
                opts.shape = Some(src.shape[..keep].to_vec());
            }
            (_, None) if opts.sparse => return Err(Error::missing_shape(name, "dim of sparse output")),
            (_, None) => return Err(Error::missing_shape(name, "n_out or out_type")),
            (None, Some(_)) => {}
        }
    }
    if opts.dtype.is_none() && !opts.sparse {
        opts.dtype = first.map(|s| s.dtype).filter(|d| d.is_float());
    }
    let mut out = opts.to_descriptor(&format!("{name}_output"), name)?;
    if let Some(src) = first {
        if opts.batch_dim_axis.is_none() && opts.time_dim_axis.is_none() {
            out.batch_axis = src.batch_axis;
            out.time_axis = src.time_axis;
        }
        if src.matches_axis_pattern(&out) {
            out.dynamic_lengths = src.dynamic_lengths.clone();
        }
    }
    Ok(out)
}

/// Static feature width of a descriptor, or a MissingShape error.
pub fn feature_dim(layer: &str, data: &TensorDescriptor) -> Result<usize> {
    data.dim.ok_or_else(|| {
        Error::missing_shape(
            layer,
            format!("static feature dim of {} {}", data.name, format_shape(&data.shape)),
        )
    })
}
