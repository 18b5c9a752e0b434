// Network — The graph container and its lazy, memoized construction
//
// A Network owns:
//   - the ordered graph description (layer name → options)
//   - the extern data descriptors (inputs fed by the runner)
//   - the built layers, in construction order
//   - the per-build concat/dropout cache
//   - the random generator every parameter seed is drawn from
//   - the train flag (known true, known false, or a runtime placeholder)
//
// CONSTRUCTION:
//
//   get_layer(name) is the only way a layer comes into existence:
//
//     built already?           → return it
//     on the in-progress stack → cycle, fatal
//     "data" / "data:KEY"      → implicit source layer for extern data
//     in the description?      → resolve its sources (recursively), build
//     otherwise                → missing source, fatal
//
//   Layers are therefore built after all of their sources, and the op graph
//   they record is acyclic by construction. Every error aborts the whole
//   build; nothing is retried.
//
// NESTING:
//
//   A subnetwork layer owns a complete Network of its own. It shares the
//   op graph, the train flag and the collaborators of its parent, and
//   prefixes the graph names of its parameters with its layer name.

use std::cell::{OnceCell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info, warn};

use wren_core::{bail, DType, DataOpts, Error, Graph, Result, Tensor, TensorDescriptor};

use crate::activation::{Activation, ActivationRegistry};
use crate::batchnorm;
use crate::concat::ConcatKey;
use crate::description::{LayerDescription, NetworkDescription};
use crate::init;
use crate::layer::{LayerRef, LayerSpec};
use crate::registry::LayerRegistry;

/// Whether the graph is built for training.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainFlag {
    /// Known while building.
    Static(bool),
    /// Decided per run by a boolean scalar placeholder.
    Dynamic(Tensor),
}

/// How the train flag is configured: `true`, `false` or `"dynamic"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainFlagConfig {
    Static(bool),
    #[default]
    Dynamic,
}

impl Serialize for TrainFlagConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            TrainFlagConfig::Static(b) => serializer.serialize_bool(*b),
            TrainFlagConfig::Dynamic => serializer.serialize_str("dynamic"),
        }
    }
}

impl<'de> Deserialize<'de> for TrainFlagConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Mode(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Flag(b) => Ok(TrainFlagConfig::Static(b)),
            Raw::Mode(s) if s == "dynamic" => Ok(TrainFlagConfig::Dynamic),
            Raw::Mode(s) => Err(serde::de::Error::custom(format!(
                "train_flag must be true, false or \"dynamic\", got \"{s}\""
            ))),
        }
    }
}

/// Collaborators supplied by the surrounding system (dataset, config).
pub trait ExternalResolver {
    /// Upper bound on the sequence length of `key`, if known.
    fn sequence_length_hint(&self, _key: &str) -> Option<usize> {
        None
    }

    /// A named tensor that is neither extern data nor a layer, usable as a
    /// loss target.
    fn resolve_named_tensor(&self, _key: &str) -> Option<TensorDescriptor> {
        None
    }
}

/// A resolver that knows nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResolver;

impl ExternalResolver for NoResolver {}

/// Externally supplied inputs.
#[derive(Debug, Clone)]
pub struct ExternData {
    data: BTreeMap<String, TensorDescriptor>,
    pub default_input: String,
    pub default_target: String,
    used: RefCell<BTreeSet<String>>,
}

impl Default for ExternData {
    fn default() -> Self {
        ExternData {
            data: BTreeMap::new(),
            default_input: "data".to_string(),
            default_target: "classes".to_string(),
            used: RefCell::new(BTreeSet::new()),
        }
    }
}

impl ExternData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an input; the descriptor is renamed to `key`.
    pub fn insert(&mut self, key: impl Into<String>, mut data: TensorDescriptor) {
        let key = key.into();
        data.name = key.clone();
        self.data.insert(key, data);
    }

    pub fn with_data(mut self, key: impl Into<String>, data: TensorDescriptor) -> Self {
        self.insert(key, data);
        self
    }

    /// Declare inputs from their serialized form.
    pub fn from_opts(opts: &BTreeMap<String, DataOpts>) -> Result<Self> {
        let mut out = ExternData::new();
        for (key, o) in opts {
            out.insert(key.clone(), o.to_descriptor(key, "extern_data")?);
        }
        Ok(out)
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Look up an input, optionally marking it as used.
    pub fn get(&self, key: &str, mark_used: bool) -> Result<TensorDescriptor> {
        let data = self.data.get(key).ok_or_else(|| Error::UnknownExternData {
            key: key.to_string(),
        })?;
        if mark_used {
            self.used.borrow_mut().insert(key.to_string());
        }
        Ok(data.clone())
    }

    pub fn is_used(&self, key: &str) -> bool {
        self.used.borrow().contains(key)
    }

    /// Declared inputs nothing has read.
    pub fn unused_keys(&self) -> Vec<String> {
        let used = self.used.borrow();
        self.data.keys().filter(|k| !used.contains(*k)).cloned().collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    fn attach_placeholders(&mut self, graph: &Graph) {
        for data in self.data.values_mut() {
            if data.placeholder.is_none() {
                *data = data.clone().with_placeholders(graph);
            }
        }
    }
}

/// Build options of one network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub seed: u64,
    pub train_flag: TrainFlagConfig,
    /// Bound for manually unrolled loops when nothing better is known.
    pub max_seq_len: Option<usize>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            seed: 42,
            train_flag: TrainFlagConfig::Dynamic,
            max_seq_len: None,
        }
    }
}

/// Per-layer objective terms and their totals.
#[derive(Debug, Clone, Default)]
pub struct Objective {
    pub losses: BTreeMap<String, Tensor>,
    pub errors: BTreeMap<String, Tensor>,
    pub constraints: BTreeMap<String, Tensor>,
    /// Absent when no layer has a loss.
    pub total_loss: Option<Tensor>,
    /// Absent when no layer has a constraint.
    pub total_constraints: Option<Tensor>,
}

impl Objective {
    /// `total_loss + total_constraints`, whichever exist.
    pub fn total_objective(&self) -> Option<Tensor> {
        let terms: Vec<Tensor> = self
            .total_loss
            .iter()
            .chain(self.total_constraints.iter())
            .cloned()
            .collect();
        match terms.as_slice() {
            [] => None,
            [one] => Some(one.clone()),
            [a, b] => Some(a.add(b)),
            _ => Tensor::add_n(&terms),
        }
    }
}

/// The graph container.
pub struct Network {
    name: String,
    graph: Graph,
    description: NetworkDescription,
    extern_data: ExternData,
    layers: Vec<LayerRef>,
    index: HashMap<String, usize>,
    in_progress: Vec<String>,
    pub(crate) concat_cache: HashMap<ConcatKey, TensorDescriptor>,
    rng: StdRng,
    train_flag: TrainFlag,
    max_seq_len: Option<usize>,
    resolver: Rc<dyn ExternalResolver>,
    activations: Rc<ActivationRegistry>,
    param_prefix: String,
    objective: OnceCell<Objective>,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("name", &self.name)
            .field("layers", &self.index.len())
            .field("graph", &self.graph)
            .finish()
    }
}

impl Network {
    /// A fresh network recording into its own graph.
    pub fn new(description: NetworkDescription, extern_data: ExternData, config: &NetworkConfig) -> Self {
        let graph = Graph::new();
        let train_flag = match config.train_flag {
            TrainFlagConfig::Static(b) => TrainFlag::Static(b),
            TrainFlagConfig::Dynamic => TrainFlag::Dynamic(graph.placeholder("train_flag", DType::Bool, 0)),
        };
        Self::assemble(
            "root".to_string(),
            graph,
            description,
            extern_data,
            StdRng::seed_from_u64(config.seed),
            train_flag,
            config.max_seq_len,
            Rc::new(NoResolver),
            Rc::new(ActivationRegistry::builtin()),
            String::new(),
        )
    }

    /// A network nested in `parent` as layer `layer`.
    pub fn nested(
        parent: &mut Network,
        layer: &str,
        description: NetworkDescription,
        extern_data: ExternData,
    ) -> Self {
        let seed = init::seed(parent.rng());
        Self::assemble(
            format!("{}/{}", parent.name, layer),
            parent.graph.clone(),
            description,
            extern_data,
            StdRng::seed_from_u64(seed),
            parent.train_flag.clone(),
            parent.max_seq_len,
            parent.resolver.clone(),
            parent.activations.clone(),
            format!("{}{}/", parent.param_prefix, layer),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        name: String,
        graph: Graph,
        description: NetworkDescription,
        mut extern_data: ExternData,
        rng: StdRng,
        train_flag: TrainFlag,
        max_seq_len: Option<usize>,
        resolver: Rc<dyn ExternalResolver>,
        activations: Rc<ActivationRegistry>,
        param_prefix: String,
    ) -> Self {
        extern_data.attach_placeholders(&graph);
        Network {
            name,
            graph,
            description,
            extern_data,
            layers: Vec::new(),
            index: HashMap::new(),
            in_progress: Vec::new(),
            concat_cache: HashMap::new(),
            rng,
            train_flag,
            max_seq_len,
            resolver,
            activations,
            param_prefix,
            objective: OnceCell::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Rc<dyn ExternalResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_activations(mut self, activations: ActivationRegistry) -> Self {
        self.activations = Rc::new(activations);
        self
    }

    // Accessors

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn description(&self) -> &NetworkDescription {
        &self.description
    }

    pub fn extern_data(&self) -> &ExternData {
        &self.extern_data
    }

    pub fn train_flag(&self) -> &TrainFlag {
        &self.train_flag
    }

    pub fn resolver(&self) -> &dyn ExternalResolver {
        self.resolver.as_ref()
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Prefix of parameter names in the graph ("" at top level).
    pub fn param_prefix(&self) -> &str {
        &self.param_prefix
    }

    pub fn max_seq_len(&self) -> Option<usize> {
        self.max_seq_len
    }

    /// Built layers, in construction order.
    pub fn layers(&self) -> impl Iterator<Item = &LayerRef> {
        self.layers.iter()
    }

    pub fn layer(&self, name: &str) -> Option<&LayerRef> {
        self.index.get(name).map(|&i| &self.layers[i])
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.base().name.as_str()).collect()
    }

    pub fn default_output_layer_name(&self) -> &'static str {
        "output"
    }

    pub fn default_output_layer(&self) -> Option<&LayerRef> {
        self.layer(self.default_output_layer_name())
    }

    /// Resolve an activation name.
    pub fn activation(&self, layer: &str, name: Option<&str>) -> Result<Option<Activation>> {
        name.map(|n| self.activations.get(layer, n)).transpose()
    }

    /// All parameters as `layer/param`.
    pub fn params(&self) -> BTreeMap<String, Tensor> {
        let mut out = BTreeMap::new();
        for layer in &self.layers {
            let base = layer.base();
            for (k, v) in &base.params {
                out.insert(format!("{}/{}", base.name, k), v.clone());
            }
        }
        out
    }

    /// All monitoring scalars as `layer/stat`.
    pub fn stats(&self) -> BTreeMap<String, Tensor> {
        let mut out = BTreeMap::new();
        for layer in &self.layers {
            let base = layer.base();
            for (k, v) in &base.stats {
                out.insert(format!("{}/{}", base.name, k), v.clone());
            }
        }
        out
    }

    /// `on_train` when training, `on_eval` otherwise. With a static flag
    /// only one branch is ever recorded.
    pub fn cond_on_train(&self, on_train: impl FnOnce() -> Tensor, on_eval: impl FnOnce() -> Tensor) -> Tensor {
        match &self.train_flag {
            TrainFlag::Static(true) => on_train(),
            TrainFlag::Static(false) => on_eval(),
            TrainFlag::Dynamic(flag) => Tensor::cond(flag, &on_train(), &on_eval()),
        }
    }

    // Construction

    /// Build every described layer.
    pub fn construct(&mut self) -> Result<()> {
        let names: Vec<String> = self.description.names().map(String::from).collect();
        for name in names {
            self.get_layer(&name)?;
        }
        for key in self.extern_data.unused_keys() {
            warn!(network = %self.name, key = %key, "extern data declared but never used");
        }
        info!(
            network = %self.name,
            layers = self.layers.len(),
            params = self.params().len(),
            nodes = self.graph.len(),
            "network constructed"
        );
        Ok(())
    }

    fn source_data_key(&self, name: &str) -> Option<String> {
        if name == "data" {
            Some(self.extern_data.default_input.clone())
        } else {
            name.strip_prefix("data:").map(String::from)
        }
    }

    /// Get a layer, building it (and its sources) on first request.
    pub fn get_layer(&mut self, name: &str) -> Result<LayerRef> {
        if let Some(layer) = self.layer(name) {
            return Ok(layer.clone());
        }
        let requester = self
            .in_progress
            .last()
            .cloned()
            .unwrap_or_else(|| name.to_string());
        if self.in_progress.iter().any(|n| n == name) {
            let mut chain = self.in_progress.clone();
            chain.push(name.to_string());
            return Err(Error::CyclicOrMissingSource {
                layer: requester,
                source_name: name.to_string(),
                reason: format!("cycle {}", chain.join(" -> ")),
            });
        }
        let desc = match self.description.get(name) {
            Some(desc) => desc.clone(),
            None => match self.source_data_key(name) {
                Some(key) => LayerDescription::source(&key),
                None => {
                    return Err(Error::CyclicOrMissingSource {
                        layer: requester,
                        source_name: name.to_string(),
                        reason: "no such layer in the description".to_string(),
                    })
                }
            },
        };
        self.in_progress.push(name.to_string());
        let built = self.construct_layer(name, desc);
        self.in_progress.pop();
        let layer = built?;
        self.index.insert(name.to_string(), self.layers.len());
        self.layers.push(layer.clone());
        Ok(layer)
    }

    fn construct_layer(&mut self, name: &str, desc: LayerDescription) -> Result<LayerRef> {
        let registry = LayerRegistry::global()?;
        let class = registry.resolve(&desc.class)?;
        let mut sources = Vec::new();
        for src in desc.source_names() {
            sources.push(self.get_layer(&src)?);
        }
        let loss = desc
            .loss
            .as_deref()
            .map(|kind| registry.make_loss(name, kind, &desc.loss_opts))
            .transpose()?;
        let target = match (&desc.target, &loss) {
            (Some(t), _) if t == "none" => None,
            (Some(t), _) => Some(t.clone()),
            (None, Some(_)) => Some(self.extern_data.default_target.clone()),
            (None, None) => None,
        };
        let target_data = match &target {
            Some(t) => Some(self.target_data(name, t)?),
            None => None,
        };
        if let (Some(loss), Some(data)) = (&loss, &target_data) {
            loss.validate_target(name, data)?;
        }
        let bn = desc.batch_norm.enabled();
        let spec = LayerSpec {
            name: name.to_string(),
            desc,
            sources,
            loss,
            target,
            target_data,
        };
        let output = class.infer_output(self, &spec)?;
        let mut layer = class.build(self, spec, output)?;
        if let Some(opts) = bn {
            let base = layer.base_mut();
            let y = batchnorm::batch_norm(self, base, &opts)?;
            base.output.placeholder = Some(y);
        }
        let base = layer.base();
        if base.output.placeholder.is_none() {
            bail!("layer '{name}' of class '{}' did not attach an output", base.kind);
        }
        base.output.validate(name)?;
        debug!(
            layer = name,
            class = base.kind,
            sources = ?base.sources.iter().map(|s| s.base().name.as_str()).collect::<Vec<_>>(),
            params = base.params.len(),
            output = %base.output,
            "layer built"
        );
        Ok(LayerRef::from(layer))
    }

    /// Descriptor of a loss target: extern data, a layer, or a named tensor.
    fn target_data(&mut self, layer: &str, target: &str) -> Result<TensorDescriptor> {
        if self.extern_data.has(target) {
            return self.extern_data.get(target, true);
        }
        if self.layer(target).is_some() || self.description.contains(target) {
            return Ok(self.get_layer(target)?.base().output.clone());
        }
        match self.resolver.resolve_named_tensor(target) {
            Some(data) if data.placeholder.is_some() => Ok(data),
            Some(data) => Ok(data.with_placeholders(&self.graph)),
            None => Err(Error::UnknownTarget {
                layer: layer.to_string(),
                target: target.to_string(),
            }),
        }
    }

    /// Look up extern data for a source layer and mark it used.
    pub fn use_extern_data(&self, key: &str) -> Result<TensorDescriptor> {
        self.extern_data.get(key, true)
    }

    // Objective

    /// Collect losses, errors and constraints of all layers (once).
    pub fn construct_objective(&self) -> Result<&Objective> {
        if let Some(obj) = self.objective.get() {
            return Ok(obj);
        }
        let mut obj = Objective::default();
        for layer in &self.layers {
            let name = &layer.base().name;
            let terms = layer.objective()?;
            if let Some(v) = terms.loss {
                obj.losses.insert(name.clone(), v);
            }
            if let Some(v) = terms.error {
                obj.errors.insert(name.clone(), v);
            }
            if let Some(v) = terms.constraints {
                obj.constraints.insert(name.clone(), v);
            }
        }
        obj.total_loss = Tensor::add_n(&obj.losses.values().cloned().collect::<Vec<_>>());
        obj.total_constraints = Tensor::add_n(&obj.constraints.values().cloned().collect::<Vec<_>>());
        debug!(
            network = %self.name,
            losses = obj.losses.len(),
            constraints = obj.constraints.len(),
            "objective constructed"
        );
        Ok(self.objective.get_or_init(|| obj))
    }

    pub fn total_loss(&self) -> Result<Option<Tensor>> {
        Ok(self.construct_objective()?.total_loss.clone())
    }

    pub fn total_constraints(&self) -> Result<Option<Tensor>> {
        Ok(self.construct_objective()?.total_constraints.clone())
    }

    pub fn total_objective(&self) -> Result<Option<Tensor>> {
        Ok(self.construct_objective()?.total_objective())
    }
}
