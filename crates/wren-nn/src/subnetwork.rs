// Subnetwork — A whole nested network used as one layer
//
// The `subnetwork` option is an ordinary graph description that must define
// an `output` layer. Its extern data is either
//
//   concat_sources: true    one input "data", the (dropped-out)
//                           concatenation of the sources
//   concat_sources: false   one input per source, under the source's name
//
// The nested network records into the same graph, shares the train flag
// and collaborators, and draws its seed from the parent. Its parameters are
// named `{layer}/{inner layer}/{param}` in the graph and appear as
// `{inner layer}/{param}` on this layer.
//
// OBJECTIVE:
//   loss         the inner total loss
//   constraints  the inner total constraints
//   error        the only inner error; with several, the one of the inner
//                default output layer, else the alphabetically first

use serde::Deserialize;
use serde_json::Value;

use wren_core::{DType, Error, Result, TensorDescriptor};

use crate::concat::concat_sources_with_dropout;
use crate::description::NetworkDescription;
use crate::layer::{
    default_output, last_hidden_state, HiddenState, Layer, LayerBase, LayerClass, LayerObjective, LayerSpec,
    RecurrentState,
};
use crate::network::{ExternData, Network};

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubnetworkOpts {
    subnetwork: Value,
    #[serde(default = "default_true")]
    concat_sources: bool,
}

/// `subnetwork`.
pub struct SubnetworkClass;

impl LayerClass for SubnetworkClass {
    fn kind(&self) -> &'static str {
        "subnetwork"
    }

    /// The real output is only known once the inner network is built; this
    /// is a stand-in unless a shape is declared.
    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let opts: SubnetworkOpts = spec.options()?;
        if !opts.concat_sources && spec.desc.dropout != 0.0 {
            return Err(Error::unsupported(&spec.name, "dropout needs concat_sources"));
        }
        if spec.desc.n_out.is_none() && spec.desc.out_type.is_none() {
            return Ok(TensorDescriptor::scalar(format!("{}_output", spec.name), DType::F32));
        }
        default_output(spec)
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, declared: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let opts: SubnetworkOpts = spec.options()?;
        let description = NetworkDescription::from_value(opts.subnetwork)?;
        if !description.contains("output") {
            return Err(Error::invalid_option(&spec.name, "subnetwork", "must define an 'output' layer"));
        }
        let mut extern_data = ExternData::new();
        if opts.concat_sources {
            spec.require_sources()?;
            let data = concat_sources_with_dropout(net, &spec.name, &spec.sources, spec.desc.dropout)?;
            let key = extern_data.default_input.clone();
            extern_data.insert(key, data);
        } else {
            for src in &spec.sources {
                extern_data.insert(src.base().name.clone(), src.base().output.clone());
            }
        }

        let mut inner = Network::nested(net, &spec.name, description, extern_data);
        inner.construct()?;
        let mixed = inner
            .layers()
            .find(|l| !l.base().params.is_empty() && l.base().trainable != spec.desc.trainable);
        if let Some(layer) = mixed {
            return Err(Error::unsupported(
                &spec.name,
                format!("partly trainable subnetworks are not supported (inner layer '{}')", layer.base().name),
            ));
        }
        let output = inner
            .default_output_layer()
            .map(|l| l.base().output.clone())
            .ok_or_else(|| Error::invalid_option(&spec.name, "subnetwork", "has no 'output' layer"))?;
        if declared.dim.is_some() && declared.dim != output.dim {
            return Err(Error::shape_mismatch(&spec.name, declared.description(), output.description()));
        }

        let mut base = LayerBase::new(self.kind(), spec, output);
        base.recurrent = true;
        base.params = inner.params();
        Ok(Box::new(SubnetworkLayer { base, inner }))
    }
}

/// A layer owning a complete nested network.
pub struct SubnetworkLayer {
    base: LayerBase,
    inner: Network,
}

impl SubnetworkLayer {
    pub fn subnetwork(&self) -> &Network {
        &self.inner
    }
}

impl RecurrentState for SubnetworkLayer {
    fn last_hidden_state(&self) -> Option<HiddenState> {
        self.inner
            .default_output_layer()
            .and_then(|l| last_hidden_state(l.as_ref()))
    }
}

impl Layer for SubnetworkLayer {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn as_recurrent(&self) -> Option<&dyn RecurrentState> {
        Some(self)
    }

    fn objective(&self) -> Result<LayerObjective> {
        let inner = self.inner.construct_objective()?;
        let error = match inner.errors.len() {
            0 => None,
            1 => inner.errors.values().next().cloned(),
            _ => inner
                .errors
                .get(self.inner.default_output_layer_name())
                .or_else(|| inner.errors.values().next())
                .cloned(),
        };
        Ok(LayerObjective {
            loss: inner.total_loss.clone(),
            error,
            constraints: inner.total_constraints.clone(),
        })
    }
}
