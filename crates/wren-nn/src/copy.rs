// Pass-through layers: source, copy, activation
//
// source      exposes one extern input as a layer (marks it used)
// copy        the concatenation of its sources, with optional dropout
// activation  copy + a named elementwise function; the pre-activation
//             value is kept for losses that fuse with it

use serde::Deserialize;

use wren_core::{Error, Result, TensorDescriptor};

use crate::concat::{concat_sources_with_dropout, concat_template};
use crate::layer::{Layer, LayerBase, LayerClass, LayerSpec, NoOptions, PlainLayer};
use crate::network::Network;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceOpts {
    #[serde(default)]
    data_key: Option<String>,
}

fn data_key(net: &Network, spec: &LayerSpec) -> Result<String> {
    let opts: SourceOpts = spec.options()?;
    Ok(opts
        .data_key
        .unwrap_or_else(|| net.extern_data().default_input.clone()))
}

/// `source`.
pub struct SourceClass;

impl LayerClass for SourceClass {
    fn kind(&self) -> &'static str {
        "source"
    }

    fn infer_output(&self, net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        spec.forbid("from", !spec.sources.is_empty())?;
        let key = data_key(net, spec)?;
        Ok(net.extern_data().get(&key, false)?.template(key))
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let key = data_key(net, &spec)?;
        let data = net.use_extern_data(&key)?;
        let mut base = LayerBase::new(self.kind(), spec, output);
        base.output.placeholder = data.placeholder;
        base.output.dynamic_lengths = data.dynamic_lengths;
        Ok(PlainLayer::boxed(base))
    }
}

/// Output of a concatenating layer, laid out like its sources.
pub(crate) fn concat_output(spec: &LayerSpec) -> Result<TensorDescriptor> {
    spec.require_sources()?;
    let out = concat_template(&spec.name, &spec.sources)?.template(format!("{}_output", spec.name));
    match (spec.desc.n_out, out.dim) {
        (Some(n), Some(dim)) if n != dim => Err(Error::shape_mismatch(
            &spec.name,
            format!("n_out {n}"),
            format!("sources of dim {dim}"),
        )),
        _ => Ok(out),
    }
}

/// `copy`.
pub struct CopyClass;

impl LayerClass for CopyClass {
    fn kind(&self) -> &'static str {
        "copy"
    }

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let NoOptions {} = spec.options()?;
        concat_output(spec)
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let data = concat_sources_with_dropout(net, &spec.name, &spec.sources, spec.desc.dropout)?;
        let mut base = LayerBase::new(self.kind(), spec, output);
        base.output.placeholder = data.placeholder;
        base.output.dynamic_lengths = data.dynamic_lengths;
        Ok(PlainLayer::boxed(base))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ActivationOpts {
    activation: Option<String>,
}

/// `activation`.
pub struct ActivationClass;

impl LayerClass for ActivationClass {
    fn kind(&self) -> &'static str {
        "activation"
    }

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let _: ActivationOpts = spec.options()?;
        concat_output(spec)
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let opts: ActivationOpts = spec.options()?;
        let activation = net.activation(&spec.name, opts.activation.as_deref())?;
        let data = concat_sources_with_dropout(net, &spec.name, &spec.sources, spec.desc.dropout)?;
        let x = data.placeholder()?.clone();
        let mut base = LayerBase::new(self.kind(), spec, output);
        base.output.dynamic_lengths = data.dynamic_lengths;
        base.set_activation_output(x, activation);
        Ok(PlainLayer::boxed(base))
    }
}
