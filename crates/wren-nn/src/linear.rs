// Linear — Fully-connected projection of the concatenated sources
//
//   y = act(x @ W + b)
//
// PARAMETER SHAPES:
//
//   W: [n_in, n_out]   Glorot/Xavier uniform
//   b: [n_out]         zeros, broadcast over every other axis
//
// Both widths must be static. A sparse source holds class indices; instead
// of a one-hot matmul the rows of W are gathered:
//
//   x: (batch, time) ints in [0, n_in)   →   W[x]: (batch, time, n_out)
//
// The same class is registered as "linear", as "forward" and, with a
// softmax default activation, as "softmax".

use serde::Deserialize;

use wren_core::{Error, Result, TensorDescriptor};

use crate::concat::concat_sources_with_dropout;
use crate::init;
use crate::layer::{default_output, feature_dim, Layer, LayerBase, LayerClass, LayerSpec, PlainLayer};
use crate::network::Network;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinearOpts {
    #[serde(default)]
    activation: Option<String>,
    #[serde(default = "default_with_bias")]
    with_bias: bool,
}

fn default_with_bias() -> bool {
    true
}

/// `linear`, `forward` and `softmax`.
#[derive(Debug, Clone, Copy)]
pub struct LinearClass {
    kind: &'static str,
    activation: Option<&'static str>,
}

impl LinearClass {
    pub const LINEAR: LinearClass = LinearClass {
        kind: "linear",
        activation: None,
    };
    pub const FORWARD: LinearClass = LinearClass {
        kind: "forward",
        activation: None,
    };
    pub const SOFTMAX: LinearClass = LinearClass {
        kind: "softmax",
        activation: Some("softmax"),
    };
}

impl LayerClass for LinearClass {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let _: LinearOpts = spec.options()?;
        spec.require_sources()?;
        let out = default_output(spec)?;
        if out.sparse {
            return Err(Error::unsupported(&spec.name, "a linear projection has a dense output"));
        }
        feature_dim(&spec.name, &out)?;
        Ok(out)
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let opts: LinearOpts = spec.options()?;
        let activation = net.activation(&spec.name, opts.activation.as_deref().or(self.activation))?;
        let data = concat_sources_with_dropout(net, &spec.name, &spec.sources, spec.desc.dropout)?;
        let n_in = feature_dim(&spec.name, &data)?;
        let n_out = feature_dim(&spec.name, &output)?;
        let x = data.placeholder()?.clone();

        let w_init = init::xavier_uniform(net.rng());
        let mut base = LayerBase::new(self.kind, spec, output);
        let w = base.add_param(net, "W", vec![n_in, n_out], w_init, true);
        let mut h = if data.sparse {
            w.embedding_lookup(&x)
        } else {
            x.matmul(&w)
        };
        if opts.with_bias {
            let b = base.add_param(net, "b", vec![n_out], init::zeros(), true);
            h = h.add(&b);
        }
        base.set_activation_output(h, activation);
        Ok(PlainLayer::boxed(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_class_kinds() {
        assert_eq!(LinearClass::LINEAR.kind(), "linear");
        assert_eq!(LinearClass::FORWARD.kind(), "forward");
        assert_eq!(LinearClass::SOFTMAX.activation, Some("softmax"));
    }

    #[test]
    fn test_with_bias_default() {
        let opts: LinearOpts = serde_json::from_value(json!({})).unwrap();
        assert!(opts.with_bias);
        assert!(opts.activation.is_none());
        assert!(serde_json::from_value::<LinearOpts>(json!({"bias": false})).is_err());
    }
}
