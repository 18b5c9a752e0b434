// Combine — elementwise add or average of same-shaped sources
//
// Every source must be dense with the output's feature width and the same
// non-batch shape. A source whose batch axis sits elsewhere is permuted to
// the first source's layout before it is added:
//
//   a: (batch, time, 8)   b: (time, batch, 8)
//   → a + swap(b, 0, 1)
//
// `average` divides the sum by the number of sources; an optional bias and
// activation follow.

use serde::Deserialize;

use wren_core::{Error, Result, Tensor, TensorDescriptor};

use crate::init;
use crate::layer::{default_output, Layer, LayerBase, LayerClass, LayerSpec, PlainLayer};
use crate::network::Network;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CombineKind {
    Add,
    Average,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CombineOpts {
    kind: CombineKind,
    #[serde(default)]
    activation: Option<String>,
    #[serde(default)]
    with_bias: bool,
}

fn check_sources(spec: &LayerSpec, output: &TensorDescriptor) -> Result<()> {
    if output.sparse {
        return Err(Error::unsupported(&spec.name, "combine has a dense output"));
    }
    let first = &spec.sources[0].base().output;
    for src in &spec.sources {
        let data = &src.base().output;
        if data.sparse {
            return Err(Error::unsupported(&spec.name, format!("cannot combine sparse source {}", data.name)));
        }
        if data.dim != output.dim {
            return Err(Error::shape_mismatch(
                &spec.name,
                format!("dim {:?} of the output", output.dim),
                data.description(),
            ));
        }
        if data.shape != first.shape {
            return Err(Error::shape_mismatch(&spec.name, first.description(), data.description()));
        }
    }
    Ok(())
}

/// `combine`.
pub struct CombineClass;

impl LayerClass for CombineClass {
    fn kind(&self) -> &'static str {
        "combine"
    }

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let _: CombineOpts = spec.options()?;
        spec.require_sources()?;
        let out = if spec.desc.n_out.is_none() && spec.desc.out_type.is_none() {
            spec.sources[0].base().output.template(format!("{}_output", spec.name))
        } else {
            default_output(spec)?
        };
        check_sources(spec, &out)?;
        Ok(out)
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let opts: CombineOpts = spec.options()?;
        let activation = net.activation(&spec.name, opts.activation.as_deref())?;
        let first = &spec.sources[0].base().output;
        let rank = first.batch_ndim();
        let mut terms = Vec::with_capacity(spec.sources.len());
        for src in &spec.sources {
            let data = &src.base().output;
            let x = data.placeholder()?;
            terms.push(match (data.batch_axis, first.batch_axis) {
                (Some(b), Some(common)) if b != common => x.swap_axes(rank, b, common),
                _ => x.clone(),
            });
        }
        let n = terms.len();
        let mut x = Tensor::add_n(&terms)
            .ok_or_else(|| Error::invalid_option(&spec.name, "from", "needs at least one source"))?;
        if opts.kind == CombineKind::Average && n > 1 {
            x = x.mul_scalar(1.0 / n as f64);
        }
        let lengths = (output.dynamic_lengths.is_empty() && first.matches_axis_pattern(&output))
            .then(|| first.dynamic_lengths.clone());
        let mut base = LayerBase::new(self.kind(), spec, output);
        if opts.with_bias {
            let dim = base
                .output
                .dim
                .ok_or_else(|| Error::missing_shape(&base.name, "dim for the bias"))?;
            let b = base.add_param(net, "b", vec![dim], init::zeros(), true);
            x = x.add(&b);
        }
        if let Some(lengths) = lengths {
            base.output.dynamic_lengths = lengths;
        }
        base.set_activation_output(x, activation);
        Ok(PlainLayer::boxed(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_names() {
        let opts: CombineOpts = serde_json::from_value(json!({"kind": "average"})).unwrap();
        assert_eq!(opts.kind, CombineKind::Average);
        assert!(!opts.with_bias);
        assert!(serde_json::from_value::<CombineOpts>(json!({"kind": "mul"})).is_err());
    }
}
