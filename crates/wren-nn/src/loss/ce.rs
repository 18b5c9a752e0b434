// Cross-entropy losses
//
// `ce` picks the cheapest stable formulation from what `init` kept:
//
//   target    softmax fused?   value
//   sparse    yes              Σ softmax_cross_entropy(logits, labels)
//   sparse    no               -Σ log(y[label])
//   dense     yes              Σ softmax_cross_entropy(logits, t)
//   dense     no               -Σ t · log(y)
//
// `generic_ce` works for any elementwise activation f (y = f(x)), e.g. exp
// or sigmoid. y is renormalized per frame and the loss -Σ log(y[label]) is
// recorded as a custom op whose backward function the engine must provide:
//
//   ∂loss/∂x = (d log f / dx) · (y - one_hot(label))

use serde::Deserialize;
use serde_json::{Map, Value};

use wren_core::{DType, Error, Op, Result, Tensor, TensorDescriptor};

use super::{parse_opts, require_sparse, Loss, LossInputs};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoOpts {}

/// `ce`.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn from_opts(layer: &str, opts: &Map<String, Value>) -> Result<Box<dyn Loss>> {
        let NoOpts {} = parse_opts(layer, "ce", opts)?;
        Ok(Box::new(CrossEntropyLoss))
    }
}

impl Loss for CrossEntropyLoss {
    fn kind(&self) -> &'static str {
        "ce"
    }

    fn value(&self, inputs: &LossInputs) -> Result<Tensor> {
        let target = &inputs.target_flat;
        let sparse = inputs.target.sparse;
        if let Some(logits) = &inputs.output_before_softmax_flat {
            let ce = logits.apply(Op::SoftmaxCrossEntropy { sparse }, &[target], DType::F32);
            return Ok(ce.sum_all());
        }
        let y = inputs.scores_flat()?;
        let log_likelihood = if sparse {
            y.gather_labels(target).log()
        } else {
            target.mul(&y.log())
        };
        Ok(log_likelihood.sum_all().neg())
    }
}

/// `generic_ce`.
#[derive(Debug, Clone, Default)]
pub struct GenericCrossEntropyLoss;

impl GenericCrossEntropyLoss {
    pub fn from_opts(layer: &str, opts: &Map<String, Value>) -> Result<Box<dyn Loss>> {
        let NoOpts {} = parse_opts(layer, "generic_ce", opts)?;
        Ok(Box::new(GenericCrossEntropyLoss))
    }
}

impl Loss for GenericCrossEntropyLoss {
    fn kind(&self) -> &'static str {
        "generic_ce"
    }

    fn validate_target(&self, layer: &str, target: &TensorDescriptor) -> Result<()> {
        require_sparse(layer, self.kind(), target)
    }

    fn value(&self, inputs: &LossInputs) -> Result<Tensor> {
        let layer = inputs.layer.as_str();
        let owa = inputs.output_with_activation.as_ref().ok_or_else(|| {
            Error::unsupported(layer, "generic_ce needs the output before its activation")
        })?;
        if inputs.output.dim != inputs.target.dim {
            return Err(Error::shape_mismatch(
                layer,
                format!("dim {:?} of target", inputs.target.dim),
                format!("dim {:?} of output", inputs.output.dim),
            ));
        }
        let time_major = inputs.output.is_time_major();
        let flat = |t: &Tensor| match &inputs.output_lengths {
            Some(lengths) => t.flatten_with_seq_len_mask(lengths, time_major),
            None => t.clone(),
        };
        let grad_f = owa.y.log().apply(Op::Gradient, &[&owa.x], DType::F32);
        let grad_f = flat(&grad_f);
        let x = flat(&owa.x);
        let y = flat(&owa.y);
        let y = y.div(&y.sum(1, true));
        Ok(x.apply(
            Op::Custom {
                name: "generic_ce".to_string(),
                grad: Some("generic_ce_grad".to_string()),
            },
            &[&y, &grad_f, &inputs.target_flat],
            DType::F32,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationRegistry;
    use crate::layer::OutputWithActivation;
    use wren_core::{Dim, Graph};

    fn setup(act: &str) -> (Graph, TensorDescriptor, OutputWithActivation, TensorDescriptor) {
        let g = Graph::new();
        let x = TensorDescriptor::dense("x", vec![Dim::Dynamic, Dim::Static(3)]).with_placeholders(&g);
        let owa = OutputWithActivation::new(
            x.placeholder.clone().unwrap(),
            Some(ActivationRegistry::builtin().get("l", act).unwrap()),
        );
        let mut out = x.template("out");
        out.placeholder = Some(owa.y.clone());
        let target = TensorDescriptor::sparse("classes", vec![Dim::Dynamic], 3).with_placeholders(&g);
        (g, out, owa, target)
    }

    #[test]
    fn test_ce_fuses_softmax() {
        let (_g, out, owa, target) = setup("softmax");
        let loss = CrossEntropyLoss;
        let inputs = loss.init("l", &out, Some(&owa), &target).unwrap();
        let value = loss.value(&inputs).unwrap();
        let fused = &value.inputs()[0];
        assert_eq!(fused.op(), Op::SoftmaxCrossEntropy { sparse: true });
    }

    #[test]
    fn test_ce_without_softmax_takes_log() {
        let (_g, out, owa, target) = setup("sigmoid");
        let loss = CrossEntropyLoss;
        let inputs = loss.init("l", &out, Some(&owa), &target).unwrap();
        let value = loss.value(&inputs).unwrap();
        assert_eq!(value.op(), Op::Unary(wren_core::UnaryOp::Neg));
    }

    #[test]
    fn test_generic_ce_records_custom_gradient() {
        let (g, out, owa, target) = setup("exp");
        let loss = GenericCrossEntropyLoss;
        let inputs = loss.init("l", &out, Some(&owa), &target).unwrap();
        loss.value(&inputs).unwrap();
        assert!(g.requires_custom_gradients());
    }

    #[test]
    fn test_unknown_loss_opts() {
        let mut opts = Map::new();
        opts.insert("focal".into(), Value::Bool(true));
        assert!(matches!(
            CrossEntropyLoss::from_opts("l", &opts),
            Err(Error::InvalidOption { .. })
        ));
    }
}
