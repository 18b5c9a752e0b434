// CTC — Connectionist temporal classification
//
// The output scores one extra class, the blank label, so the layer width is
// target dim + 1. The dense padded target plus its lengths are turned into
// a sparse label sequence once per `init` and shared by value and error.
//
// `auto_clip_target_len` clips each target length to
// max(output_length - 1, 0), so at least one blank always fits.
//
// Error: greedy decoding of the (time-major) logits, then the summed,
// unnormalized edit distance to the labels.

use serde::Deserialize;
use serde_json::{Map, Value};

use wren_core::{DType, Error, Op, Result, Tensor, TensorDescriptor};

use super::{parse_opts, require_sparse, Loss, LossInputs};
use crate::layer::OutputWithActivation;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct CtcOpts {
    target_collapse_repeated: bool,
    auto_clip_target_len: bool,
}

/// `ctc`.
#[derive(Debug, Clone, Default)]
pub struct CtcLoss {
    pub target_collapse_repeated: bool,
    pub auto_clip_target_len: bool,
}

impl CtcLoss {
    pub fn from_opts(layer: &str, opts: &Map<String, Value>) -> Result<Box<dyn Loss>> {
        let opts: CtcOpts = parse_opts(layer, "ctc", opts)?;
        Ok(Box::new(CtcLoss {
            target_collapse_repeated: opts.target_collapse_repeated,
            auto_clip_target_len: opts.auto_clip_target_len,
        }))
    }

    fn logits(inputs: &LossInputs) -> Result<Tensor> {
        let from_activation = inputs
            .output_with_activation
            .as_ref()
            .and_then(OutputWithActivation::logits)
            .cloned();
        match from_activation {
            Some(logits) => Ok(logits),
            None => Ok(inputs.output.placeholder()?.log()),
        }
    }

    fn output_lengths(inputs: &LossInputs) -> Result<&Tensor> {
        inputs
            .output_lengths
            .as_ref()
            .ok_or_else(|| Error::missing_shape(&inputs.layer, "sequence lengths of the ctc output"))
    }

    fn labels(inputs: &LossInputs) -> Result<&Tensor> {
        inputs
            .sparse_labels
            .as_ref()
            .ok_or_else(|| Error::msg(format!("ctc labels of layer '{}' were not initialized", inputs.layer)))
    }
}

impl Loss for CtcLoss {
    fn kind(&self) -> &'static str {
        "ctc"
    }

    fn recurrent(&self) -> bool {
        true
    }

    fn auto_output_layer_dim(&self, target_dim: usize) -> usize {
        target_dim + 1
    }

    fn validate_target(&self, layer: &str, target: &TensorDescriptor) -> Result<()> {
        require_sparse(layer, self.kind(), target)
    }

    fn init(
        &self,
        layer: &str,
        output: &TensorDescriptor,
        output_with_activation: Option<&OutputWithActivation>,
        target: &TensorDescriptor,
    ) -> Result<LossInputs> {
        self.validate_target(layer, target)?;
        let target_dim = target
            .dim
            .ok_or_else(|| Error::missing_shape(layer, "dim of ctc target"))?;
        let mut inputs = LossInputs::flatten(layer, output, output_with_activation, target)?;
        inputs.check_dims(layer, self.auto_output_layer_dim(target_dim))?;
        let output_lengths = Self::output_lengths(&inputs)?;
        let mut target_lengths = inputs
            .target_lengths
            .clone()
            .ok_or_else(|| Error::missing_shape(layer, "sequence lengths of the ctc target"))?;
        if self.auto_clip_target_len {
            target_lengths = target_lengths.minimum(&output_lengths.sub_scalar(1).maximum_scalar(0));
        }
        let labels = target.placeholder()?.apply(
            Op::SparseLabels {
                collapse_repeated: self.target_collapse_repeated,
            },
            &[&target_lengths],
            DType::I32,
        );
        inputs.sparse_labels = Some(labels);
        Ok(inputs)
    }

    fn value(&self, inputs: &LossInputs) -> Result<Tensor> {
        let logits = Self::logits(inputs)?;
        let loss = logits.apply(
            Op::CtcLoss {
                time_major: inputs.output.is_time_major(),
            },
            &[Self::labels(inputs)?, Self::output_lengths(inputs)?],
            DType::F32,
        );
        Ok(loss.sum_all())
    }

    fn error(&self, inputs: &LossInputs) -> Result<Tensor> {
        let mut logits = Self::logits(inputs)?;
        if !inputs.output.is_time_major() {
            logits = logits.permute(vec![1, 0, 2]);
        }
        let decoded = logits.apply(Op::CtcGreedyDecode, &[Self::output_lengths(inputs)?], DType::I32);
        let distance = decoded.apply(
            Op::EditDistance { normalize: false },
            &[Self::labels(inputs)?],
            DType::F32,
        );
        Ok(distance.sum_all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_core::{Dim, Graph, LengthFeeds};

    fn setup(g: &Graph) -> (TensorDescriptor, TensorDescriptor) {
        let out = TensorDescriptor::dense("out", vec![Dim::Dynamic, Dim::Static(5)]).with_placeholders(g);
        let target = TensorDescriptor::sparse("classes", vec![Dim::Dynamic], 4).with_placeholders(g);
        (out, target)
    }

    #[test]
    fn test_blank_label_dim() {
        assert_eq!(CtcLoss::default().auto_output_layer_dim(4), 5);
        assert!(CtcLoss::default().recurrent());
    }

    #[test]
    fn test_dense_target_rejected() {
        let target = TensorDescriptor::dense("classes", vec![Dim::Dynamic, Dim::Static(4)]);
        assert!(matches!(
            CtcLoss::default().validate_target("out", &target),
            Err(Error::UnsupportedCombination { .. })
        ));
    }

    #[test]
    fn test_clipped_target_lengths() {
        let g = Graph::new();
        let (out, target) = setup(&g);
        let loss = CtcLoss {
            auto_clip_target_len: true,
            ..CtcLoss::default()
        };
        let inputs = loss.init("out", &out, None, &target).unwrap();
        let labels = inputs.sparse_labels.clone().unwrap();
        let clipped = &labels.inputs()[1];
        let feeds = LengthFeeds::new()
            .with_lengths("out:size0", vec![4, 1, 0])
            .with_lengths("classes:size0", vec![2, 3, 2]);
        assert_eq!(g.fold_lengths(clipped, &feeds).unwrap(), vec![2, 0, 0]);
        loss.value(&inputs).unwrap();
        let error = loss.error(&inputs).unwrap();
        assert_eq!(error.inputs()[0].op(), Op::EditDistance { normalize: false });
    }
}
