// Losses — Scalar objectives from a layer output and a reference target
//
// A loss compares two descriptors: the layer's output and the target
// (sparse class indices or dense distributions). Every loss goes through
// the same masking step first:
//
//   output (batch, time, dim) ──flatten_with_seq_len_mask──► (frames, dim)
//   target (batch, time)      ──flatten_with_seq_len_mask──► (frames,)
//
// so padding frames never reach a reduction. Values are SUMMED, not
// averaged; normalization by the number of frames happens in the trainer.
//
// If the layer's activation is softmax, the flattened PRE-activation is
// kept instead of the output, and cross-entropy records the fused,
// numerically stable softmax + cross-entropy op.
//
// LIFECYCLE:
//   validate_target  before the layer is built (reject unusable targets)
//   init             once the output exists → LossInputs
//   value / error    scalars from LossInputs
//
// KINDS:
//   ce          cross-entropy (sparse or dense target)
//   generic_ce  cross-entropy for any elementwise activation, with a
//               custom backward function registered in the engine
//   ctc         connectionist temporal classification; one extra output
//               class for the blank label

pub mod ce;
pub mod ctc;

use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use wren_core::{DType, Error, Result, Tensor, TensorDescriptor};

use crate::layer::OutputWithActivation;

/// Everything a loss reads, masked and flattened.
#[derive(Debug, Clone)]
pub struct LossInputs {
    /// Name of the layer the loss belongs to.
    pub layer: String,
    pub output: TensorDescriptor,
    pub output_with_activation: Option<OutputWithActivation>,
    pub output_lengths: Option<Tensor>,
    pub target: TensorDescriptor,
    pub target_lengths: Option<Tensor>,
    /// Flattened output, unless the softmax input is kept instead.
    pub output_flat: Option<Tensor>,
    /// Flattened pre-softmax values, if the activation is softmax.
    pub output_before_softmax_flat: Option<Tensor>,
    pub target_flat: Tensor,
    /// Label encoding shared by the value and the error of `ctc`.
    pub sparse_labels: Option<Tensor>,
}

impl LossInputs {
    /// Mask and flatten `output` and `target`.
    pub fn flatten(
        layer: &str,
        output: &TensorDescriptor,
        output_with_activation: Option<&OutputWithActivation>,
        target: &TensorDescriptor,
    ) -> Result<Self> {
        let y = output.placeholder()?;
        let output_lengths = output.sequence_lengths().cloned();
        let softmax_x = output_with_activation
            .filter(|owa| owa.is_softmax())
            .map(|owa| &owa.x);
        let (output_flat, output_before_softmax_flat) = match (output.time_axis, &output_lengths) {
            (Some(t), Some(lengths)) => {
                if !matches!((t, output.batch_axis), (0, Some(1)) | (1, Some(0))) {
                    return Err(Error::unsupported(
                        layer,
                        format!("loss needs a (time, batch) or (batch, time) layout, got {output}"),
                    ));
                }
                let time_major = output.is_time_major();
                match softmax_x {
                    Some(x) => (None, Some(x.flatten_with_seq_len_mask(lengths, time_major))),
                    None => (Some(y.flatten_with_seq_len_mask(lengths, time_major)), None),
                }
            }
            _ => match softmax_x {
                Some(x) => (None, Some(x.clone())),
                None => (Some(y.clone()), None),
            },
        };
        let t = target.placeholder()?;
        let target_lengths = target.sequence_lengths().cloned();
        let target_flat = match &target_lengths {
            Some(lengths) => t.flatten_with_seq_len_mask(lengths, target.is_time_major()),
            None => t.clone(),
        };
        Ok(LossInputs {
            layer: layer.to_string(),
            output: output.clone(),
            output_with_activation: output_with_activation.cloned(),
            output_lengths,
            target: target.clone(),
            target_lengths,
            output_flat,
            output_before_softmax_flat,
            target_flat,
            sparse_labels: None,
        })
    }

    /// Dense ranks agree and the output width is `expected_dim`.
    pub fn check_dims(&self, layer: &str, expected_dim: usize) -> Result<()> {
        if self.target.ndim_dense() != self.output.ndim_dense() {
            return Err(Error::shape_mismatch(
                layer,
                format!("target {} of dense rank {}", self.target, self.target.ndim_dense()),
                format!("output {} of dense rank {}", self.output, self.output.ndim_dense()),
            ));
        }
        if self.output.dim != Some(expected_dim) {
            return Err(Error::shape_mismatch(
                layer,
                format!("output dim {expected_dim} for target {}", self.target),
                format!("output {}", self.output),
            ));
        }
        Ok(())
    }

    /// The flattened values frame errors are computed from.
    pub fn scores_flat(&self) -> Result<&Tensor> {
        self.output_before_softmax_flat
            .as_ref()
            .or(self.output_flat.as_ref())
            .ok_or_else(|| Error::msg("loss inputs carry no flattened output"))
    }

    /// Number of frames where the arg-max prediction differs from the target.
    pub fn frame_error(&self) -> Result<Tensor> {
        let scores = self.scores_flat()?;
        let predicted = scores.argmax(1);
        let reference = if self.target.sparse {
            self.target_flat.clone()
        } else {
            self.target_flat.argmax(1)
        };
        Ok(predicted.ne(&reference).cast(DType::F32).sum_all())
    }
}

/// A loss kind.
pub trait Loss: fmt::Debug {
    fn kind(&self) -> &'static str;

    /// Sequence-level (alignment) rather than frame-wise.
    fn recurrent(&self) -> bool {
        false
    }

    /// Output width needed for a target of `target_dim` classes.
    fn auto_output_layer_dim(&self, target_dim: usize) -> usize {
        target_dim
    }

    /// Reject a target before anything is built for the layer.
    fn validate_target(&self, _layer: &str, _target: &TensorDescriptor) -> Result<()> {
        Ok(())
    }

    fn init(
        &self,
        layer: &str,
        output: &TensorDescriptor,
        output_with_activation: Option<&OutputWithActivation>,
        target: &TensorDescriptor,
    ) -> Result<LossInputs> {
        let inputs = LossInputs::flatten(layer, output, output_with_activation, target)?;
        let target_dim = target
            .dim
            .ok_or_else(|| Error::missing_shape(layer, format!("dim of target {}", target.name)))?;
        inputs.check_dims(layer, self.auto_output_layer_dim(target_dim))?;
        Ok(inputs)
    }

    /// The summed loss.
    fn value(&self, inputs: &LossInputs) -> Result<Tensor>;

    /// The summed error count.
    fn error(&self, inputs: &LossInputs) -> Result<Tensor> {
        inputs.frame_error()
    }
}

/// Deserialize `loss_opts` of `kind`.
pub(crate) fn parse_opts<T: DeserializeOwned>(layer: &str, kind: &str, opts: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(opts.clone()))
        .map_err(|e| Error::invalid_option(layer, "loss_opts", format!("{kind}: {e}")))
}

/// Reject a dense target.
pub(crate) fn require_sparse(layer: &str, kind: &str, target: &TensorDescriptor) -> Result<()> {
    if target.sparse {
        return Ok(());
    }
    Err(Error::unsupported(
        layer,
        format!("loss '{kind}' needs a sparse target (class indices), got {target}"),
    ))
}
