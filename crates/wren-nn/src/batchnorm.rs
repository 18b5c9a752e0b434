// Batch normalization — Universal post-processing and the batch_norm class
//
// Any layer can normalize its output with `"batch_norm": true` (or an
// options object). The statistics are taken over every valid frame of the
// batch, i.e. over the output flattened with its sequence mask:
//
//   x_hat = (x - mean) / sqrt(var + ε)
//   y     = γ * x_hat + β
//
// RUNNING STATISTICS:
//   Each build records an exponential moving average update of the
//   per-feature sample statistics (non-trainable parameters):
//
//     sample_mean += (mean_batch - sample_mean) * momentum
//
//   `use_sample` mixes batch and sample statistics:
//     mean = (1 - use_sample) * mean_batch + use_sample * sample_mean
//   It is the configured value while training (default 0.0: batch stats)
//   and 1.0 in evaluation, unless `force_sample` keeps the configured value
//   in both. With a runtime train flag the factor is itself a tensor.
//
// PARAMETERS (named after the layer and the normalized data):
//   {layer}_{data}_mean       zeros, not trainable
//   {layer}_{data}_variance   ones,  not trainable
//   {layer}_{data}_gamma      ones   (use_std)
//   {layer}_{data}_beta       zeros  (use_shift)

use serde::{Deserialize, Serialize};

use wren_core::{DType, ReduceOp, Result, Tensor, TensorDescriptor};

use crate::concat::concat_sources_with_dropout;
use crate::copy::concat_output;
use crate::init;
use crate::layer::{Layer, LayerBase, LayerClass, LayerSpec, PlainLayer};
use crate::network::{Network, TrainFlag};

/// Options of batch normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BatchNormOpts {
    pub use_shift: bool,
    pub use_std: bool,
    pub use_sample: f64,
    pub force_sample: bool,
    pub momentum: f64,
    pub epsilon: f64,
}

impl Default for BatchNormOpts {
    fn default() -> Self {
        BatchNormOpts {
            use_shift: true,
            use_std: true,
            use_sample: 0.0,
            force_sample: false,
            momentum: 0.99,
            epsilon: 1e-3,
        }
    }
}

/// Normalize the output of `base`, recording its parameters on it.
///
/// Returns the normalized tensor; the caller decides whether it replaces
/// the output placeholder.
pub fn batch_norm(net: &Network, base: &mut LayerBase, opts: &BatchNormOpts) -> Result<Tensor> {
    let data = base.output.clone();
    let x = data.placeholder()?.clone();
    let flat = match data.sequence_lengths() {
        Some(lengths) => x.flatten_with_seq_len_mask(lengths, data.is_time_major()),
        None => x.clone(),
    };
    let mean = flat.mean(0, true);
    let variance = flat.reduce(ReduceOp::Variance, vec![0], true);

    let shape = data.non_dynamic_shape();
    let prefix = format!("{}_{}", base.name, data.name);
    let sample_mean = base.add_param(net, &format!("{prefix}_mean"), shape.clone(), init::zeros(), false);
    let sample_mean = sample_mean.assign_add(&mean.sub(&sample_mean).mul_scalar(opts.momentum));
    let sample_var = base.add_param(net, &format!("{prefix}_variance"), shape.clone(), init::ones(), false);
    let sample_var = sample_var.assign_add(&variance.sub(&sample_var).mul_scalar(opts.momentum));

    let (mean, variance) = match use_sample_factor(net, opts) {
        Factor::Static(u) if u == 0.0 => (mean, variance),
        Factor::Static(u) if u == 1.0 => (sample_mean, sample_var),
        Factor::Static(u) => (
            mean.mul_scalar(1.0 - u).add(&sample_mean.mul_scalar(u)),
            variance.mul_scalar(1.0 - u).add(&sample_var.mul_scalar(u)),
        ),
        Factor::Dynamic(u) => (
            mean.add(&sample_mean.sub(&mean).mul(&u)),
            variance.add(&sample_var.sub(&variance).mul(&u)),
        ),
    };

    let mut bn = x.sub(&mean).mul(&variance.add_scalar(opts.epsilon).rsqrt());
    if opts.use_std {
        let gamma = base.add_param(net, &format!("{prefix}_gamma"), shape.clone(), init::ones(), true);
        bn = bn.mul(&gamma);
    }
    if opts.use_shift {
        let beta = base.add_param(net, &format!("{prefix}_beta"), shape, init::zeros(), true);
        bn = bn.add(&beta);
    }
    Ok(bn)
}

enum Factor {
    Static(f64),
    Dynamic(Tensor),
}

fn use_sample_factor(net: &Network, opts: &BatchNormOpts) -> Factor {
    if opts.force_sample {
        return Factor::Static(opts.use_sample);
    }
    match net.train_flag() {
        TrainFlag::Static(true) => Factor::Static(opts.use_sample),
        TrainFlag::Static(false) => Factor::Static(1.0),
        TrainFlag::Dynamic(flag) => Factor::Dynamic(
            flag.cast(DType::F32)
                .mul_scalar(opts.use_sample - 1.0)
                .add_scalar(1.0),
        ),
    }
}

/// `batch_norm`: a copy of the sources, always normalized.
pub struct BatchNormClass;

impl LayerClass for BatchNormClass {
    fn kind(&self) -> &'static str {
        "batch_norm"
    }

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let _: BatchNormOpts = spec.options()?;
        concat_output(spec)
    }

    fn build(
        &self,
        net: &mut Network,
        spec: LayerSpec,
        output: TensorDescriptor,
    ) -> Result<Box<dyn Layer>> {
        let opts: BatchNormOpts = spec.options()?;
        let data = concat_sources_with_dropout(net, &spec.name, &spec.sources, spec.desc.dropout)?;
        let mut base = LayerBase::new(self.kind(), spec, output);
        base.output.placeholder = data.placeholder;
        base.output.dynamic_lengths = data.dynamic_lengths;
        let y = batch_norm(net, &mut base, &opts)?;
        base.output.placeholder = Some(y);
        Ok(PlainLayer::boxed(base))
    }
}
