// framewise_statistics — Monitoring sink for a framewise softmax classifier
//
// Reads the softmax layer given as its first source together with that
// layer's sparse target (a hard alignment) and records, over all valid
// frames, the silence frames and the non-silence frames:
//
//   loss_ce                     per-frame cross-entropy
//   frame_error                 argmax != label
//   true_label_prob_histogram   probability of the true label in
//                               `histogram_num_bins` buckets
//
// For every quantity there is a batch mean (`batch_*`) and a running mean
// over everything seen so far (`accumulated_*`, non-trainable sums divided
// by the accumulated frame count). Frame counts and perplexities
// (exp of the cross-entropies) complete the set.
//
// The output is a dummy scalar; nothing should consume it.

use std::collections::BTreeMap;

use serde::Deserialize;

use wren_core::{DType, Error, Op, Result, Tensor, TensorDescriptor};

use crate::init;
use crate::layer::{Layer, LayerBase, LayerClass, LayerSpec, PlainLayer};
use crate::network::Network;

fn default_bins() -> usize {
    20
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StatisticsOpts {
    sil_label_idx: i64,
    #[serde(default = "default_bins")]
    histogram_num_bins: usize,
}

const SUBSETS: [&str; 3] = ["", "_sil", "_no_sil"];

/// `framewise_statistics`.
pub struct FramewiseStatisticsClass;

impl LayerClass for FramewiseStatisticsClass {
    fn kind(&self) -> &'static str {
        "framewise_statistics"
    }

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let opts: StatisticsOpts = spec.options()?;
        if opts.histogram_num_bins == 0 {
            return Err(Error::invalid_option(&spec.name, "histogram_num_bins", "must be positive"));
        }
        spec.require_sources()?;
        Ok(TensorDescriptor::scalar(format!("{}_output", spec.name), DType::F32))
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let opts: StatisticsOpts = spec.options()?;
        let bins = opts.histogram_num_bins;
        let source = spec.sources[0].clone();
        let src = source.base();
        let owa = src
            .output_before_activation
            .as_ref()
            .filter(|owa| owa.is_softmax())
            .ok_or_else(|| Error::unsupported(&spec.name, format!("source '{}' has no softmax output", src.name)))?;
        let target = src.target_data.as_ref().ok_or_else(|| Error::UnknownTarget {
            layer: spec.name.clone(),
            target: src.target.clone().unwrap_or_default(),
        })?;
        if !target.sparse {
            return Err(Error::unsupported(&spec.name, format!("target {} must be sparse", target.name)));
        }

        let out_lengths = src.output.lengths()?;
        let time_major = src.output.is_time_major();
        let target_lengths = target.lengths()?;
        let logits_flat = owa.x.flatten_with_seq_len_mask(out_lengths, time_major);
        let probs_flat = src.output.placeholder()?.flatten_with_seq_len_mask(out_lengths, time_major);
        let target_flat = target
            .placeholder()?
            .flatten_with_seq_len_mask(target_lengths, target.is_time_major());

        let loss_ce = logits_flat.apply(Op::SoftmaxCrossEntropy { sparse: true }, &[&target_flat], DType::F32);
        let frame_error = logits_flat.argmax(1).ne(&target_flat);
        let true_label_prob = probs_flat.gather_labels(&target_flat);
        let histogram = true_label_prob
            .mul_scalar(bins as f64)
            .round()
            .cast(DType::I32)
            .clamp(0.0, (bins - 1) as f64)
            .one_hot(bins, DType::Bool);

        let sil = net.graph().constant(opts.sil_label_idx as f64, DType::I32);
        let mask_sil = target_flat.eq(&sil);
        let mask_no_sil = target_flat.ne(&sil);

        let mut base = LayerBase::new(self.kind(), spec, output);
        base.output.placeholder = Some(net.graph().constant(0.0, DType::F32));

        let seq_len = target_lengths.sum_all();
        let seq_len_sil = mask_sil.cast(DType::I32).sum_all();
        let seq_len_no_sil = mask_no_sil.cast(DType::I32).sum_all();
        let acc_seq_len = base
            .add_param(net, "accumulated_seq_len", Vec::new(), init::zeros(), false)
            .assign_add(&seq_len.cast(DType::F32));
        let acc_seq_len_sil = base
            .add_param(net, "accumulated_seq_len_sil", Vec::new(), init::zeros(), false)
            .assign_add(&seq_len_sil.cast(DType::F32));
        let acc_seq_len_no_sil = acc_seq_len.sub(&acc_seq_len_sil);

        let mut stats = BTreeMap::new();
        stats.insert("batch_seq_length".to_string(), seq_len);
        stats.insert("batch_seq_length_sil".to_string(), seq_len_sil);
        stats.insert("batch_seq_length_no_sil".to_string(), seq_len_no_sil);
        stats.insert("accumulated_seq_length".to_string(), acc_seq_len.clone());
        stats.insert("accumulated_seq_length_sil".to_string(), acc_seq_len_sil.clone());
        stats.insert("accumulated_seq_length_no_sil".to_string(), acc_seq_len_no_sil.clone());

        let quantities: [(&str, &Tensor, Vec<usize>); 3] = [
            ("loss_ce", &loss_ce, Vec::new()),
            ("frame_error", &frame_error, Vec::new()),
            ("true_label_prob_histogram", &histogram, vec![bins]),
        ];
        for (name, value, acc_shape) in quantities {
            for subset in SUBSETS {
                let key = format!("{name}{subset}");
                let (v, frames) = match subset {
                    "_sil" => (value.boolean_mask(&mask_sil), &acc_seq_len_sil),
                    "_no_sil" => (value.boolean_mask(&mask_no_sil), &acc_seq_len_no_sil),
                    _ => (value.clone(), &acc_seq_len),
                };
                let v = v.cast(DType::F32);
                stats.insert(format!("batch_{key}"), v.mean(0, false));
                let acc = base
                    .add_param(net, &format!("accumulated_{key}"), acc_shape.clone(), init::zeros(), false)
                    .assign_add(&v.sum(0, false));
                stats.insert(format!("accumulated_{key}"), acc.div(frames));
            }
        }
        for scope in ["batch", "accumulated"] {
            for subset in SUBSETS {
                if let Some(ce) = stats.get(&format!("{scope}_loss_ce{subset}")).cloned() {
                    stats.insert(format!("{scope}_loss_perplexity{subset}"), ce.exp());
                }
            }
        }
        base.stats = stats;
        Ok(PlainLayer::boxed(base))
    }
}
