// Reduce — sum / max / mean over one or more axes
//
// `axis` counts physical axes (batch included, batch first unless
// `enforce_batch_dim_axis` is null). Named selections:
//
//   "b" | "batch"            the batch axis
//   "t" | "time"             the time axis
//   "spatial"                every dynamic axis
//   "spatial_except_time"    every dynamic axis but time
//   "f" | "feature"          every static axis
//
// Removing an axis renumbers the axes above it, in the shape as well as in
// the dynamic lengths:
//
//   (batch, time, freq?, 40) lengths {0: t, 1: f}
//     reduce "time"                → (batch, freq?, 40) lengths {0: f}
//     reduce "time", keep_dims     → (batch, time?, freq?, 40), time lengths all 1
//
// Padding frames take part in the reduction.

use std::collections::BTreeMap;

use serde::Deserialize;

use wren_core::{Dim, Error, ReduceOp, Result, TensorDescriptor};

use crate::concat::{concat_sources_with_dropout, concat_template};
use crate::layer::{Layer, LayerBase, LayerClass, LayerSpec, PlainLayer};
use crate::network::Network;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum AxisSelection {
    One(i64),
    Many(Vec<i64>),
    Named(String),
}

fn default_batch_first() -> Option<usize> {
    Some(0)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReduceOpts {
    mode: String,
    axis: AxisSelection,
    #[serde(default)]
    keep_dims: bool,
    #[serde(default = "default_batch_first")]
    enforce_batch_dim_axis: Option<usize>,
}

impl ReduceOpts {
    fn op(&self, layer: &str) -> Result<ReduceOp> {
        match self.mode.to_lowercase().as_str() {
            "sum" => Ok(ReduceOp::Sum),
            "max" => Ok(ReduceOp::Max),
            "avg" | "mean" => Ok(ReduceOp::Mean),
            other => Err(Error::invalid_option(
                layer,
                "mode",
                format!("expected sum, max, avg or mean, got '{other}'"),
            )),
        }
    }

    /// The input laid out as requested.
    fn input(&self, layer: &str, data: &TensorDescriptor) -> Result<TensorDescriptor> {
        if data.sparse {
            return Err(Error::unsupported(layer, format!("cannot reduce sparse data {}", data.name)));
        }
        match (self.enforce_batch_dim_axis, data.batch_axis) {
            (None, _) | (Some(0), None) | (Some(0), Some(0)) => Ok(data.clone()),
            (Some(0), Some(b)) => Ok(batch_to_front(data, b)),
            (Some(other), _) => Err(Error::invalid_option(
                layer,
                "enforce_batch_dim_axis",
                format!("only 0 or null are supported, got {other}"),
            )),
        }
    }

    /// Sorted physical axes to reduce.
    fn axes(&self, layer: &str, data: &TensorDescriptor) -> Result<Vec<usize>> {
        let rank = data.batch_ndim();
        let with_batch = |axes: Vec<usize>| -> Vec<usize> { axes.into_iter().map(|a| data.axis_with_batch(a)).collect() };
        let mut axes = match &self.axis {
            AxisSelection::One(a) => vec![wrap_axis(layer, *a, rank)?],
            AxisSelection::Many(list) => list
                .iter()
                .map(|a| wrap_axis(layer, *a, rank))
                .collect::<Result<Vec<_>>>()?,
            AxisSelection::Named(name) => match name.to_lowercase().as_str() {
                "b" | "batch" => data.batch_axis.into_iter().collect(),
                "t" | "time" => data.time_axis.into_iter().collect(),
                "spatial" => with_batch(data.dynamic_axes()),
                "spatial_except_time" => {
                    let time = data.time_axis_excluding_batch();
                    with_batch(data.dynamic_axes().into_iter().filter(|a| Some(*a) != time).collect())
                }
                "f" | "feature" => with_batch(data.non_dynamic_axes()),
                other => {
                    return Err(Error::invalid_option(layer, "axis", format!("unknown axis selection '{other}'")))
                }
            },
        };
        axes.sort_unstable();
        axes.dedup();
        if axes.is_empty() {
            return Err(Error::invalid_option(layer, "axis", format!("selects no axis of {data}")));
        }
        Ok(axes)
    }
}

fn wrap_axis(layer: &str, axis: i64, rank: usize) -> Result<usize> {
    let rank = rank as i64;
    if axis < -rank || axis >= rank {
        return Err(Error::invalid_option(layer, "axis", format!("{axis} is out of range for rank {rank}")));
    }
    Ok(axis.rem_euclid(rank) as usize)
}

/// Move the batch axis to the front, keeping the order of all other axes.
fn batch_to_front(data: &TensorDescriptor, batch: usize) -> TensorDescriptor {
    let mut perm = vec![batch];
    perm.extend((0..data.batch_ndim()).filter(|&a| a != batch));
    TensorDescriptor {
        batch_axis: Some(0),
        time_axis: data.time_axis.map(|t| if t < batch { t + 1 } else { t }),
        placeholder: data.placeholder.as_ref().map(|x| x.permute(perm)),
        ..data.clone()
    }
}

/// Descriptor after reducing the physical `axes` of `data`.
fn reduced(name: String, data: &TensorDescriptor, axes: &[usize], keep_dims: bool) -> TensorDescriptor {
    let gone = |p: usize| !keep_dims && axes.contains(&p);
    let new_index = |p: usize| (0..p).filter(|q| !gone(*q)).count();

    let mut shape = Vec::new();
    let mut lengths = BTreeMap::new();
    for a in 0..data.ndim() {
        let p = data.axis_with_batch(a);
        if gone(p) {
            continue;
        }
        let reduced_here = axes.contains(&p);
        match (data.shape[a], data.dynamic_lengths.get(&a)) {
            (Dim::Static(_), _) if reduced_here => shape.push(Dim::Static(1)),
            (dim, Some(len)) => {
                lengths.insert(shape.len(), if reduced_here { len.affine(0.0, 1.0) } else { len.clone() });
                shape.push(dim);
            }
            (dim, None) => shape.push(dim),
        }
    }
    let batch_axis = data.batch_axis.filter(|b| !gone(*b)).map(new_index);
    let time_axis = data.time_axis.filter(|t| !gone(*t)).map(new_index);
    let dim = shape.last().and_then(|d| d.size());
    TensorDescriptor {
        name,
        dtype: data.dtype,
        shape,
        dim,
        sparse: false,
        batch_axis,
        time_axis,
        dynamic_lengths: lengths,
        placeholder: None,
    }
}

/// `reduce`.
pub struct ReduceClass;

impl LayerClass for ReduceClass {
    fn kind(&self) -> &'static str {
        "reduce"
    }

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let opts: ReduceOpts = spec.options()?;
        opts.op(&spec.name)?;
        spec.forbid("n_out", spec.desc.n_out.is_some())?;
        spec.forbid("out_type", spec.desc.out_type.is_some())?;
        let mut data = opts.input(&spec.name, &concat_template(&spec.name, &spec.sources)?)?;
        data.dynamic_lengths.clear();
        let axes = opts.axes(&spec.name, &data)?;
        Ok(reduced(format!("{}_output", spec.name), &data, &axes, opts.keep_dims))
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let opts: ReduceOpts = spec.options()?;
        let op = opts.op(&spec.name)?;
        let input = concat_sources_with_dropout(net, &spec.name, &spec.sources, spec.desc.dropout)?;
        let data = opts.input(&spec.name, &input)?;
        let axes = opts.axes(&spec.name, &data)?;
        let lengths = reduced(output.name.clone(), &data, &axes, opts.keep_dims).dynamic_lengths;
        let y = data.placeholder()?.reduce(op, axes, opts.keep_dims);
        let mut base = LayerBase::new(self.kind(), spec, output);
        base.output.placeholder = Some(y);
        base.output.dynamic_lengths = lengths;
        Ok(PlainLayer::boxed(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wren_core::{Graph, LengthFeeds};

    fn opts(value: serde_json::Value) -> ReduceOpts {
        serde_json::from_value(value).unwrap()
    }

    /// (batch, time?, freq?, 40) with lengths on both dynamic axes.
    fn spectrogram(g: &Graph) -> TensorDescriptor {
        TensorDescriptor::dense("x", vec![Dim::Dynamic, Dim::Dynamic, Dim::Static(40)]).with_placeholders(g)
    }

    #[test]
    fn test_named_axes() {
        let g = Graph::new();
        let x = spectrogram(&g);
        let axes = |axis: &str| opts(json!({"mode": "sum", "axis": axis})).axes("r", &x).unwrap();
        assert_eq!(axes("batch"), vec![0]);
        assert_eq!(axes("T"), vec![1]);
        assert_eq!(axes("spatial"), vec![1, 2]);
        assert_eq!(axes("spatial_except_time"), vec![2]);
        assert_eq!(axes("F"), vec![3]);
        assert_eq!(opts(json!({"mode": "sum", "axis": -1})).axes("r", &x).unwrap(), vec![3]);
        assert!(opts(json!({"mode": "sum", "axis": "width"})).axes("r", &x).is_err());
    }

    #[test]
    fn test_removed_axis_renumbers_lengths() {
        let g = Graph::new();
        let x = spectrogram(&g);
        let out = reduced("out".into(), &x, &[1], false);
        assert_eq!(out.shape, vec![Dim::Dynamic, Dim::Static(40)]);
        assert_eq!(out.dynamic_lengths.len(), 1);
        assert_eq!(out.dynamic_lengths.get(&0), x.dynamic_lengths.get(&1));
        assert_eq!(out.time_axis, None);
        assert_eq!(out.batch_axis, Some(0));
        assert_eq!(out.dim, Some(40));
    }

    #[test]
    fn test_keep_dims_sets_lengths_to_one() {
        let g = Graph::new();
        let x = spectrogram(&g);
        let out = reduced("out".into(), &x, &[1, 3], true);
        assert_eq!(out.shape, vec![Dim::Dynamic, Dim::Dynamic, Dim::Static(1)]);
        assert_eq!(out.time_axis, Some(1));
        assert_eq!(out.dim, Some(1));
        let feeds = LengthFeeds::new()
            .with_lengths("x:size0", vec![4, 2])
            .with_lengths("x:size1", vec![9, 9]);
        assert_eq!(g.fold_lengths(&out.dynamic_lengths[&0], &feeds).unwrap(), vec![1, 1]);
        assert_eq!(out.dynamic_lengths.get(&1), x.dynamic_lengths.get(&1));
    }

    #[test]
    fn test_batch_moved_to_front() {
        let g = Graph::new();
        let x = spectrogram(&g).copy_as_time_major();
        let front = opts(json!({"mode": "max", "axis": "F"})).input("r", &x).unwrap();
        assert!(front.is_batch_major());
        assert_eq!(front.time_axis, Some(1));
        assert_eq!(front.placeholder.unwrap().op(), wren_core::Op::Transpose { perm: vec![1, 0, 2, 3] });
        let sparse = TensorDescriptor::sparse("y", vec![Dim::Dynamic], 4);
        assert!(opts(json!({"mode": "max", "axis": 1})).input("r", &sparse).is_err());
    }
}
