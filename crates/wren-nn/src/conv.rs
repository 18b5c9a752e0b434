// Convolution and pooling over the spatial axes of the sources
//
// The input is brought into the layout
//
//   (batch, spatial_1, .., spatial_k, feature)
//
// where every axis between batch and feature counts as spatial, static or
// dynamic. k must equal the number of window entries (`filter_size` /
// `pool_size`), so 1D, 2D and 3D windows work the same way. Inputs with
// fewer axes can be reshaped first (conv only):
//
//   input_split_feature_dim: k   (.., n)  → (.., n/k, k)
//   input_add_feature_dim:  true (.., n)  → (.., n, 1)
//   input_expand_dims:      e    (.., n)  → (.., 1 × e, n)
//
// OUTPUT EXTENTS (window f, dilation d, stride s):
//
//   same:   out = ceil(in / s)
//   valid:  out = ceil(max(in - (f - 1) * d, 0) / s)
//
// Static axes get the new extent at inference time; dynamic axes keep
// their role and get new per-example lengths with the same formula.

use serde::Deserialize;

use wren_core::{Dim, Error, Padding, PoolMode, Result, Tensor, TensorDescriptor};

use crate::concat::{concat_sources_with_dropout, concat_template};
use crate::init;
use crate::layer::{feature_dim, Layer, LayerBase, LayerClass, LayerSpec, PlainLayer};
use crate::network::Network;

/// A per-axis option given once for all axes or as a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PerAxis {
    One(usize),
    Many(Vec<usize>),
}

fn per_axis(layer: &str, option: &str, value: Option<&PerAxis>, default: &[usize]) -> Result<Vec<usize>> {
    let out = match value {
        None => default.to_vec(),
        Some(PerAxis::One(v)) => vec![*v; default.len()],
        Some(PerAxis::Many(v)) if v.len() == default.len() => v.clone(),
        Some(PerAxis::Many(v)) => {
            return Err(Error::invalid_option(
                layer,
                option,
                format!("expected {} entries, got {}", default.len(), v.len()),
            ))
        }
    };
    if out.contains(&0) {
        return Err(Error::invalid_option(layer, option, "entries must be positive"));
    }
    Ok(out)
}

fn parse_padding(layer: &str, padding: &str) -> Result<Padding> {
    match padding.to_lowercase().as_str() {
        "same" => Ok(Padding::Same),
        "valid" => Ok(Padding::Valid),
        other => Err(Error::invalid_option(
            layer,
            "padding",
            format!("expected 'same' or 'valid', got '{other}'"),
        )),
    }
}

/// Window geometry shared by conv and pool.
#[derive(Debug, Clone, PartialEq)]
struct Window {
    size: Vec<usize>,
    strides: Vec<usize>,
    dilation: Vec<usize>,
    padding: Padding,
}

impl Window {
    fn shrink(&self, axis: usize) -> usize {
        match self.padding {
            Padding::Same => 0,
            Padding::Valid => (self.size[axis] - 1) * self.dilation[axis],
        }
    }

    fn out_dim(&self, axis: usize, dim: Dim) -> Dim {
        match dim {
            Dim::Static(n) => Dim::Static(n.saturating_sub(self.shrink(axis)).div_ceil(self.strides[axis])),
            Dim::Dynamic => Dim::Dynamic,
        }
    }

    fn out_lengths(&self, axis: usize, lengths: &Tensor) -> Tensor {
        let mut out = lengths.clone();
        let shrink = self.shrink(axis);
        if shrink > 0 {
            out = out.sub_scalar(shrink as f64).maximum_scalar(0);
        }
        let stride = self.strides[axis];
        if stride > 1 {
            out = out.add_scalar((stride - 1) as f64).floor_div_scalar(stride as f64);
        }
        out
    }

    /// Output descriptor over the prepared input `data`, lengths included
    /// when `data` carries them.
    fn output(&self, layer: &str, data: &TensorDescriptor, dim: usize) -> Result<TensorDescriptor> {
        let spatial = data.shape.len() - 1;
        if spatial != self.size.len() {
            return Err(Error::shape_mismatch(
                layer,
                format!("{} spatial axes for a window of {:?}", self.size.len(), self.size),
                data.description(),
            ));
        }
        let mut shape: Vec<Dim> = (0..spatial).map(|a| self.out_dim(a, data.shape[a])).collect();
        shape.push(Dim::Static(dim));
        let mut out = TensorDescriptor::new(format!("{layer}_output"), shape, Some(dim), false, data.dtype);
        for (axis, len) in &data.dynamic_lengths {
            if *axis < spatial {
                out.dynamic_lengths.insert(*axis, self.out_lengths(*axis, len));
            }
        }
        Ok(out)
    }
}

/// Reshaping of the input before the window is applied.
#[derive(Debug, Clone, Copy, Default)]
struct InputManip {
    split_feature_dim: Option<usize>,
    add_feature_dim: bool,
    expand_dims: usize,
}

/// Bring `data` into (batch, spatial.., feature) layout. Works on templates
/// as well as on built descriptors.
fn prepare_input(layer: &str, data: &TensorDescriptor, manip: InputManip) -> Result<TensorDescriptor> {
    if data.sparse {
        return Err(Error::unsupported(layer, format!("cannot convolve sparse data {}", data.name)));
    }
    let mut data = data.copy_as_batch_major();
    if !data.is_batch_major() {
        return Err(Error::unsupported(layer, format!("{data} has no leading batch axis")));
    }
    let mut feature = feature_dim(layer, &data)?;
    if let Some(k) = manip.split_feature_dim {
        if k == 0 || feature % k != 0 {
            return Err(Error::invalid_option(
                layer,
                "input_split_feature_dim",
                format!("{k} does not divide the feature dim {feature}"),
            ));
        }
        let mut target = data.batch_shape();
        target.pop();
        target.extend([Some(feature / k), Some(k)]);
        data.placeholder = data.placeholder.map(|x| x.reshape(target));
        data.shape.pop();
        data.shape.extend([Dim::Static(feature / k), Dim::Static(k)]);
        feature = k;
    }
    if manip.add_feature_dim {
        let rank = data.batch_ndim();
        data.placeholder = data.placeholder.map(|x| x.expand_dims(rank));
        data.shape.push(Dim::Static(1));
        feature = 1;
    }
    for _ in 0..manip.expand_dims {
        let before_feature = data.batch_ndim() - 1;
        data.placeholder = data.placeholder.map(|x| x.expand_dims(before_feature));
        data.shape.insert(data.shape.len() - 1, Dim::Static(1));
    }
    data.dim = Some(feature);
    Ok(data)
}

fn default_padding_same() -> String {
    "same".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConvOpts {
    filter_size: Vec<usize>,
    #[serde(default = "default_padding_same")]
    padding: String,
    #[serde(default)]
    strides: Option<PerAxis>,
    #[serde(default)]
    dilation_rate: Option<PerAxis>,
    #[serde(default)]
    input_expand_dims: usize,
    #[serde(default)]
    input_add_feature_dim: bool,
    #[serde(default)]
    input_split_feature_dim: Option<usize>,
    #[serde(default)]
    with_bias: bool,
    #[serde(default)]
    activation: Option<String>,
}

impl ConvOpts {
    fn window(&self, layer: &str) -> Result<Window> {
        if self.filter_size.is_empty() || self.filter_size.len() > 3 || self.filter_size.contains(&0) {
            return Err(Error::invalid_option(
                layer,
                "filter_size",
                format!("expected 1 to 3 positive entries, got {:?}", self.filter_size),
            ));
        }
        let ones = vec![1; self.filter_size.len()];
        Ok(Window {
            size: self.filter_size.clone(),
            strides: per_axis(layer, "strides", self.strides.as_ref(), &ones)?,
            dilation: per_axis(layer, "dilation_rate", self.dilation_rate.as_ref(), &ones)?,
            padding: parse_padding(layer, &self.padding)?,
        })
    }

    fn manip(&self) -> InputManip {
        InputManip {
            split_feature_dim: self.input_split_feature_dim,
            add_feature_dim: self.input_add_feature_dim,
            expand_dims: self.input_expand_dims,
        }
    }
}

fn conv_n_out(spec: &LayerSpec) -> Result<usize> {
    spec.forbid("out_type", spec.desc.out_type.is_some())?;
    spec.desc
        .n_out
        .or_else(|| spec.target_data.as_ref().and_then(|t| t.dim))
        .ok_or_else(|| Error::missing_shape(&spec.name, "n_out"))
}

/// `conv`.
pub struct ConvClass;

impl LayerClass for ConvClass {
    fn kind(&self) -> &'static str {
        "conv"
    }

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let opts: ConvOpts = spec.options()?;
        let window = opts.window(&spec.name)?;
        let n_out = conv_n_out(spec)?;
        let input = concat_template(&spec.name, &spec.sources)?.template("conv_input");
        let mut data = prepare_input(&spec.name, &input, opts.manip())?;
        data.dynamic_lengths.clear();
        window.output(&spec.name, &data, n_out)
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let opts: ConvOpts = spec.options()?;
        let window = opts.window(&spec.name)?;
        let activation = net.activation(&spec.name, opts.activation.as_deref())?;
        let n_out = feature_dim(&spec.name, &output)?;
        let input = concat_sources_with_dropout(net, &spec.name, &spec.sources, spec.desc.dropout)?;
        let data = prepare_input(&spec.name, &input, opts.manip())?;
        let n_in = feature_dim(&spec.name, &data)?;
        let lengths = window.output(&spec.name, &data, n_out)?.dynamic_lengths;
        let x = data.placeholder()?.clone();

        let mut filter_shape = window.size.clone();
        filter_shape.extend([n_in, n_out]);
        let w_init = init::xavier_uniform(net.rng());
        let mut base = LayerBase::new(self.kind(), spec, output);
        base.recurrent = true;
        let w = base.add_param(net, "W", filter_shape, w_init, true);
        let mut y = x.conv(&w, window.strides.clone(), window.dilation.clone(), window.padding);
        if opts.with_bias {
            let b = base.add_param(net, "bias", vec![n_out], init::zeros(), true);
            y = y.add(&b);
        }
        base.output.dynamic_lengths = lengths;
        base.set_activation_output(y, activation);
        Ok(PlainLayer::boxed(base))
    }
}

fn default_padding_valid() -> String {
    "valid".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolOpts {
    mode: String,
    pool_size: Vec<usize>,
    #[serde(default = "default_padding_valid")]
    padding: String,
    #[serde(default)]
    dilation_rate: Option<PerAxis>,
    #[serde(default)]
    strides: Option<PerAxis>,
}

impl PoolOpts {
    fn mode(&self, layer: &str) -> Result<PoolMode> {
        match self.mode.as_str() {
            "max" => Ok(PoolMode::Max),
            "avg" => Ok(PoolMode::Avg),
            other => Err(Error::invalid_option(layer, "mode", format!("expected 'max' or 'avg', got '{other}'"))),
        }
    }

    fn window(&self, layer: &str) -> Result<Window> {
        if self.pool_size.is_empty() || self.pool_size.contains(&0) {
            return Err(Error::invalid_option(layer, "pool_size", "expected positive entries"));
        }
        let ones = vec![1; self.pool_size.len()];
        Ok(Window {
            size: self.pool_size.clone(),
            strides: per_axis(layer, "strides", self.strides.as_ref(), &self.pool_size)?,
            dilation: per_axis(layer, "dilation_rate", self.dilation_rate.as_ref(), &ones)?,
            padding: parse_padding(layer, &self.padding)?,
        })
    }
}

/// `pool`: a parameter-free window reduction.
pub struct PoolClass;

impl LayerClass for PoolClass {
    fn kind(&self) -> &'static str {
        "pool"
    }

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let opts: PoolOpts = spec.options()?;
        opts.mode(&spec.name)?;
        let window = opts.window(&spec.name)?;
        spec.forbid("out_type", spec.desc.out_type.is_some())?;
        let input = concat_template(&spec.name, &spec.sources)?.template("pool_input");
        let mut data = prepare_input(&spec.name, &input, InputManip::default())?;
        data.dynamic_lengths.clear();
        let dim = feature_dim(&spec.name, &data)?;
        if let Some(n) = spec.desc.n_out.filter(|n| *n != dim) {
            return Err(Error::shape_mismatch(&spec.name, format!("n_out {n}"), format!("pooled dim {dim}")));
        }
        window.output(&spec.name, &data, dim)
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let opts: PoolOpts = spec.options()?;
        let mode = opts.mode(&spec.name)?;
        let window = opts.window(&spec.name)?;
        let input = concat_sources_with_dropout(net, &spec.name, &spec.sources, spec.desc.dropout)?;
        let data = prepare_input(&spec.name, &input, InputManip::default())?;
        let dim = feature_dim(&spec.name, &data)?;
        let lengths = window.output(&spec.name, &data, dim)?.dynamic_lengths;
        let y = data.placeholder()?.pool(
            mode,
            window.size.clone(),
            window.strides.clone(),
            window.dilation.clone(),
            window.padding,
        );
        let mut base = LayerBase::new(self.kind(), spec, output);
        base.recurrent = true;
        base.output.placeholder = Some(y);
        base.output.dynamic_lengths = lengths;
        Ok(PlainLayer::boxed(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wren_core::{DType, Graph, LengthFeeds};

    fn window(size: Vec<usize>, strides: Vec<usize>, padding: Padding) -> Window {
        let dilation = vec![1; size.len()];
        Window {
            size,
            strides,
            dilation,
            padding,
        }
    }

    #[test]
    fn test_static_out_dims() {
        let w = window(vec![3], vec![1], Padding::Valid);
        assert_eq!(w.out_dim(0, Dim::Static(10)), Dim::Static(8));
        assert_eq!(w.out_dim(0, Dim::Static(2)), Dim::Static(0));
        let w = window(vec![2], vec![2], Padding::Same);
        assert_eq!(w.out_dim(0, Dim::Static(5)), Dim::Static(3));
        assert_eq!(w.out_dim(0, Dim::Dynamic), Dim::Dynamic);
    }

    #[test]
    fn test_valid_padding_shrinks_lengths() {
        let g = Graph::new();
        let len = g.placeholder("x:size0", DType::I32, 1);
        let feeds = LengthFeeds::new().with_lengths("x:size0", vec![7, 3, 1]);
        let w = window(vec![3], vec![1], Padding::Valid);
        assert_eq!(g.fold_lengths(&w.out_lengths(0, &len), &feeds).unwrap(), vec![5, 1, 0]);
        let w = window(vec![2], vec![2], Padding::Valid);
        // len - 1 = [6, 2, 0] → ceil(/2)
        assert_eq!(g.fold_lengths(&w.out_lengths(0, &len), &feeds).unwrap(), vec![3, 1, 0]);
    }

    #[test]
    fn test_prepare_input_reshapes() {
        let data = TensorDescriptor::dense("x", vec![Dim::Dynamic, Dim::Static(12)]);
        let split = InputManip {
            split_feature_dim: Some(4),
            ..InputManip::default()
        };
        let prepared = prepare_input("c", &data, split).unwrap();
        assert_eq!(prepared.shape, vec![Dim::Dynamic, Dim::Static(3), Dim::Static(4)]);
        assert_eq!(prepared.dim, Some(4));

        let add = InputManip {
            add_feature_dim: true,
            ..InputManip::default()
        };
        let prepared = prepare_input("c", &data, add).unwrap();
        assert_eq!(prepared.shape, vec![Dim::Dynamic, Dim::Static(12), Dim::Static(1)]);

        let bad = InputManip {
            split_feature_dim: Some(5),
            ..InputManip::default()
        };
        assert!(matches!(prepare_input("c", &data, bad), Err(Error::InvalidOption { .. })));
    }

    #[test]
    fn test_window_rank_must_match() {
        let data = TensorDescriptor::dense("x", vec![Dim::Dynamic, Dim::Static(12)]);
        let w = window(vec![3, 3], vec![1, 1], Padding::Same);
        assert!(matches!(w.output("c", &data, 8), Err(Error::ShapeMismatch { .. })));
        let w = window(vec![3], vec![1], Padding::Same);
        let out = w.output("c", &data, 8).unwrap();
        assert_eq!(out.shape, vec![Dim::Dynamic, Dim::Static(8)]);
        assert_eq!(out.time_axis, Some(1));
    }

    #[test]
    fn test_pool_strides_default_to_window() {
        let opts: PoolOpts = serde_json::from_value(json!({"mode": "max", "pool_size": [2]})).unwrap();
        let w = opts.window("p").unwrap();
        assert_eq!(w.strides, vec![2]);
        assert_eq!(w.padding, Padding::Valid);
        let opts: PoolOpts = serde_json::from_value(json!({"mode": "min", "pool_size": [2]})).unwrap();
        assert!(opts.mode("p").is_err());
    }
}
