// Slice — `start:end:step` along one axis
//
// The axis is either a physical index (`axis`, batch included) or a role
// (`axis_kind`: "T" time, "B" batch, "F" feature). Static extents are
// sliced directly; a dynamic axis gets new per-example lengths:
//
//   len' = ceil(max(min(len, end) - start, 0) / step)
//
// e.g. length 5 sliced from start 7 is 0, never negative.

use serde::Deserialize;

use wren_core::{Error, Overrides, Result, Tensor, TensorDescriptor};

use crate::concat::concat_sources_with_dropout;
use crate::copy::concat_output;
use crate::layer::{Layer, LayerBase, LayerClass, LayerSpec, PlainLayer};
use crate::network::Network;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SliceOpts {
    axis: Option<i64>,
    axis_kind: Option<String>,
    slice_start: Option<i64>,
    slice_end: Option<i64>,
    slice_step: Option<i64>,
}

/// Resolved options: the physical axis and a non-negative range.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Range {
    axis: usize,
    start: Option<usize>,
    end: Option<usize>,
    step: usize,
}

impl SliceOpts {
    fn resolve(&self, layer: &str, input: &TensorDescriptor) -> Result<Range> {
        let axis = match (self.axis, self.axis_kind.as_deref()) {
            (Some(_), Some(_)) => {
                return Err(Error::invalid_option(layer, "axis_kind", "give either axis or axis_kind"))
            }
            (Some(a), None) => {
                let rank = input.batch_ndim() as i64;
                if !(0..rank).contains(&a) {
                    return Err(Error::invalid_option(layer, "axis", format!("{a} is out of range for {input}")));
                }
                a as usize
            }
            (None, Some(kind)) => axis_of_kind(layer, kind, input)?,
            (None, None) => return Err(Error::invalid_option(layer, "axis", "give either axis or axis_kind")),
        };
        let non_negative = |option: &str, v: Option<i64>| -> Result<Option<usize>> {
            match v {
                Some(v) if v < 0 => Err(Error::invalid_option(layer, option, format!("must not be negative, got {v}"))),
                Some(v) => Ok(Some(v as usize)),
                None => Ok(None),
            }
        };
        let step = match self.slice_step {
            Some(s) if s < 1 => {
                return Err(Error::invalid_option(layer, "slice_step", format!("must be positive, got {s}")))
            }
            Some(s) => s as usize,
            None => 1,
        };
        Ok(Range {
            axis,
            start: non_negative("slice_start", self.slice_start)?,
            end: non_negative("slice_end", self.slice_end)?,
            step,
        })
    }
}

fn axis_of_kind(layer: &str, kind: &str, input: &TensorDescriptor) -> Result<usize> {
    let axis = match kind.to_uppercase().as_str() {
        "T" => input.time_axis,
        "B" => input.batch_axis,
        "F" => input.feature_axis(),
        _ => {
            return Err(Error::invalid_option(
                layer,
                "axis_kind",
                format!("expected T, B or F, got '{kind}'"),
            ))
        }
    };
    axis.ok_or_else(|| Error::invalid_option(layer, "axis_kind", format!("{input} has no axis of kind {kind}")))
}

/// New valid lengths after slicing a dynamic axis.
fn sliced_lengths(lengths: &Tensor, range: &Range) -> Tensor {
    let mut out = lengths.clone();
    if let Some(end) = range.end {
        out = out.minimum_scalar(end as f64);
    }
    if let Some(start) = range.start.filter(|&s| s > 0) {
        out = out.sub_scalar(start as f64).maximum_scalar(0);
    }
    if range.step > 1 {
        out = out.add_scalar((range.step - 1) as f64).floor_div_scalar(range.step as f64);
    }
    out
}

/// `slice`.
pub struct SliceClass;

impl LayerClass for SliceClass {
    fn kind(&self) -> &'static str {
        "slice"
    }

    fn infer_output(&self, _net: &Network, spec: &LayerSpec) -> Result<TensorDescriptor> {
        let opts: SliceOpts = spec.options()?;
        let input = concat_output(spec)?;
        let range = opts.resolve(&spec.name, &input)?;
        let Some(axis) = input.axis_excluding_batch(range.axis) else {
            return Ok(input);
        };
        let mut shape = input.shape.clone();
        shape[axis] = shape[axis].sliced(range.start, range.end, range.step);
        let mut overrides = Overrides::default().shape(shape.clone());
        if !input.sparse && axis + 1 == shape.len() {
            overrides = overrides.dim(shape[axis].size());
        }
        let mut out = input.derive(overrides);
        out.dynamic_lengths = input.dynamic_lengths.clone();
        Ok(out)
    }

    fn build(&self, net: &mut Network, spec: LayerSpec, output: TensorDescriptor) -> Result<Box<dyn Layer>> {
        let opts: SliceOpts = spec.options()?;
        let data = concat_sources_with_dropout(net, &spec.name, &spec.sources, spec.desc.dropout)?;
        let range = opts.resolve(&spec.name, &data)?;
        let x = data.placeholder()?.slice(range.axis, range.start, range.end, range.step);
        let mut lengths = data.dynamic_lengths.clone();
        if let Some(axis) = data.axis_excluding_batch(range.axis) {
            if let Some(len) = lengths.get_mut(&axis) {
                *len = sliced_lengths(len, &range);
            }
        }
        let mut base = LayerBase::new(self.kind(), spec, output);
        base.output.placeholder = Some(x);
        base.output.dynamic_lengths = lengths;
        Ok(PlainLayer::boxed(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_core::{Dim, Graph, LengthFeeds};

    fn input() -> TensorDescriptor {
        TensorDescriptor::dense("data", vec![Dim::Dynamic, Dim::Static(10)])
    }

    #[test]
    fn test_resolve_axis_kinds() {
        let data = input();
        let opts = SliceOpts {
            axis_kind: Some("f".into()),
            ..SliceOpts::default()
        };
        assert_eq!(opts.resolve("s", &data).unwrap().axis, 2);
        let opts = SliceOpts {
            axis_kind: Some("T".into()),
            ..SliceOpts::default()
        };
        assert_eq!(opts.resolve("s", &data).unwrap().axis, 1);
    }

    #[test]
    fn test_negative_bounds_rejected() {
        let opts = SliceOpts {
            axis: Some(1),
            slice_start: Some(-2),
            ..SliceOpts::default()
        };
        assert!(matches!(
            opts.resolve("s", &input()),
            Err(Error::InvalidOption { option, .. }) if option == "slice_start"
        ));
        let opts = SliceOpts {
            axis: Some(1),
            slice_step: Some(0),
            ..SliceOpts::default()
        };
        assert!(opts.resolve("s", &input()).is_err());
    }

    #[test]
    fn test_sliced_lengths_clamp_and_step() {
        let g = Graph::new();
        let len = g.placeholder("data:size0", wren_core::DType::I32, 1);
        let feeds = LengthFeeds::new().with_lengths("data:size0", vec![5, 9, 12]);
        let from_7 = Range { axis: 1, start: Some(7), end: None, step: 1 };
        assert_eq!(g.fold_lengths(&sliced_lengths(&len, &from_7), &feeds).unwrap(), vec![0, 2, 5]);
        let every_2nd = Range { axis: 1, start: Some(1), end: Some(10), step: 2 };
        // min(len, 10) - 1 = [4, 8, 9] → ceil(/2) = [2, 4, 5]
        assert_eq!(g.fold_lengths(&sliced_lengths(&len, &every_2nd), &feeds).unwrap(), vec![2, 4, 5]);
    }
}
