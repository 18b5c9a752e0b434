// TensorDescriptor — Shape, dtype and axis roles of one node's output
//
// A descriptor is created by a layer's shape inference as a TEMPLATE (no
// tensor handle yet) and completed once during construction, when the
// placeholder and the per-example lengths are attached.
//
// AXES:
//
//   `shape` lists every axis EXCEPT the batch axis. Indices into `shape`
//   are called "axes excluding batch"; `batch_axis` and `time_axis` are
//   indices into the full physical layout (batch included).
//
//   Example, batch-major sequence features:
//     physical layout  (batch, time, feature)
//     shape            [?, 40]
//     batch_axis       Some(0)
//     time_axis        Some(1)
//     dim              Some(40)
//     dynamic_lengths  {0: lengths}    (axis 0 excluding batch is time)
//
// SPARSE DATA:
//
//   Sparse data holds class indices. `dim` is the number of classes and
//   the class axis is NOT part of `shape` (nor of the physical layout):
//   sparse labels of a sequence have shape `[?]` and `ndim_dense() == 2`.
//
// The descriptor is treated as a value: consumers that need another axis
// convention derive a copy instead of mutating a shared one.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dim::{format_shape, Dim};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::tensor::Tensor;

/// Output description of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
    pub name: String,
    pub dtype: DType,
    /// All axes except batch.
    pub shape: Vec<Dim>,
    /// Feature width (dense) or class count (sparse).
    pub dim: Option<usize>,
    pub sparse: bool,
    /// Index in the physical layout, batch included.
    pub batch_axis: Option<usize>,
    /// Index in the physical layout, batch included.
    pub time_axis: Option<usize>,
    /// Per-example valid lengths, keyed by axis excluding batch.
    pub dynamic_lengths: BTreeMap<usize, Tensor>,
    pub placeholder: Option<Tensor>,
}

/// Field replacements for [`TensorDescriptor::derive`].
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub name: Option<String>,
    pub dtype: Option<DType>,
    pub shape: Option<Vec<Dim>>,
    pub dim: Option<Option<usize>>,
    pub sparse: Option<bool>,
    pub batch_axis: Option<Option<usize>>,
    pub time_axis: Option<Option<usize>>,
}

impl Overrides {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn shape(mut self, shape: Vec<Dim>) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn dim(mut self, dim: Option<usize>) -> Self {
        self.dim = Some(dim);
        self
    }

    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = Some(sparse);
        self
    }

    pub fn batch_axis(mut self, axis: Option<usize>) -> Self {
        self.batch_axis = Some(axis);
        self
    }

    pub fn time_axis(mut self, axis: Option<usize>) -> Self {
        self.time_axis = Some(axis);
        self
    }
}

impl TensorDescriptor {
    /// Dense batch-major data; `dim` is taken from the last axis.
    pub fn dense(name: impl Into<String>, shape: Vec<Dim>) -> Self {
        let dim = shape.last().and_then(|d| d.size());
        Self::new(name, shape, dim, false, DType::F32)
    }

    /// Sparse class indices with `dim` classes.
    pub fn sparse(name: impl Into<String>, shape: Vec<Dim>, dim: usize) -> Self {
        Self::new(name, shape, Some(dim), true, DType::I32)
    }

    /// Full constructor with default axis roles: batch first, time on the
    /// first dynamic axis.
    pub fn new(
        name: impl Into<String>,
        shape: Vec<Dim>,
        dim: Option<usize>,
        sparse: bool,
        dtype: DType,
    ) -> Self {
        let time_axis = shape.iter().position(|d| d.is_dynamic()).map(|a| a + 1);
        TensorDescriptor {
            name: name.into(),
            dtype,
            shape,
            dim,
            sparse,
            batch_axis: Some(0),
            time_axis,
            dynamic_lengths: BTreeMap::new(),
            placeholder: None,
        }
    }

    /// A scalar with no batch axis, used as a stand-in output.
    pub fn scalar(name: impl Into<String>, dtype: DType) -> Self {
        TensorDescriptor {
            batch_axis: None,
            time_axis: None,
            ..Self::new(name, Vec::new(), None, false, dtype)
        }
    }

    /// Copy with selected fields replaced.
    ///
    /// The copy is a template: it carries no placeholder. Dynamic lengths
    /// are kept when the axis pattern still matches.
    pub fn derive(&self, overrides: Overrides) -> Self {
        let mut out = TensorDescriptor {
            name: overrides.name.unwrap_or_else(|| self.name.clone()),
            dtype: overrides.dtype.unwrap_or(self.dtype),
            shape: overrides.shape.unwrap_or_else(|| self.shape.clone()),
            dim: overrides.dim.unwrap_or(self.dim),
            sparse: overrides.sparse.unwrap_or(self.sparse),
            batch_axis: overrides.batch_axis.unwrap_or(self.batch_axis),
            time_axis: overrides.time_axis.unwrap_or(self.time_axis),
            dynamic_lengths: BTreeMap::new(),
            placeholder: None,
        };
        if out.matches_axis_pattern(self) {
            out.dynamic_lengths = self.dynamic_lengths.clone();
        }
        out
    }

    /// Same descriptor without a placeholder.
    pub fn template(&self, name: impl Into<String>) -> Self {
        TensorDescriptor {
            name: name.into(),
            placeholder: None,
            ..self.clone()
        }
    }

    /// True iff batch/time roles and the static shape before the feature
    /// axis are identical, so per-axis lengths can be reused verbatim.
    pub fn matches_axis_pattern(&self, other: &TensorDescriptor) -> bool {
        self.batch_axis == other.batch_axis
            && self.time_axis == other.time_axis
            && self.non_feature_shape() == other.non_feature_shape()
    }

    fn non_feature_shape(&self) -> &[Dim] {
        if self.sparse || self.shape.is_empty() {
            &self.shape
        } else {
            &self.shape[..self.shape.len() - 1]
        }
    }

    /// Static extents of all axes except batch and the dynamic ones.
    pub fn non_dynamic_shape(&self) -> Vec<usize> {
        self.shape.iter().filter_map(|d| d.size()).collect()
    }

    /// Physical shape with 1 for the batch and every dynamic axis, suitable
    /// as a broadcast noise shape.
    pub fn non_dynamic_batch_shape(&self) -> Vec<usize> {
        let mut out: Vec<usize> = self.shape.iter().map(|d| d.size().unwrap_or(1)).collect();
        if let Some(b) = self.batch_axis {
            out.insert(b, 1);
        }
        out
    }

    /// Axes (excluding batch) without a static extent.
    pub fn dynamic_axes(&self) -> Vec<usize> {
        (0..self.shape.len())
            .filter(|&a| self.shape[a].is_dynamic())
            .collect()
    }

    /// Axes (excluding batch) with a static extent.
    pub fn non_dynamic_axes(&self) -> Vec<usize> {
        (0..self.shape.len())
            .filter(|&a| self.shape[a].is_static())
            .collect()
    }

    /// Number of axes excluding batch.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of physical axes.
    pub fn batch_ndim(&self) -> usize {
        self.shape.len() + usize::from(self.batch_axis.is_some())
    }

    /// Rank once sparse indices are expanded to one-hot.
    pub fn ndim_dense(&self) -> usize {
        self.ndim() + usize::from(self.sparse)
    }

    /// Physical shape, `None` for the batch and dynamic axes.
    pub fn batch_shape(&self) -> Vec<Option<usize>> {
        let mut out: Vec<Option<usize>> = self.shape.iter().map(|d| d.size()).collect();
        if let Some(b) = self.batch_axis {
            out.insert(b, None);
        }
        out
    }

    /// Physical index of the feature axis (dense data only).
    pub fn feature_axis(&self) -> Option<usize> {
        if self.sparse || self.shape.is_empty() {
            None
        } else {
            Some(self.batch_ndim() - 1)
        }
    }

    /// Convert a physical index into an axis excluding batch.
    pub fn axis_excluding_batch(&self, axis: usize) -> Option<usize> {
        match self.batch_axis {
            Some(b) if axis == b => None,
            Some(b) if axis > b => Some(axis - 1),
            _ => Some(axis),
        }
    }

    /// Convert an axis excluding batch into a physical index.
    pub fn axis_with_batch(&self, axis: usize) -> usize {
        match self.batch_axis {
            Some(b) if axis >= b => axis + 1,
            _ => axis,
        }
    }

    pub fn time_axis_excluding_batch(&self) -> Option<usize> {
        self.time_axis.and_then(|t| self.axis_excluding_batch(t))
    }

    pub fn is_time_major(&self) -> bool {
        self.time_axis == Some(0)
    }

    pub fn is_batch_major(&self) -> bool {
        self.batch_axis == Some(0)
    }

    /// Per-example lengths of the time axis.
    pub fn sequence_lengths(&self) -> Option<&Tensor> {
        self.time_axis_excluding_batch()
            .and_then(|t| self.dynamic_lengths.get(&t))
    }

    /// Placeholder, or an error naming the layer.
    pub fn placeholder(&self) -> Result<&Tensor> {
        self.placeholder
            .as_ref()
            .ok_or_else(|| Error::msg(format!("{} has no placeholder yet", self.description())))
    }

    /// Sequence lengths, or an error naming the layer.
    pub fn lengths(&self) -> Result<&Tensor> {
        self.sequence_lengths().ok_or_else(|| {
            Error::msg(format!(
                "{} has no sequence lengths on its time axis",
                self.description()
            ))
        })
    }

    /// Copy with batch and time exchanged so that batch is axis 0.
    pub fn copy_as_batch_major(&self) -> Self {
        self.copy_with_major(true)
    }

    /// Copy with batch and time exchanged so that time is axis 0.
    pub fn copy_as_time_major(&self) -> Self {
        self.copy_with_major(false)
    }

    fn copy_with_major(&self, batch_major: bool) -> Self {
        let (Some(b), Some(t)) = (self.batch_axis, self.time_axis) else {
            return self.clone();
        };
        if (batch_major && b == 0) || (!batch_major && t == 0) {
            return self.clone();
        }
        let (new_b, new_t) = if batch_major { (0, 1) } else { (1, 0) };
        // Shape excluding batch keeps time at axis 0 in both layouts.
        let t_ex = t - usize::from(t > b);
        let mut shape = self.shape.clone();
        let time_dim = shape.remove(t_ex);
        shape.insert(0, time_dim);
        let mut lengths = BTreeMap::new();
        for (axis, len) in &self.dynamic_lengths {
            let moved = match *axis {
                a if a == t_ex => 0,
                a if a < t_ex => a + 1,
                a => a,
            };
            lengths.insert(moved, len.clone());
        }
        let placeholder = self.placeholder.as_ref().map(|p| {
            let mut perm: Vec<usize> = (0..self.batch_ndim()).filter(|&a| a != b && a != t).collect();
            let (first, second) = if batch_major { (b, t) } else { (t, b) };
            perm.insert(0, second);
            perm.insert(0, first);
            p.permute(perm)
        });
        TensorDescriptor {
            shape,
            batch_axis: Some(new_b),
            time_axis: Some(new_t),
            dynamic_lengths: lengths,
            placeholder,
            ..self.clone()
        }
    }

    /// Check the structural invariants.
    pub fn validate(&self, layer: &str) -> Result<()> {
        for axis in self.dynamic_lengths.keys() {
            match self.shape.get(*axis) {
                Some(Dim::Dynamic) => {}
                Some(Dim::Static(n)) => {
                    return Err(Error::shape_mismatch(
                        layer,
                        format!("dynamic axis {axis}"),
                        format!("static axis of size {n} in {}", format_shape(&self.shape)),
                    ))
                }
                None => {
                    return Err(Error::shape_mismatch(
                        layer,
                        format!("axis {axis}"),
                        format!("shape {}", format_shape(&self.shape)),
                    ))
                }
            }
        }
        if self.sparse && self.dim.is_none() {
            return Err(Error::missing_shape(layer, "dim of sparse data"));
        }
        if !self.sparse {
            if let (Some(Dim::Static(last)), Some(dim)) = (self.shape.last(), self.dim) {
                if *last != dim {
                    return Err(Error::shape_mismatch(layer, format!("dim {dim}"), format!("feature axis {last}")));
                }
            }
        }
        Ok(())
    }

    /// Create placeholders for extern data: the values under key `name` and
    /// one length vector per dynamic axis under `name:size{axis}`.
    pub fn with_placeholders(mut self, graph: &Graph) -> Self {
        let rank = self.batch_ndim();
        self.placeholder = Some(graph.placeholder(self.name.clone(), self.dtype, rank));
        self.dynamic_lengths = self
            .dynamic_axes()
            .into_iter()
            .map(|axis| {
                let key = format!("{}:size{axis}", self.name);
                (axis, graph.placeholder(key, DType::I32, 1))
            })
            .collect();
        self
    }

    /// One-line description for logs and error messages.
    pub fn description(&self) -> String {
        let mut s = format!("Data(name='{}', shape={}", self.name, format_shape(&self.shape));
        if let Some(dim) = self.dim {
            s.push_str(&format!(", dim={dim}"));
        }
        if self.sparse {
            s.push_str(", sparse");
        }
        if self.dtype != DType::F32 {
            s.push_str(&format!(", dtype={}", self.dtype));
        }
        match self.batch_axis {
            Some(0) => {}
            Some(b) => s.push_str(&format!(", batch_axis={b}")),
            None => s.push_str(", no batch"),
        }
        if let Some(t) = self.time_axis {
            s.push_str(&format!(", time_axis={t}"));
        }
        s.push(')');
        s
    }
}

impl fmt::Display for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Serialized form of a descriptor (`out_type`, extern data declarations).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataOpts {
    #[serde(default)]
    pub shape: Option<Vec<Dim>>,
    #[serde(default)]
    pub dim: Option<usize>,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default)]
    pub dtype: Option<DType>,
    #[serde(default)]
    pub batch_dim_axis: Option<usize>,
    #[serde(default)]
    pub time_dim_axis: Option<usize>,
}

impl DataOpts {
    /// Build a descriptor.
    ///
    /// Without a shape, `(?, dim)` is assumed for dense and `(?)` for
    /// sparse data. Without either a shape or a dim this is a
    /// [`Error::MissingShape`].
    pub fn to_descriptor(&self, name: &str, layer: &str) -> Result<TensorDescriptor> {
        let shape = match (&self.shape, self.dim) {
            (Some(shape), _) => shape.clone(),
            (None, Some(_)) if self.sparse => vec![Dim::Dynamic],
            (None, Some(dim)) => vec![Dim::Dynamic, Dim::Static(dim)],
            (None, None) => return Err(Error::missing_shape(layer, "shape or dim")),
        };
        let dim = match self.dim {
            Some(dim) => Some(dim),
            None if self.sparse => return Err(Error::missing_shape(layer, "dim of sparse data")),
            None => shape.last().and_then(|d| d.size()),
        };
        let dtype = self
            .dtype
            .unwrap_or(if self.sparse { DType::I32 } else { DType::F32 });
        let mut d = TensorDescriptor::new(name, shape, dim, self.sparse, dtype);
        if let Some(b) = self.batch_dim_axis {
            d.batch_axis = Some(b);
        }
        if self.time_dim_axis.is_some() {
            d.time_axis = self.time_dim_axis;
        }
        d.validate(layer)?;
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feats(dim: usize) -> TensorDescriptor {
        TensorDescriptor::dense("data", vec![Dim::Dynamic, Dim::Static(dim)])
    }

    #[test]
    fn test_default_axes() {
        let d = feats(40);
        assert_eq!(d.batch_axis, Some(0));
        assert_eq!(d.time_axis, Some(1));
        assert_eq!(d.dim, Some(40));
        assert_eq!(d.batch_ndim(), 3);
        assert_eq!(d.feature_axis(), Some(2));
        assert_eq!(d.time_axis_excluding_batch(), Some(0));
        assert_eq!(d.batch_shape(), vec![None, None, Some(40)]);

        let s = TensorDescriptor::sparse("classes", vec![Dim::Dynamic], 10);
        assert_eq!(s.ndim(), 1);
        assert_eq!(s.ndim_dense(), 2);
        assert_eq!(s.feature_axis(), None);
    }

    #[test]
    fn test_derive_keeps_lengths_when_pattern_matches() {
        let g = Graph::new();
        let d = feats(5).with_placeholders(&g);
        let out = d.derive(Overrides::default().name("out").dim(Some(3)).shape(vec![Dim::Dynamic, Dim::Static(3)]));
        assert_eq!(out.dim, Some(3));
        assert!(out.placeholder.is_none());
        assert_eq!(out.dynamic_lengths, d.dynamic_lengths);

        let pooled = d.derive(Overrides::default().shape(vec![Dim::Static(1), Dim::Static(5)]));
        assert!(pooled.dynamic_lengths.is_empty());
    }

    #[test]
    fn test_axis_pattern() {
        assert!(feats(5).matches_axis_pattern(&feats(7)));
        let image = TensorDescriptor::dense("img", vec![Dim::Dynamic, Dim::Dynamic, Dim::Static(3)]);
        assert!(!feats(3).matches_axis_pattern(&image));
        let tm = feats(5).copy_as_time_major();
        assert!(!feats(5).matches_axis_pattern(&tm));
    }

    #[test]
    fn test_non_dynamic_shape() {
        let d = TensorDescriptor::dense("x", vec![Dim::Dynamic, Dim::Static(4), Dim::Static(8)]);
        assert_eq!(d.non_dynamic_shape(), vec![4, 8]);
        assert_eq!(d.non_dynamic_batch_shape(), vec![1, 1, 4, 8]);
        assert_eq!(d.dynamic_axes(), vec![0]);
        assert_eq!(d.non_dynamic_axes(), vec![1, 2]);
    }

    #[test]
    fn test_time_major_copy() {
        let g = Graph::new();
        let d = feats(5).with_placeholders(&g);
        let tm = d.copy_as_time_major();
        assert!(tm.is_time_major());
        assert_eq!(tm.batch_axis, Some(1));
        assert_eq!(tm.sequence_lengths(), d.sequence_lengths());
        let p = tm.placeholder.clone().unwrap();
        assert_eq!(p.op(), crate::op::Op::Transpose { perm: vec![1, 0, 2] });

        let back = tm.copy_as_batch_major();
        assert!(back.is_batch_major());
        assert_eq!(back.time_axis, Some(1));
    }

    #[test]
    fn test_validate_rejects_length_on_static_axis() {
        let g = Graph::new();
        let mut d = feats(5);
        d.dynamic_lengths.insert(1, g.placeholder("len", DType::I32, 1));
        assert!(matches!(d.validate("x"), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_data_opts() {
        let opts: DataOpts = serde_json::from_str(r#"{"dim": 10, "sparse": true}"#).unwrap();
        let d = opts.to_descriptor("classes", "extern_data").unwrap();
        assert!(d.sparse);
        assert_eq!(d.shape, vec![Dim::Dynamic]);
        assert_eq!(d.dtype, DType::I32);

        let opts: DataOpts = serde_json::from_str(r#"{"shape": [null, 7]}"#).unwrap();
        assert_eq!(opts.to_descriptor("x", "l").unwrap().dim, Some(7));

        let err = DataOpts::default().to_descriptor("x", "l").unwrap_err();
        assert!(matches!(err, Error::MissingShape { .. }));
        assert!(serde_json::from_str::<DataOpts>(r#"{"shap": [1]}"#).is_err());
    }

    #[test]
    fn test_description() {
        let d = TensorDescriptor::sparse("classes", vec![Dim::Dynamic], 10);
        assert_eq!(
            d.to_string(),
            "Data(name='classes', shape=(?), dim=10, sparse, dtype=int32, time_axis=1)"
        );
    }
}
