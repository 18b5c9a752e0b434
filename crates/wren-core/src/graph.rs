// Graph — The append-only symbolic op graph that construction emits
//
// The construction engine never computes values. Each layer appends nodes
// to a shared Graph and keeps Tensor handles (node ids) to them; the
// finished node list is what the external numeric engine executes.
//
// SHARING:
//
//   A Graph is a cheap handle (Rc<RefCell<..>>) so that every Tensor can
//   reach the graph it lives in, and so a nested subnetwork can append to
//   the same graph as its parent. Construction is single-threaded, so Rc is
//   enough; nothing here is Send.
//
// ORDERING:
//
//   Nodes are only ever appended, and a node's inputs must already exist
//   when it is pushed. The node order is therefore a topological order and
//   the graph cannot contain a cycle.
//
// LENGTH FOLDING:
//
//   Per-example sequence lengths are themselves small integer subgraphs
//   (slice start/end arithmetic, convolution shrinkage, ...).
//   `fold_lengths` evaluates such a subgraph for given fed lengths, which
//   lets callers check the length bookkeeping without an engine.

use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::op::{BinaryOp, CmpOp, Init, NodeId, Op, ReduceOp};
use crate::tensor::Tensor;

/// One recorded operation.
#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<NodeId>,
    pub dtype: DType,
}

#[derive(Debug, Default)]
struct GraphInner {
    nodes: Vec<Node>,
}

/// Shared handle to a symbolic op graph.
#[derive(Clone, Default)]
pub struct Graph {
    inner: Rc<RefCell<GraphInner>>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Graph({} nodes)", self.len())
    }
}

impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node. All inputs must belong to this graph.
    pub(crate) fn push(&self, op: Op, inputs: &[&Tensor], dtype: DType) -> Tensor {
        debug_assert!(inputs.iter().all(|t| t.graph() == self));
        let mut inner = self.inner.borrow_mut();
        let id = NodeId(inner.nodes.len());
        inner.nodes.push(Node {
            op,
            inputs: inputs.iter().map(|t| t.id()).collect(),
            dtype,
        });
        Tensor::from_parts(self.clone(), id)
    }

    /// Number of nodes recorded so far.
    pub fn len(&self) -> usize {
        self.inner.borrow().nodes.len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the node list (topologically ordered).
    pub fn nodes(&self) -> Ref<'_, [Node]> {
        Ref::map(self.inner.borrow(), |inner| inner.nodes.as_slice())
    }

    /// A copy of one node.
    pub fn node(&self, id: NodeId) -> Node {
        self.inner.borrow().nodes[id.0].clone()
    }

    /// Handle to an existing node.
    pub fn tensor(&self, id: NodeId) -> Tensor {
        Tensor::from_parts(self.clone(), id)
    }

    /// Count nodes whose op satisfies the predicate.
    pub fn count_ops(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.inner
            .borrow()
            .nodes
            .iter()
            .filter(|n| pred(&n.op))
            .count()
    }

    /// Whether any recorded op needs a user-defined backward function.
    pub fn requires_custom_gradients(&self) -> bool {
        self.count_ops(|op| matches!(op, Op::Custom { grad: Some(_), .. })) > 0
    }

    /// All parameter nodes as `(name, shape, trainable)`.
    pub fn params(&self) -> Vec<(String, Vec<usize>, bool)> {
        self.inner
            .borrow()
            .nodes
            .iter()
            .filter_map(|n| match &n.op {
                Op::Param {
                    name,
                    shape,
                    trainable,
                    ..
                } => Some((name.clone(), shape.clone(), *trainable)),
                _ => None,
            })
            .collect()
    }

    // Leaf constructors

    /// A value fed by the runner.
    pub fn placeholder(&self, key: impl Into<String>, dtype: DType, rank: usize) -> Tensor {
        self.push(
            Op::Placeholder {
                key: key.into(),
                rank,
            },
            &[],
            dtype,
        )
    }

    /// A layer variable.
    pub fn param(
        &self,
        name: impl Into<String>,
        shape: Vec<usize>,
        init: Init,
        trainable: bool,
        dtype: DType,
    ) -> Tensor {
        self.push(
            Op::Param {
                name: name.into(),
                shape,
                init,
                trainable,
            },
            &[],
            dtype,
        )
    }

    /// Scalar constant.
    pub fn constant(&self, value: f64, dtype: DType) -> Tensor {
        self.push(Op::Constant(value), &[], dtype)
    }

    /// Integer vector constant.
    pub fn constant_vec(&self, values: Vec<i64>) -> Tensor {
        self.push(Op::ConstantVec(values), &[], DType::I32)
    }

    /// Slot `index` of a scan body, bound by the engine at every step.
    pub fn loop_input(&self, index: usize, dtype: DType) -> Tensor {
        self.push(Op::LoopInput { index }, &[], dtype)
    }

    // Length folding

    /// Evaluate an integer length subgraph with the given feeds.
    ///
    /// Supports the ops the length bookkeeping uses: placeholders, integer
    /// constants, `dim_size` of a placeholder, elementwise arithmetic,
    /// affine, clamp, cast and full sums. Scalars broadcast against vectors.
    pub fn fold_lengths(&self, t: &Tensor, feeds: &LengthFeeds) -> Result<Vec<i64>> {
        let mut memo: HashMap<NodeId, Vec<i64>> = HashMap::new();
        self.fold_node(t.id(), feeds, &mut memo)
    }

    fn fold_node(
        &self,
        id: NodeId,
        feeds: &LengthFeeds,
        memo: &mut HashMap<NodeId, Vec<i64>>,
    ) -> Result<Vec<i64>> {
        if let Some(v) = memo.get(&id) {
            return Ok(v.clone());
        }
        let node = self.node(id);
        let arg = |i: usize, memo: &mut HashMap<NodeId, Vec<i64>>| -> Result<Vec<i64>> {
            let input = node
                .inputs
                .get(i)
                .ok_or_else(|| Error::msg(format!("node {} is missing input {i}", id.0)))?;
            self.fold_node(*input, feeds, memo)
        };
        let value = match &node.op {
            Op::Placeholder { key, .. } => feeds
                .lengths
                .get(key)
                .cloned()
                .ok_or_else(|| Error::msg(format!("no length feed for '{key}'")))?,
            Op::Constant(v) => vec![*v as i64],
            Op::ConstantVec(v) => v.clone(),
            Op::DimSize { axis } => {
                let src = self.node(node.inputs[0]);
                match &src.op {
                    Op::Placeholder { key, .. } => {
                        vec![*feeds.extents.get(&(key.clone(), *axis)).ok_or_else(|| {
                            Error::msg(format!("no extent feed for '{key}' axis {axis}"))
                        })?]
                    }
                    other => {
                        return Err(Error::msg(format!(
                            "cannot fold dim_size of a '{}' node",
                            other.name()
                        )))
                    }
                }
            }
            Op::Binary(op) => {
                let a = arg(0, memo)?;
                let b = arg(1, memo)?;
                broadcast(&a, &b, |x, y| match op {
                    BinaryOp::Add => Ok(x + y),
                    BinaryOp::Sub => Ok(x - y),
                    BinaryOp::Mul => Ok(x * y),
                    BinaryOp::FloorDiv if y == 0 => Err(Error::msg("division by zero")),
                    BinaryOp::FloorDiv => Ok(x.div_euclid(y)),
                    BinaryOp::Maximum => Ok(x.max(y)),
                    BinaryOp::Minimum => Ok(x.min(y)),
                    other => Err(Error::msg(format!("cannot fold {other:?}"))),
                })?
            }
            Op::Compare(op) => {
                let a = arg(0, memo)?;
                let b = arg(1, memo)?;
                broadcast(&a, &b, |x, y| {
                    let r = match op {
                        CmpOp::Eq => x == y,
                        CmpOp::Ne => x != y,
                        CmpOp::Lt => x < y,
                        CmpOp::Le => x <= y,
                        CmpOp::Gt => x > y,
                        CmpOp::Ge => x >= y,
                    };
                    Ok(r as i64)
                })?
            }
            Op::Affine { mul, add } => arg(0, memo)?
                .into_iter()
                .map(|x| (x as f64 * mul + add).round() as i64)
                .collect(),
            Op::Clamp { min, max } => arg(0, memo)?
                .into_iter()
                .map(|x| x.clamp(*min as i64, *max as i64))
                .collect(),
            Op::Cast(_) => arg(0, memo)?,
            Op::Reduce {
                op: ReduceOp::Sum, ..
            } => vec![arg(0, memo)?.iter().sum()],
            Op::Reduce {
                op: ReduceOp::Max, ..
            } => vec![arg(0, memo)?.iter().copied().max().unwrap_or(0)],
            other => {
                return Err(Error::msg(format!(
                    "cannot fold a '{}' node into lengths",
                    other.name()
                )))
            }
        };
        memo.insert(id, value.clone());
        Ok(value)
    }
}

fn broadcast(
    a: &[i64],
    b: &[i64],
    f: impl Fn(i64, i64) -> Result<i64>,
) -> Result<Vec<i64>> {
    match (a.len(), b.len()) {
        (1, _) => b.iter().map(|&y| f(a[0], y)).collect(),
        (_, 1) => a.iter().map(|&x| f(x, b[0])).collect(),
        (n, m) if n == m => a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect(),
        (n, m) => Err(Error::msg(format!(
            "cannot broadcast length vectors of size {n} and {m}"
        ))),
    }
}

/// Values fed to [`Graph::fold_lengths`].
#[derive(Debug, Clone, Default)]
pub struct LengthFeeds {
    /// Per-example lengths, keyed by placeholder key.
    pub lengths: HashMap<String, Vec<i64>>,
    /// Padded runtime extents, keyed by (placeholder key, axis).
    pub extents: HashMap<(String, usize), i64>,
}

impl LengthFeeds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed per-example lengths for a placeholder.
    pub fn with_lengths(mut self, key: impl Into<String>, lengths: Vec<i64>) -> Self {
        self.lengths.insert(key.into(), lengths);
        self
    }

    /// Feed the padded extent of one axis of a placeholder.
    pub fn with_extent(mut self, key: impl Into<String>, axis: usize, extent: i64) -> Self {
        self.extents.insert((key.into(), axis), extent);
        self
    }
}
