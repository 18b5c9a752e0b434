use std::fmt;

use crate::dtype::DType;
use crate::graph::Graph;
use crate::op::{BinaryOp, CmpOp, NodeId, Op, Padding, PoolMode, ReduceOp, UnaryOp};

// Tensor — Handle to one node of the symbolic graph
//
// A Tensor does not hold data. It names a node of a Graph, and every method
// records a new node with this tensor as input and returns a handle to it:
//
//   let h = x.matmul(&w).add(&b).activation("tanh");
//
// appends three nodes (MatMul, Binary(Add), Activation) to x's graph.
//
// The method names follow the usual tensor-library vocabulary (add, sub,
// matmul, narrow, transpose, sum, argmax, ...) so that layer code reads the
// same as code that computes eagerly. Recording cannot fail: shape checks
// happen on the TensorDescriptor before anything is recorded.
//
// CLONING:
//
//   A Tensor is a graph handle plus a NodeId. Cloning is O(1) and two clones
//   compare equal, so descriptors can share handles freely.

/// Handle to a node in a [`Graph`].
#[derive(Clone)]
pub struct Tensor {
    graph: Graph,
    id: NodeId,
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.graph == other.graph
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(#{} {})", self.id.0, self.op().name())
    }
}

impl Tensor {
    pub(crate) fn from_parts(graph: Graph, id: NodeId) -> Self {
        Tensor { graph, id }
    }

    /// The node this handle points at.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The graph the node lives in.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// A copy of the recorded op.
    pub fn op(&self) -> Op {
        self.graph.node(self.id).op
    }

    /// Element type of the node's result.
    pub fn dtype(&self) -> DType {
        self.graph.node(self.id).dtype
    }

    /// Handles to the node's inputs.
    pub fn inputs(&self) -> Vec<Tensor> {
        self.graph
            .node(self.id)
            .inputs
            .into_iter()
            .map(|id| self.graph.tensor(id))
            .collect()
    }

    fn record(&self, op: Op, others: &[&Tensor], dtype: DType) -> Tensor {
        let mut inputs = Vec::with_capacity(others.len() + 1);
        inputs.push(self);
        inputs.extend_from_slice(others);
        self.graph.push(op, &inputs, dtype)
    }

    fn scalar(&self, v: f64) -> Tensor {
        self.graph.constant(v, self.dtype())
    }

    // Elementwise

    fn unary(&self, op: UnaryOp) -> Tensor {
        self.record(Op::Unary(op), &[], self.dtype())
    }

    fn binary(&self, op: BinaryOp, rhs: &Tensor) -> Tensor {
        self.record(Op::Binary(op), &[rhs], self.dtype())
    }

    fn compare(&self, op: CmpOp, rhs: &Tensor) -> Tensor {
        self.record(Op::Compare(op), &[rhs], DType::Bool)
    }

    pub fn add(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn mul(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::Mul, rhs)
    }

    pub fn div(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::Div, rhs)
    }

    pub fn floor_div(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::FloorDiv, rhs)
    }

    pub fn maximum(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::Maximum, rhs)
    }

    pub fn minimum(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::Minimum, rhs)
    }

    pub fn logical_or(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::LogicalOr, rhs)
    }

    pub fn logical_and(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::LogicalAnd, rhs)
    }

    pub fn add_scalar(&self, v: impl Into<f64>) -> Tensor {
        self.add(&self.scalar(v.into()))
    }

    pub fn sub_scalar(&self, v: impl Into<f64>) -> Tensor {
        self.sub(&self.scalar(v.into()))
    }

    pub fn mul_scalar(&self, v: impl Into<f64>) -> Tensor {
        self.mul(&self.scalar(v.into()))
    }

    pub fn floor_div_scalar(&self, v: impl Into<f64>) -> Tensor {
        self.floor_div(&self.scalar(v.into()))
    }

    pub fn maximum_scalar(&self, v: impl Into<f64>) -> Tensor {
        self.maximum(&self.scalar(v.into()))
    }

    pub fn minimum_scalar(&self, v: impl Into<f64>) -> Tensor {
        self.minimum(&self.scalar(v.into()))
    }

    /// `self * mul + add` as a single node.
    pub fn affine(&self, mul: f64, add: f64) -> Tensor {
        self.record(Op::Affine { mul, add }, &[], self.dtype())
    }

    pub fn clamp(&self, min: f64, max: f64) -> Tensor {
        self.record(Op::Clamp { min, max }, &[], self.dtype())
    }

    pub fn neg(&self) -> Tensor {
        self.unary(UnaryOp::Neg)
    }

    pub fn log(&self) -> Tensor {
        self.unary(UnaryOp::Log)
    }

    pub fn exp(&self) -> Tensor {
        self.unary(UnaryOp::Exp)
    }

    pub fn sqrt(&self) -> Tensor {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn rsqrt(&self) -> Tensor {
        self.unary(UnaryOp::Rsqrt)
    }

    pub fn square(&self) -> Tensor {
        self.unary(UnaryOp::Square)
    }

    pub fn abs(&self) -> Tensor {
        self.unary(UnaryOp::Abs)
    }

    pub fn round(&self) -> Tensor {
        self.unary(UnaryOp::Round)
    }

    pub fn logical_not(&self) -> Tensor {
        self.unary(UnaryOp::LogicalNot)
    }

    /// A named activation function, resolved by the executing engine.
    pub fn activation(&self, name: &str) -> Tensor {
        self.record(Op::Activation(name.to_string()), &[], self.dtype())
    }

    pub fn cast(&self, dtype: DType) -> Tensor {
        self.record(Op::Cast(dtype), &[], dtype)
    }

    pub fn eq(&self, rhs: &Tensor) -> Tensor {
        self.compare(CmpOp::Eq, rhs)
    }

    pub fn ne(&self, rhs: &Tensor) -> Tensor {
        self.compare(CmpOp::Ne, rhs)
    }

    pub fn lt(&self, rhs: &Tensor) -> Tensor {
        self.compare(CmpOp::Lt, rhs)
    }

    pub fn le(&self, rhs: &Tensor) -> Tensor {
        self.compare(CmpOp::Le, rhs)
    }

    pub fn gt(&self, rhs: &Tensor) -> Tensor {
        self.compare(CmpOp::Gt, rhs)
    }

    pub fn ge(&self, rhs: &Tensor) -> Tensor {
        self.compare(CmpOp::Ge, rhs)
    }

    /// Select from `on_true` where `mask` holds, else from `on_false`.
    pub fn where_cond(mask: &Tensor, on_true: &Tensor, on_false: &Tensor) -> Tensor {
        mask.record(Op::Where, &[on_true, on_false], on_true.dtype())
    }

    /// Sum of several same-shaped tensors.
    pub fn add_n(tensors: &[Tensor]) -> Option<Tensor> {
        match tensors {
            [] => None,
            [single] => Some(single.clone()),
            [first, rest @ ..] => {
                let rest: Vec<&Tensor> = rest.iter().collect();
                Some(first.record(Op::AddN, &rest, first.dtype()))
            }
        }
    }

    // Structural

    pub fn matmul(&self, rhs: &Tensor) -> Tensor {
        self.record(Op::MatMul, &[rhs], self.dtype())
    }

    /// Rows of `self` (a table) picked by integer `indices`.
    pub fn embedding_lookup(&self, indices: &Tensor) -> Tensor {
        self.record(Op::EmbeddingLookup, &[indices], self.dtype())
    }

    /// Concatenate along `axis`.
    pub fn cat(tensors: &[Tensor], axis: usize) -> Option<Tensor> {
        match tensors {
            [] => None,
            [single] => Some(single.clone()),
            [first, rest @ ..] => {
                let rest: Vec<&Tensor> = rest.iter().collect();
                Some(first.record(Op::Concat { axis }, &rest, first.dtype()))
            }
        }
    }

    /// Python-style `start:end:step` along one axis.
    pub fn slice(&self, axis: usize, start: Option<usize>, end: Option<usize>, step: usize) -> Tensor {
        self.record(
            Op::Slice {
                axis,
                start,
                end,
                step,
            },
            &[],
            self.dtype(),
        )
    }

    /// `len` elements starting at `start` along `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Tensor {
        self.slice(axis, Some(start), Some(start + len), 1)
    }

    pub fn permute(&self, perm: Vec<usize>) -> Tensor {
        self.record(Op::Transpose { perm }, &[], self.dtype())
    }

    /// Exchange two axes of a tensor of rank `rank`.
    pub fn swap_axes(&self, rank: usize, a: usize, b: usize) -> Tensor {
        let mut perm: Vec<usize> = (0..rank).collect();
        perm.swap(a, b);
        self.permute(perm)
    }

    pub fn expand_dims(&self, axis: usize) -> Tensor {
        self.record(Op::ExpandDims { axis }, &[], self.dtype())
    }

    /// Reshape; `None` entries are inferred by the engine.
    pub fn reshape(&self, shape: Vec<Option<usize>>) -> Tensor {
        self.record(Op::Reshape { shape }, &[], self.dtype())
    }

    pub fn reduce(&self, op: ReduceOp, axes: Vec<usize>, keep_dims: bool) -> Tensor {
        self.record(
            Op::Reduce {
                op,
                axes,
                keep_dims,
            },
            &[],
            self.dtype(),
        )
    }

    pub fn sum(&self, axis: usize, keep_dims: bool) -> Tensor {
        self.reduce(ReduceOp::Sum, vec![axis], keep_dims)
    }

    pub fn mean(&self, axis: usize, keep_dims: bool) -> Tensor {
        self.reduce(ReduceOp::Mean, vec![axis], keep_dims)
    }

    pub fn max(&self, axis: usize, keep_dims: bool) -> Tensor {
        self.reduce(ReduceOp::Max, vec![axis], keep_dims)
    }

    /// Reduce every axis to a scalar.
    pub fn sum_all(&self) -> Tensor {
        self.reduce(ReduceOp::Sum, Vec::new(), false)
    }

    pub fn argmax(&self, axis: usize) -> Tensor {
        self.record(Op::ArgMax { axis }, &[], DType::I32)
    }

    pub fn one_hot(&self, depth: usize, dtype: DType) -> Tensor {
        self.record(Op::OneHot { depth }, &[], dtype)
    }

    /// `self[i, labels[i]]` for a (n, dim) tensor.
    pub fn gather_labels(&self, labels: &Tensor) -> Tensor {
        self.record(Op::GatherLabels, &[labels], self.dtype())
    }

    pub fn boolean_mask(&self, mask: &Tensor) -> Tensor {
        self.record(Op::BooleanMask, &[mask], self.dtype())
    }

    /// Runtime extent of `axis` as an int32 scalar.
    pub fn dim_size(&self, axis: usize) -> Tensor {
        self.record(Op::DimSize { axis }, &[], DType::I32)
    }

    // Convolution

    pub fn conv(
        &self,
        filters: &Tensor,
        strides: Vec<usize>,
        dilation: Vec<usize>,
        padding: Padding,
    ) -> Tensor {
        self.record(
            Op::Convolution {
                strides,
                dilation,
                padding,
            },
            &[filters],
            self.dtype(),
        )
    }

    pub fn pool(
        &self,
        mode: PoolMode,
        window: Vec<usize>,
        strides: Vec<usize>,
        dilation: Vec<usize>,
        padding: Padding,
    ) -> Tensor {
        self.record(
            Op::Pool {
                mode,
                window,
                strides,
                dilation,
                padding,
            },
            &[],
            self.dtype(),
        )
    }

    // Sequences

    /// Boolean mask of valid frames for `self` as a length vector.
    pub fn sequence_mask(&self, max_len: &Tensor, time_major: bool) -> Tensor {
        self.record(Op::SequenceMask { time_major }, &[max_len], DType::Bool)
    }

    /// Reverse each example's valid prefix along `time_axis`.
    pub fn reverse_sequence(&self, lengths: &Tensor, time_axis: usize, batch_axis: usize) -> Tensor {
        self.record(
            Op::ReverseSequence {
                time_axis,
                batch_axis,
            },
            &[lengths],
            self.dtype(),
        )
    }

    /// Pack (batch, time) into one axis, dropping frames past each length.
    pub fn flatten_with_seq_len_mask(&self, lengths: &Tensor, time_major: bool) -> Tensor {
        self.record(
            Op::FlattenWithSeqLenMask { time_major },
            &[lengths],
            self.dtype(),
        )
    }

    pub fn dropout(&self, keep_prob: f64, noise_shape: Vec<usize>, seed: u64) -> Tensor {
        self.record(
            Op::Dropout {
                keep_prob,
                noise_shape,
                seed,
            },
            &[],
            self.dtype(),
        )
    }

    /// Lazily pick `on_true` or `on_false` depending on a boolean scalar.
    pub fn cond(flag: &Tensor, on_true: &Tensor, on_false: &Tensor) -> Tensor {
        flag.record(Op::Cond, &[on_true, on_false], on_true.dtype())
    }

    /// Add `delta` into a parameter in place.
    pub fn assign_add(&self, delta: &Tensor) -> Tensor {
        self.record(Op::AssignAdd, &[delta], self.dtype())
    }

    /// Run the traced body `body_outputs(body_inputs)` over the frames of
    /// `self` (time-major). Project the results with [`Tensor::get_item`].
    pub fn scan(
        &self,
        lengths: &Tensor,
        initial_state: &[Tensor],
        body_inputs: &[Tensor],
        body_outputs: &[Tensor],
    ) -> Tensor {
        let mut inputs = vec![lengths];
        inputs.extend(initial_state);
        self.record(
            Op::Scan {
                body_inputs: body_inputs.iter().map(Tensor::id).collect(),
                body_outputs: body_outputs.iter().map(Tensor::id).collect(),
            },
            &inputs,
            self.dtype(),
        )
    }

    /// Project result `index` out of a multi-result node.
    pub fn get_item(&self, index: usize, dtype: DType) -> Tensor {
        self.record(Op::GetItem { index }, &[], dtype)
    }

    /// Record an arbitrary op on `self` and `others`.
    pub fn apply(&self, op: Op, others: &[&Tensor], dtype: DType) -> Tensor {
        self.record(op, others, dtype)
    }
}
