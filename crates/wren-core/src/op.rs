// Op — What a node of the symbolic graph computes
//
// Every tensor handle produced during construction records HOW it is to be
// computed by the numeric engine via the Op enum. Inputs are kept on the
// node (as NodeIds) rather than on the Op, so the node list itself is the
// edge list of the DAG.
//
// Example: y = x @ W + b
//   x.op = Placeholder { key: "data" }
//   W.op = Param { name: "output/W", shape: [5, 3] }
//   t.op = MatMul            inputs [x, W]
//   y.op = Binary(Add)       inputs [t, b]
//
// Multi-result operations (a recurrent scan returns the output sequence
// and the final state) produce one node, and `GetItem { index }` nodes
// project the individual results out of it.
//
// Ops are grouped below the way the engine will dispatch them: leaves,
// elementwise, structural, sequence handling, recurrent, objectives.

use crate::dtype::DType;

/// Index of a node in its [`Graph`](crate::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// How the engine should fill a parameter before the first step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// Every element is this value (zeros, ones, bias init).
    Constant(f64),
    /// Glorot/Xavier uniform with a fixed seed, the default for weights.
    XavierUniform { seed: u64 },
}

/// Elementwise single-input operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Log,
    Exp,
    Sqrt,
    Rsqrt,
    Square,
    Abs,
    Round,
    LogicalNot,
}

/// Elementwise two-input operations (numpy broadcasting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Maximum,
    Minimum,
    LogicalOr,
    LogicalAnd,
}

/// Elementwise comparisons, producing a boolean tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Reductions over a set of axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Max,
    Mean,
    Variance,
}

/// Padding policy shared by convolution and pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Padding {
    /// Output keeps the input's spatial extent.
    Same,
    /// Only full windows; each spatial extent shrinks by `window - 1`.
    Valid,
}

/// Window reduction for pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolMode {
    Max,
    Avg,
}

/// The operation recorded on a graph node.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // ── Leaves ──
    /// Fed by the runner: extern data, sequence lengths, a runtime train flag.
    Placeholder { key: String, rank: usize },
    /// A (possibly trainable) variable owned by a layer.
    Param {
        name: String,
        shape: Vec<usize>,
        init: Init,
        trainable: bool,
    },
    /// Scalar constant, broadcast wherever it is used.
    Constant(f64),
    /// Small integer vector constant.
    ConstantVec(Vec<i64>),
    /// The runtime extent of one axis of the input.
    DimSize { axis: usize },

    // ── Elementwise ──
    Unary(UnaryOp),
    /// A named activation function looked up by the engine.
    Activation(String),
    Binary(BinaryOp),
    Compare(CmpOp),
    /// `input * mul + add`.
    Affine { mul: f64, add: f64 },
    Clamp { min: f64, max: f64 },
    Cast(DType),
    /// inputs: `[mask, on_true, on_false]`.
    Where,
    /// Sum of all inputs.
    AddN,

    // ── Structural ──
    /// Contracts the last axis of the lhs with the first axis of the rhs.
    MatMul,
    /// inputs: `[table, indices]`, gathers rows of the table.
    EmbeddingLookup,
    Concat { axis: usize },
    Slice {
        axis: usize,
        start: Option<usize>,
        end: Option<usize>,
        step: usize,
    },
    Transpose { perm: Vec<usize> },
    ExpandDims { axis: usize },
    /// `None` entries are inferred (at most one) or copied from the input.
    Reshape { shape: Vec<Option<usize>> },
    Reduce {
        op: ReduceOp,
        axes: Vec<usize>,
        keep_dims: bool,
    },
    ArgMax { axis: usize },
    OneHot { depth: usize },
    /// inputs: `[values (n, dim), labels (n,)]`, picks `values[i, labels[i]]`.
    GatherLabels,
    /// inputs: `[values, mask]`, keeps the rows where mask is true.
    BooleanMask,

    // ── Convolution ──
    /// inputs: `[x (batch, spatial.., in), filters (spatial.., in, out)]`.
    Convolution {
        strides: Vec<usize>,
        dilation: Vec<usize>,
        padding: Padding,
    },
    Pool {
        mode: PoolMode,
        window: Vec<usize>,
        strides: Vec<usize>,
        dilation: Vec<usize>,
        padding: Padding,
    },

    // ── Sequences ──
    /// inputs: `[lengths, max_len]`, boolean mask of valid frames.
    SequenceMask { time_major: bool },
    /// inputs: `[x, lengths]`, reverses each example's valid prefix only.
    ReverseSequence { time_axis: usize, batch_axis: usize },
    /// inputs: `[x, lengths]`, packs (batch × time) into one axis, dropping padding.
    FlattenWithSeqLenMask { time_major: bool },
    /// Inverted dropout with a mask shared over the dynamic axes.
    Dropout {
        keep_prob: f64,
        noise_shape: Vec<usize>,
        seed: u64,
    },
    /// inputs: `[flag, on_true, on_false]`, evaluated lazily by the engine.
    Cond,
    /// inputs: `[param, delta]`, adds in place and returns the new value.
    AssignAdd,

    // ── Recurrent ──
    /// A slot inside a scan body, bound per step by the engine.
    LoopInput { index: usize },
    /// Runs a traced body once per time frame.
    ///
    /// inputs: `[x (time, batch, dim), lengths, initial_state..]`.
    /// `body_inputs[0]` is bound to frame `t` of x, the remaining ones to
    /// the carried state; `body_outputs[0]` is the frame output, the rest is
    /// the next state. Results: `[y, final_state..]`. A scalar initial
    /// state broadcasts to (batch, n).
    Scan {
        body_inputs: Vec<NodeId>,
        body_outputs: Vec<NodeId>,
    },
    /// A whole-sequence recurrent kernel. inputs: `[x, lengths, params.., initial_state..]`.
    FusedRnn {
        unit: String,
        n_hidden: usize,
        n_params: usize,
    },
    /// A native sequence kernel driven by a frame mask.
    /// inputs: `[x_projected, recurrent_weights, index, initial_state..]`.
    NativeRnn { unit: String, n_hidden: usize },
    /// Projects result `index` out of a multi-result node.
    GetItem { index: usize },

    // ── Objectives ──
    /// inputs: `[logits, labels]`, stable fused softmax + cross-entropy.
    SoftmaxCrossEntropy { sparse: bool },
    /// inputs: `[dense_labels, lengths]`, builds a sparse label sequence.
    SparseLabels { collapse_repeated: bool },
    /// inputs: `[logits, sparse_labels, lengths]`.
    CtcLoss { time_major: bool },
    /// inputs: `[logits (time, batch, dim), lengths]`.
    CtcGreedyDecode,
    /// inputs: `[hypothesis, truth]`.
    EditDistance { normalize: bool },
    /// `d sum(ys) / d xs`, inputs: `[ys, xs]`.
    Gradient,
    /// A user-defined op; `grad` names its registered backward function.
    Custom { name: String, grad: Option<String> },
    /// inputs: `[x]`, per-frame smoothness energy of the feature axis.
    SpatialSmoothingEnergy { dim: usize },
}

impl Op {
    /// Short name for logging and graph dumps.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Placeholder { .. } => "placeholder",
            Op::Param { .. } => "param",
            Op::Constant(_) => "constant",
            Op::ConstantVec(_) => "constant_vec",
            Op::DimSize { .. } => "dim_size",
            Op::Unary(_) => "unary",
            Op::Activation(_) => "activation",
            Op::Binary(_) => "binary",
            Op::Compare(_) => "compare",
            Op::Affine { .. } => "affine",
            Op::Clamp { .. } => "clamp",
            Op::Cast(_) => "cast",
            Op::Where => "where",
            Op::AddN => "add_n",
            Op::MatMul => "matmul",
            Op::EmbeddingLookup => "embedding_lookup",
            Op::Concat { .. } => "concat",
            Op::Slice { .. } => "slice",
            Op::Transpose { .. } => "transpose",
            Op::ExpandDims { .. } => "expand_dims",
            Op::Reshape { .. } => "reshape",
            Op::Reduce { .. } => "reduce",
            Op::ArgMax { .. } => "argmax",
            Op::OneHot { .. } => "one_hot",
            Op::GatherLabels => "gather_labels",
            Op::BooleanMask => "boolean_mask",
            Op::Convolution { .. } => "convolution",
            Op::Pool { .. } => "pool",
            Op::SequenceMask { .. } => "sequence_mask",
            Op::ReverseSequence { .. } => "reverse_sequence",
            Op::FlattenWithSeqLenMask { .. } => "flatten_with_seq_len_mask",
            Op::Dropout { .. } => "dropout",
            Op::Cond => "cond",
            Op::AssignAdd => "assign_add",
            Op::LoopInput { .. } => "loop_input",
            Op::Scan { .. } => "scan",
            Op::FusedRnn { .. } => "fused_rnn",
            Op::NativeRnn { .. } => "native_rnn",
            Op::GetItem { .. } => "get_item",
            Op::SoftmaxCrossEntropy { .. } => "softmax_cross_entropy",
            Op::SparseLabels { .. } => "sparse_labels",
            Op::CtcLoss { .. } => "ctc_loss",
            Op::CtcGreedyDecode => "ctc_greedy_decode",
            Op::EditDistance { .. } => "edit_distance",
            Op::Gradient => "gradient",
            Op::Custom { .. } => "custom",
            Op::SpatialSmoothingEnergy { .. } => "spatial_smoothing_energy",
        }
    }
}
