// Recurrent cells — the units a `rec` layer can run
//
//   unit                      kind     gates   carried state
//   rnn, basicrnn             step     1       h
//   lstmblock, basiclstm      step     4       c, h
//   gru                       step     3       h
//   lstmblockfused            fused    4       c, h
//   nativelstm                native   4       c, h
//
// Step cells record a single frame (`Cell::step`) and are unrolled by a
// scan; fused and native cells hand the whole sequence to one engine
// kernel. Every cell owns three parameters:
//
//   W     [n_in, gates * n]   input projection (absent without one)
//   W_re  [n, gates * n]      recurrent weights
//   b     [gates * n]
//
// LSTM:  g = x W + h W_re + b;  i, f, z, o = split(g, 4)
//        c' = sigmoid(f) * c + sigmoid(i) * tanh(z)
//        h' = sigmoid(o) * tanh(c')
// GRU:   gx = x W + b;  gh = h W_re;  r, u, z = split(·, 3)
//        r = sigmoid(gx_r + gh_r);  u = sigmoid(gx_u + gh_u)
//        z = tanh(gx_z + r * gh_z)
//        h' = (1 - u) * z + u * h

use std::fmt;

use wren_core::{Error, Op, Result, Tensor};

use super::unroll::{LoopOutput, StepLoop};
use crate::init;
use crate::layer::LayerBase;
use crate::network::Network;

/// How the engine drives a cell over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// One frame per call, unrolled by a scan.
    Step,
    /// The whole sequence in one kernel.
    Fused,
    /// A native sequence op driven by a frame mask.
    Native,
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellKind::Step => write!(f, "step"),
            CellKind::Fused => write!(f, "fused"),
            CellKind::Native => write!(f, "native"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Rnn,
    Lstm,
    Gru,
    FusedLstm,
    NativeLstm,
}

impl Unit {
    /// Resolve a unit name. `lstm` picks the native kernel unless a step
    /// cell is needed.
    pub fn from_name(name: &str, needs_step: bool) -> Result<Unit> {
        match name.to_lowercase().as_str() {
            "lstm" if needs_step => Ok(Unit::Lstm),
            "lstm" | "nativelstm" => Ok(Unit::NativeLstm),
            "rnn" | "basicrnn" => Ok(Unit::Rnn),
            "lstmblock" | "basiclstm" => Ok(Unit::Lstm),
            "gru" => Ok(Unit::Gru),
            "lstmblockfused" => Ok(Unit::FusedLstm),
            _ => Err(Error::UnknownCell { name: name.to_string() }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Unit::Rnn => "rnn",
            Unit::Lstm => "lstmblock",
            Unit::Gru => "gru",
            Unit::FusedLstm => "lstmblockfused",
            Unit::NativeLstm => "nativelstm",
        }
    }

    pub fn kind(self) -> CellKind {
        match self {
            Unit::Rnn | Unit::Lstm | Unit::Gru => CellKind::Step,
            Unit::FusedLstm => CellKind::Fused,
            Unit::NativeLstm => CellKind::Native,
        }
    }

    pub fn gates(self) -> usize {
        match self {
            Unit::Rnn => 1,
            Unit::Gru => 3,
            Unit::Lstm | Unit::FusedLstm | Unit::NativeLstm => 4,
        }
    }

    /// Number of (batch, n) tensors in the carried state.
    pub fn state_parts(self) -> usize {
        match self {
            Unit::Rnn | Unit::Gru => 1,
            Unit::Lstm | Unit::FusedLstm | Unit::NativeLstm => 2,
        }
    }
}

/// A cell with its parameters recorded.
#[derive(Debug, Clone)]
pub struct Cell {
    unit: Unit,
    n_hidden: usize,
    w: Option<Tensor>,
    w_re: Tensor,
    b: Tensor,
}

impl Cell {
    /// Record the parameters on `base` as `{prefix}W`, `{prefix}W_re` and
    /// `{prefix}b`. Without `n_in` the input is taken as the gate
    /// pre-activations and no `W` is created.
    pub fn new(
        net: &mut Network,
        base: &mut LayerBase,
        unit: Unit,
        prefix: &str,
        n_in: Option<usize>,
        n_hidden: usize,
    ) -> Cell {
        let width = unit.gates() * n_hidden;
        let w = n_in.map(|n_in| {
            let init = init::xavier_uniform(net.rng());
            base.add_param(net, &format!("{prefix}W"), vec![n_in, width], init, true)
        });
        let init = init::xavier_uniform(net.rng());
        let w_re = base.add_param(net, &format!("{prefix}W_re"), vec![n_hidden, width], init, true);
        let b = base.add_param(net, &format!("{prefix}b"), vec![width], init::zeros(), true);
        Cell::from_params(unit, n_hidden, w, w_re, b)
    }

    pub(crate) fn from_params(unit: Unit, n_hidden: usize, w: Option<Tensor>, w_re: Tensor, b: Tensor) -> Cell {
        Cell { unit, n_hidden, w, w_re, b }
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn n_hidden(&self) -> usize {
        self.n_hidden
    }

    /// Width of the concatenated carried state.
    pub fn state_size(&self) -> usize {
        self.unit.state_parts() * self.n_hidden
    }

    /// The zero state, one scalar per part (broadcast by the engine).
    pub fn zero_state(&self, like: &Tensor) -> Vec<Tensor> {
        (0..self.unit.state_parts())
            .map(|_| like.graph().constant(0.0, like.dtype()))
            .collect()
    }

    fn project(&self, x: &Tensor) -> Tensor {
        match &self.w {
            Some(w) => x.matmul(w),
            None => x.clone(),
        }
    }

    fn gate(&self, t: &Tensor, k: usize) -> Tensor {
        t.narrow(1, k * self.n_hidden, self.n_hidden)
    }

    /// One frame: x (batch, n_in) and the carried state to the frame output
    /// and the next state. Only meaningful for step cells.
    pub fn step(&self, x: &Tensor, state: &[Tensor]) -> (Tensor, Vec<Tensor>) {
        match self.unit {
            Unit::Rnn => {
                let h = self
                    .project(x)
                    .add(&state[0].matmul(&self.w_re))
                    .add(&self.b)
                    .activation("tanh");
                (h.clone(), vec![h])
            }
            Unit::Gru => {
                let h = &state[0];
                let gx = self.project(x).add(&self.b);
                let gh = h.matmul(&self.w_re);
                let r = self.gate(&gx, 0).add(&self.gate(&gh, 0)).activation("sigmoid");
                let u = self.gate(&gx, 1).add(&self.gate(&gh, 1)).activation("sigmoid");
                let z = self.gate(&gx, 2).add(&r.mul(&self.gate(&gh, 2))).activation("tanh");
                let h = u.affine(-1.0, 1.0).mul(&z).add(&u.mul(h));
                (h.clone(), vec![h])
            }
            Unit::Lstm | Unit::FusedLstm | Unit::NativeLstm => {
                let (c, h) = (&state[0], &state[1]);
                let g = self.project(x).add(&h.matmul(&self.w_re)).add(&self.b);
                let i = self.gate(&g, 0).activation("sigmoid");
                let f = self.gate(&g, 1).activation("sigmoid");
                let z = self.gate(&g, 2).activation("tanh");
                let o = self.gate(&g, 3).activation("sigmoid");
                let c = f.mul(c).add(&i.mul(&z));
                let h = o.mul(&c.activation("tanh"));
                (h.clone(), vec![c, h])
            }
        }
    }

    /// Run over x (time, batch, n_in) up to each example's length.
    pub fn run(&self, x: &Tensor, lengths: &Tensor, initial_state: &[Tensor]) -> LoopOutput {
        let dtype = x.dtype();
        let parts = self.unit.state_parts();
        let node = match self.unit.kind() {
            CellKind::Step => return StepLoop::new(self).run(x, lengths, initial_state),
            CellKind::Fused => {
                let mut params: Vec<&Tensor> = self.w.iter().collect();
                params.extend([&self.w_re, &self.b]);
                let mut inputs = vec![lengths];
                inputs.extend(params.iter().copied());
                inputs.extend(initial_state);
                x.apply(
                    Op::FusedRnn {
                        unit: self.unit.name().to_string(),
                        n_hidden: self.n_hidden,
                        n_params: params.len(),
                    },
                    &inputs,
                    dtype,
                )
            }
            CellKind::Native => {
                let index = lengths.sequence_mask(&x.dim_size(0), true).cast(dtype);
                let mut inputs = vec![&self.w_re, &index];
                inputs.extend(initial_state);
                self.project(x).add(&self.b).apply(
                    Op::NativeRnn {
                        unit: self.unit.name().to_string(),
                        n_hidden: self.n_hidden,
                    },
                    &inputs,
                    dtype,
                )
            }
        };
        LoopOutput {
            y: node.get_item(0, dtype),
            final_state: (1..=parts).map(|i| node.get_item(i, dtype)).collect(),
            lengths: lengths.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_core::{DType, Graph, Init};

    fn cell(g: &Graph, unit: Unit, n_in: usize, n: usize) -> Cell {
        let width = unit.gates() * n;
        let init = Init::Constant(0.0);
        let w = g.param("W", vec![n_in, width], init, true, DType::F32);
        let w_re = g.param("W_re", vec![n, width], init, true, DType::F32);
        let b = g.param("b", vec![width], init, true, DType::F32);
        Cell::from_params(unit, n, Some(w), w_re, b)
    }

    #[test]
    fn test_unit_names() {
        assert_eq!(Unit::from_name("lstm", false).unwrap(), Unit::NativeLstm);
        assert_eq!(Unit::from_name("LSTM", true).unwrap(), Unit::Lstm);
        assert_eq!(Unit::from_name("basicrnn", false).unwrap(), Unit::Rnn);
        assert_eq!(Unit::from_name("lstmblockfused", false).unwrap().kind(), CellKind::Fused);
        assert!(matches!(
            Unit::from_name("transformer", false),
            Err(Error::UnknownCell { name }) if name == "transformer"
        ));
    }

    #[test]
    fn test_lstm_step_carries_cell_and_hidden() {
        let g = Graph::new();
        let c = cell(&g, Unit::Lstm, 3, 2);
        let x = g.placeholder("x", DType::F32, 2);
        let state = c.zero_state(&x);
        assert_eq!(state.len(), 2);
        let (y, next) = c.step(&x, &state);
        assert_eq!(next.len(), 2);
        assert_eq!(y, next[1]);
        assert_eq!(c.state_size(), 4);
        // four gates sliced out of the pre-activations
        let slices = g.count_ops(|op| matches!(op, Op::Slice { .. }));
        assert_eq!(slices, 4);
    }

    #[test]
    fn test_gru_step() {
        let g = Graph::new();
        let c = cell(&g, Unit::Gru, 3, 5);
        let x = g.placeholder("x", DType::F32, 2);
        let (y, next) = c.step(&x, &c.zero_state(&x));
        assert_eq!(next, vec![y]);
        assert_eq!(c.state_size(), 5);
    }

    #[test]
    fn test_fused_run_records_one_kernel() {
        let g = Graph::new();
        let c = cell(&g, Unit::FusedLstm, 3, 2);
        let x = g.placeholder("x", DType::F32, 3);
        let len = g.placeholder("x:size0", DType::I32, 1);
        let out = c.run(&x, &len, &c.zero_state(&x));
        assert_eq!(out.final_state.len(), 2);
        assert_eq!(out.lengths, len);
        let fused = g.node(out.y.inputs()[0].id());
        assert_eq!(
            fused.op,
            Op::FusedRnn { unit: "lstmblockfused".into(), n_hidden: 2, n_params: 3 }
        );
        // x, lengths, three params, two state parts
        assert_eq!(fused.inputs.len(), 7);
    }

    #[test]
    fn test_native_run_uses_frame_mask() {
        let g = Graph::new();
        let c = cell(&g, Unit::NativeLstm, 3, 2);
        let x = g.placeholder("x", DType::F32, 3);
        let len = g.placeholder("x:size0", DType::I32, 1);
        c.run(&x, &len, &c.zero_state(&x));
        assert_eq!(g.count_ops(|op| matches!(op, Op::SequenceMask { time_major: true })), 1);
        assert_eq!(g.count_ops(|op| matches!(op, Op::NativeRnn { .. })), 1);
        assert_eq!(g.count_ops(|op| matches!(op, Op::Scan { .. })), 0);
    }
}
