// Step loop — a step cell unrolled over time, with attention and feedback
//
// Each frame t sees the frame x_t, the carried cell state s and, with
// output feedback, the previous frame output y_{t-1}:
//
//   q        = h W_att                       h: last part of s, (batch, n)
//   e        = Σ_f base * q                  (time, batch), padding at -1e30
//   a        = softmax of e over time
//   context  = Σ_t a * base                  (batch, n_in)
//   input    = [x_t, context, y_{t-1}]
//   y_t, s'  = cell.step(input, s)
//
// `base` is the full input sequence the loop runs over. With an end label
// every example also carries whether it has emitted the label yet and how
// many frames it produced up to and including it; that count, capped by the
// input length, becomes the output length.

use wren_core::{DType, Tensor};

use super::cell::Cell;
use crate::init;
use crate::layer::LayerBase;
use crate::network::Network;

/// Result of running a cell over a sequence.
#[derive(Debug, Clone)]
pub struct LoopOutput {
    /// (time, batch, n)
    pub y: Tensor,
    pub final_state: Vec<Tensor>,
    /// Valid frames of `y` per example.
    pub lengths: Tensor,
}

/// Dot-product attention over the input sequence.
#[derive(Debug, Clone)]
pub struct Attention {
    w: Tensor,
}

impl Attention {
    /// Record `{prefix}W_att` [n_hidden, n_in] on `base`.
    pub fn new(net: &mut Network, base: &mut LayerBase, prefix: &str, n_hidden: usize, n_in: usize) -> Self {
        let init = init::xavier_uniform(net.rng());
        let w = base.add_param(net, &format!("{prefix}W_att"), vec![n_hidden, n_in], init, true);
        Attention { w }
    }

    /// base (time, batch, n_in), mask (time, batch), query (batch, n_hidden)
    /// to a context vector (batch, n_in).
    fn context(&self, base: &Tensor, mask: &Tensor, query: &Tensor) -> Tensor {
        let q = query.matmul(&self.w);
        let energy = base.mul(&q.expand_dims(0)).sum(2, false);
        let padding = energy.graph().constant(-1e30, energy.dtype());
        let energy = Tensor::where_cond(mask, &energy, &padding);
        let weights = energy.permute(vec![1, 0]).activation("softmax").permute(vec![1, 0]);
        base.mul(&weights.expand_dims(2)).sum(0, false)
    }
}

/// Re-inject the previous frame output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Feedback {
    pub end_label: Option<usize>,
}

/// Width of the cell input for an input of width `n_in`.
pub fn step_input_dim(n_in: usize, n_hidden: usize, attention: bool, feedback: bool) -> usize {
    n_in + if attention { n_in } else { 0 } + if feedback { n_hidden } else { 0 }
}

/// A step cell driven frame by frame.
pub struct StepLoop<'a> {
    cell: &'a Cell,
    attention: Option<&'a Attention>,
    feedback: Option<Feedback>,
}

impl<'a> StepLoop<'a> {
    pub fn new(cell: &'a Cell) -> Self {
        StepLoop {
            cell,
            attention: None,
            feedback: None,
        }
    }

    pub fn with_attention(mut self, attention: Option<&'a Attention>) -> Self {
        self.attention = attention;
        self
    }

    pub fn with_feedback(mut self, feedback: Option<Feedback>) -> Self {
        self.feedback = feedback;
        self
    }

    /// Unroll over x (time, batch, n_in).
    pub fn run(&self, x: &Tensor, lengths: &Tensor, initial_state: &[Tensor]) -> LoopOutput {
        let g = x.graph().clone();
        let dtype = x.dtype();
        let parts = initial_state.len();

        let x_t = g.loop_input(0, dtype);
        let state: Vec<Tensor> = (1..=parts).map(|i| g.loop_input(i, dtype)).collect();
        let mut body_inputs = vec![x_t.clone()];
        body_inputs.extend(state.iter().cloned());
        let mut initial = initial_state.to_vec();

        let mut cell_input = vec![x_t.clone()];
        if let (Some(attention), Some(h)) = (self.attention, state.last()) {
            let mask = lengths.sequence_mask(&x.dim_size(0), true);
            cell_input.push(attention.context(x, &mask, h));
        }
        let prev_y = self.feedback.map(|_| {
            let slot = g.loop_input(body_inputs.len(), dtype);
            body_inputs.push(slot.clone());
            initial.push(g.constant(0.0, dtype));
            slot
        });
        cell_input.extend(prev_y.iter().cloned());
        let input = Tensor::cat(&cell_input, 1).unwrap_or(x_t);

        let (y_t, next) = self.cell.step(&input, &state);
        let mut body_outputs = vec![y_t.clone()];
        body_outputs.extend(next);
        if prev_y.is_some() {
            body_outputs.push(y_t.clone());
        }
        let end_label = self.feedback.and_then(|f| f.end_label);
        if let Some(label) = end_label {
            let ended = g.loop_input(body_inputs.len(), DType::Bool);
            let count = g.loop_input(body_inputs.len() + 1, DType::I32);
            body_inputs.extend([ended.clone(), count.clone()]);
            initial.extend([g.constant(0.0, DType::Bool), g.constant(0.0, DType::I32)]);
            let hit = y_t.argmax(1).eq(&g.constant(label as f64, DType::I32));
            body_outputs.push(ended.logical_or(&hit));
            body_outputs.push(count.add(&ended.logical_not().cast(DType::I32)));
        }

        let scan = x.scan(lengths, &initial, &body_inputs, &body_outputs);
        let out_lengths = match end_label {
            Some(_) => scan
                .get_item(body_outputs.len() - 1, DType::I32)
                .minimum(lengths),
            None => lengths.clone(),
        };
        LoopOutput {
            y: scan.get_item(0, dtype),
            final_state: (1..=parts).map(|i| scan.get_item(i, dtype)).collect(),
            lengths: out_lengths,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rec::cell::Unit;
    use wren_core::{Init, Op};

    fn cell(g: &wren_core::Graph, unit: Unit, n_in: usize, n: usize) -> Cell {
        let width = unit.gates() * n;
        let init = Init::Constant(0.0);
        let w = g.param("W", vec![n_in, width], init, true, DType::F32);
        let w_re = g.param("W_re", vec![n, width], init, true, DType::F32);
        let b = g.param("b", vec![width], init, true, DType::F32);
        Cell::from_params(unit, n, Some(w), w_re, b)
    }

    fn scan_of(y: &Tensor) -> (Vec<wren_core::NodeId>, Vec<wren_core::NodeId>, usize) {
        let scan = g_node(y);
        match scan.op {
            Op::Scan { body_inputs, body_outputs } => (body_inputs, body_outputs, scan.inputs.len()),
            other => panic!("expected a scan, got {other:?}"),
        }
    }

    fn g_node(y: &Tensor) -> wren_core::Node {
        y.graph().node(y.inputs()[0].id())
    }

    #[test]
    fn test_plain_loop() {
        let g = wren_core::Graph::new();
        let c = cell(&g, Unit::Rnn, 3, 4);
        let x = g.placeholder("x", DType::F32, 3);
        let len = g.placeholder("x:size0", DType::I32, 1);
        let out = StepLoop::new(&c).run(&x, &len, &c.zero_state(&x));
        let (inputs, outputs, n_scan_inputs) = scan_of(&out.y);
        assert_eq!(inputs.len(), 2);
        assert_eq!(outputs.len(), 2);
        // x, lengths, h0
        assert_eq!(n_scan_inputs, 3);
        assert_eq!(out.lengths, len);
        assert_eq!(g.count_ops(|op| matches!(op, Op::Concat { .. })), 0);
    }

    #[test]
    fn test_attention_and_feedback_widen_the_input() {
        let g = wren_core::Graph::new();
        let (n_in, n) = (3, 2);
        let c = cell(&g, Unit::Lstm, step_input_dim(n_in, n, true, true), n);
        let att = Attention {
            w: g.param("W_att", vec![n, n_in], Init::Constant(0.0), true, DType::F32),
        };
        let x = g.placeholder("x", DType::F32, 3);
        let len = g.placeholder("x:size0", DType::I32, 1);
        let out = StepLoop::new(&c)
            .with_attention(Some(&att))
            .with_feedback(Some(Feedback::default()))
            .run(&x, &len, &c.zero_state(&x));
        let (inputs, outputs, _) = scan_of(&out.y);
        // x_t, c, h, y_prev
        assert_eq!(inputs.len(), 4);
        assert_eq!(outputs.len(), 4);
        assert_eq!(g.count_ops(|op| matches!(op, Op::Concat { axis: 1 })), 1);
        assert_eq!(g.count_ops(|op| *op == Op::Activation("softmax".into())), 1);
        assert_eq!(out.final_state.len(), 2);
    }

    #[test]
    fn test_end_label_derives_lengths() {
        let g = wren_core::Graph::new();
        let c = cell(&g, Unit::Gru, step_input_dim(3, 4, false, true), 4);
        let x = g.placeholder("x", DType::F32, 3);
        let len = g.placeholder("x:size0", DType::I32, 1);
        let out = StepLoop::new(&c)
            .with_feedback(Some(Feedback { end_label: Some(0) }))
            .run(&x, &len, &c.zero_state(&x));
        assert_ne!(out.lengths, len);
        // min(count, lengths)
        assert_eq!(out.lengths.inputs()[1], len);
        let (inputs, outputs, n_scan_inputs) = scan_of(&out.y);
        // x_t, h, y_prev, ended, count
        assert_eq!(inputs.len(), 5);
        assert_eq!(outputs.len(), 5);
        assert_eq!(n_scan_inputs, 6);
    }

    #[test]
    fn test_input_dim() {
        assert_eq!(step_input_dim(10, 4, false, false), 10);
        assert_eq!(step_input_dim(10, 4, true, false), 20);
        assert_eq!(step_input_dim(10, 4, true, true), 24);
    }
}
