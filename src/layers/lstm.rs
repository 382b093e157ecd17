//! LSTM: single-timestep LSTM cell (spec.md §4.8). Gate matmuls and bias
//! broadcast reuse the `Dense`-style `matmul_nt_into`/`add_bias_rows_into`
//! pattern (this crate's `dense.rs`); the column-wise gate split has no
//! general backend primitive (the operation surface in spec.md §6.1 only
//! slices along the outermost axis), so it is done with direct indexed
//! copies here instead.
//!
//! Per spec.md §9's open question, this layer resolves to the "refuse
//! `can_learn=true`" option: BPTT is out of scope, so `can_learn` is forced
//! false regardless of what's requested and `backward` returns an error
//! describing why. A caller wanting gradients through time must compose
//! multiple single-step cells externally with its own graph.

use crate::backend::Backend;
use crate::error::{LayerError, LayerResult};
use crate::init::lstm_uniform;
use crate::layer::{Layer, LayerBase};
use crate::options::{LayerOptions, ParamIndex};
use crate::parameter::Parameter;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// `W_hh`'s parameter slot; `W_ih` uses [`ParamIndex::Weights`] and the bias
/// uses [`ParamIndex::Biases`].
const W_HH: ParamIndex = ParamIndex::Custom(0);

pub struct Lstm {
    base: LayerBase,
    input_size: usize,
    hidden_size: usize,
    hidden_state: Tensor,
    cell_state: Tensor,
    batch: usize,
    was_1d: bool,
}

impl Lstm {
    pub fn new(input_size: usize, hidden_size: usize) -> LayerResult<Self> {
        Self::with_options(input_size, hidden_size, LayerOptions::new())
    }

    pub fn with_options(input_size: usize, hidden_size: usize, options: LayerOptions) -> LayerResult<Self> {
        if input_size == 0 || hidden_size == 0 {
            return Err(LayerError::InvalidArgument(
                "lstm: input_size and hidden_size must be positive".into(),
            ));
        }
        let gate_size = 4 * hidden_size;
        let mut base = LayerBase::new("lstm", false, options);
        base.can_learn = false;
        if !base.parameters.contains_key(&ParamIndex::Weights) {
            let w_ih = lstm_uniform(&Shape::new(vec![gate_size, input_size]), hidden_size, &mut base.rng);
            base.parameters
                .insert(ParamIndex::Weights, Parameter::frozen(w_ih));
        }
        if !base.parameters.contains_key(&W_HH) {
            let w_hh = lstm_uniform(&Shape::new(vec![gate_size, hidden_size]), hidden_size, &mut base.rng);
            base.parameters.insert(W_HH, Parameter::frozen(w_hh));
        }
        if !base.parameters.contains_key(&ParamIndex::Biases) {
            let b = Tensor::zeros(&Shape::new(vec![gate_size]));
            base.parameters.insert(ParamIndex::Biases, Parameter::frozen(b));
        }
        Ok(Lstm {
            base,
            input_size,
            hidden_size,
            hidden_state: Tensor::nil(),
            cell_state: Tensor::nil(),
            batch: 0,
            was_1d: false,
        })
    }

    /// Reset `hidden_state`/`cell_state` to all zeros, preserving batch shape.
    pub fn reset(&mut self) {
        if self.batch > 0 {
            self.hidden_state = Tensor::zeros(&Shape::new(vec![self.batch, self.hidden_size]));
            self.cell_state = Tensor::zeros(&Shape::new(vec![self.batch, self.hidden_size]));
        }
    }

    /// Install external state. Accepts `[hidden]` (non-batched) or `[batch,
    /// hidden]`; takes a defensive deep copy so the caller's tensor and the
    /// layer's internal state never alias.
    pub fn set_state(&mut self, hidden: &Tensor, cell: &Tensor) -> LayerResult<()> {
        let (h2, _) = self.as_2d_state(hidden)?;
        let (c2, _) = self.as_2d_state(cell)?;
        self.hidden_state = h2.deep_clone();
        self.cell_state = c2.deep_clone();
        Ok(())
    }

    /// Current `(hidden_state, cell_state)`, each a defensive deep copy in
    /// the same rank (1D or 2D) the layer was last driven with.
    pub fn get_state(&self) -> (Tensor, Tensor) {
        if self.was_1d {
            (
                self.hidden_state
                    .reshape_copy(Shape::new(vec![self.hidden_size]))
                    .expect("lstm: hidden_state numel matches hidden_size for non-batched state"),
                self.cell_state
                    .reshape_copy(Shape::new(vec![self.hidden_size]))
                    .expect("lstm: cell_state numel matches hidden_size for non-batched state"),
            )
        } else {
            (self.hidden_state.deep_clone(), self.cell_state.deep_clone())
        }
    }

    fn as_2d_state(&self, t: &Tensor) -> LayerResult<(Tensor, bool)> {
        match t.rank() {
            1 => Ok((t.view_reshape(Shape::new(vec![1, self.hidden_size]))?, true)),
            2 => Ok((t.clone(), false)),
            r => Err(LayerError::IncompatibleInput(format!(
                "lstm: expected rank 1 or 2 state tensor, got rank {r}"
            ))),
        }
    }

    fn as_2d_input(&self, input: &Tensor) -> LayerResult<(Tensor, bool)> {
        match input.rank() {
            1 => Ok((input.view_reshape(Shape::new(vec![1, self.input_size]))?, true)),
            2 => Ok((input.clone(), false)),
            r => Err(LayerError::IncompatibleInput(format!(
                "lstm: expected rank 1 or 2 input, got rank {r}"
            ))),
        }
    }

    fn ensure_scratch(&mut self, batch: usize) {
        let gate_shape = Shape::new(vec![batch, 4 * self.hidden_size]);
        let needs_realloc = self
            .base
            .scratch
            .get("gates")
            .map(|t| t.shape() != &gate_shape)
            .unwrap_or(true);
        if needs_realloc {
            let h_shape = Shape::new(vec![batch, self.hidden_size]);
            self.base.set_scratch("gates", Tensor::zeros(&gate_shape));
            self.base.set_scratch("gates_biased", Tensor::zeros(&gate_shape));
            self.base.set_scratch("ih_proj", Tensor::zeros(&gate_shape));
            self.base.set_scratch("hh_proj", Tensor::zeros(&gate_shape));
            self.base.set_scratch("i_gate", Tensor::zeros(&h_shape));
            self.base.set_scratch("f_gate", Tensor::zeros(&h_shape));
            self.base.set_scratch("g_gate", Tensor::zeros(&h_shape));
            self.base.set_scratch("o_gate", Tensor::zeros(&h_shape));
            self.base.set_scratch("gate_tmp", Tensor::zeros(&h_shape));
            self.base.set_scratch("fc", Tensor::zeros(&h_shape));
            self.base.set_scratch("ig", Tensor::zeros(&h_shape));
            self.base.set_scratch("tanh_c", Tensor::zeros(&h_shape));
            self.base.set_scratch("new_c", Tensor::zeros(&h_shape));
            self.base.set_scratch("new_h", Tensor::zeros(&h_shape));
            self.batch = batch;
            self.hidden_state = Tensor::zeros(&h_shape);
            self.cell_state = Tensor::zeros(&h_shape);
        }
    }

    /// Copy gate slice `which` (0=input, 1=forget, 2=candidate, 3=output)
    /// out of the combined `[batch, 4*hidden]` gate tensor into `dst`
    /// (`[batch, hidden]`).
    fn split_gate(&self, gates: &Tensor, which: usize, dst: &Tensor) {
        let hidden = self.hidden_size;
        let batch = gates.shape().dims()[0];
        let gd = gates.data();
        let mut dd = dst.data_mut();
        for b in 0..batch {
            for h in 0..hidden {
                dd[b * hidden + h] = gd[b * 4 * hidden + which * hidden + h];
            }
        }
    }
}

impl Layer for Lstm {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        let dims = input_shape.dims();
        let last = *dims.last().ok_or_else(|| {
            LayerError::IncompatibleInput("lstm: input shape has no dimensions".into())
        })?;
        if last != self.input_size {
            return Err(LayerError::ShapeMismatch(format!(
                "lstm: input feature dim {} != input_size {}",
                last, self.input_size
            )));
        }
        let batch = if dims.len() == 1 { 1 } else { dims[0] };
        self.ensure_scratch(batch);
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        let dims = input_shape.dims();
        if dims.len() == 1 {
            Ok(Shape::new(vec![self.hidden_size]))
        } else {
            Ok(Shape::new(vec![dims[0], self.hidden_size]))
        }
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        self.base.require_compute_supported()?;
        let (input_2d, was_1d) = self.as_2d_input(&input)?;
        self.was_1d = was_1d;
        let batch = input_2d.shape().dims()[0];
        self.ensure_scratch(batch);

        let w_ih = self.base.get_param(ParamIndex::Weights)?.data().clone();
        let w_hh = self.base.get_param(W_HH)?.data().clone();
        let bias = self.base.get_param(ParamIndex::Biases)?.data().clone();

        let ih_proj = self.base.get_scratch("ih_proj")?.clone();
        self.base.backend.matmul_nt_into(&ih_proj, &input_2d, &w_ih)?;
        let hh_proj = self.base.get_scratch("hh_proj")?.clone();
        self.base.backend.matmul_nt_into(&hh_proj, &self.hidden_state, &w_hh)?;

        let gates = self.base.get_scratch("gates")?.clone();
        self.base.backend.add_into(&gates, &ih_proj, &hh_proj)?;
        let gates_biased = self.base.get_scratch("gates_biased")?.clone();
        self.base.backend.add_bias_rows_into(&gates_biased, &gates, &bias)?;

        let i_gate = self.base.get_scratch("i_gate")?.clone();
        let f_gate = self.base.get_scratch("f_gate")?.clone();
        let g_gate = self.base.get_scratch("g_gate")?.clone();
        let o_gate = self.base.get_scratch("o_gate")?.clone();
        let gate_tmp = self.base.get_scratch("gate_tmp")?.clone();

        self.split_gate(&gates_biased, 0, &gate_tmp);
        self.base.backend.sigmoid_into(&i_gate, &gate_tmp)?;
        self.split_gate(&gates_biased, 1, &gate_tmp);
        self.base.backend.sigmoid_into(&f_gate, &gate_tmp)?;
        self.split_gate(&gates_biased, 2, &gate_tmp);
        self.base.backend.tanh_into(&g_gate, &gate_tmp)?;
        self.split_gate(&gates_biased, 3, &gate_tmp);
        self.base.backend.sigmoid_into(&o_gate, &gate_tmp)?;

        let new_c = self.base.get_scratch("new_c")?.clone();
        let fc = self.base.get_scratch("fc")?.clone();
        self.base.backend.mul_into(&fc, &f_gate, &self.cell_state)?;
        let ig = self.base.get_scratch("ig")?.clone();
        self.base.backend.mul_into(&ig, &i_gate, &g_gate)?;
        self.base.backend.add_into(&new_c, &fc, &ig)?;

        let tanh_c = self.base.get_scratch("tanh_c")?.clone();
        self.base.backend.tanh_into(&tanh_c, &new_c)?;
        let new_h = self.base.get_scratch("new_h")?.clone();
        self.base.backend.mul_into(&new_h, &o_gate, &tanh_c)?;

        self.hidden_state.copy_from(&new_h)?;
        self.cell_state.copy_from(&new_c)?;

        let output = if was_1d {
            new_h.view_reshape(Shape::new(vec![self.hidden_size]))?
        } else {
            new_h
        };
        self.base.last_output = Some(output.clone());
        self.base.last_input = Some(input);
        Ok(output)
    }

    fn backward(&mut self, _grad_output: &Tensor) -> LayerResult<Tensor> {
        self.base.require_forwarded()?;
        Err(LayerError::RuntimeFailure(
            "lstm: backward through time is not implemented; this cell reports can_learn=false \
             and must be composed externally for BPTT"
                .into(),
        ))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.base.parameters.values().collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.base.parameters.values_mut().collect()
    }

    fn can_learn(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_input_zero_state_produces_zero_hidden() {
        let mut cell = Lstm::new(3, 2).unwrap();
        cell.init(&Shape::new(vec![3])).unwrap();
        let input = Tensor::zeros(&Shape::new(vec![3]));
        let out = cell.forward(input).unwrap();
        // bias is zero, weights are random but gates(0) = 0 before bias; with
        // zero input/state, i=f=o=sigmoid(0)=0.5, g=tanh(0)=0, so c'=0, h'=0.
        for v in out.to_vec() {
            assert!((v - 0.0).abs() < 1e-6);
        }
    }

    #[test]
    fn reset_zeros_state() {
        let mut cell = Lstm::new(2, 2).unwrap();
        cell.init(&Shape::new(vec![2])).unwrap();
        let input = Tensor::from_vec(vec![1.0, 1.0], Shape::new(vec![2])).unwrap();
        cell.forward(input).unwrap();
        cell.reset();
        let (h, c) = cell.get_state();
        assert_eq!(h.to_vec(), vec![0.0, 0.0]);
        assert_eq!(c.to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn set_state_round_trips() {
        let mut cell = Lstm::new(2, 2).unwrap();
        cell.init(&Shape::new(vec![2])).unwrap();
        let h = Tensor::from_vec(vec![0.1, 0.2], Shape::new(vec![2])).unwrap();
        let c = Tensor::from_vec(vec![0.3, 0.4], Shape::new(vec![2])).unwrap();
        cell.set_state(&h, &c).unwrap();
        let (h2, c2) = cell.get_state();
        assert_eq!(h2.to_vec(), vec![0.1, 0.2]);
        assert_eq!(c2.to_vec(), vec![0.3, 0.4]);
    }

    #[test]
    fn batched_forward_produces_batch_shaped_output() {
        let mut cell = Lstm::new(3, 4).unwrap();
        cell.init(&Shape::new(vec![2, 3])).unwrap();
        let input = Tensor::zeros(&Shape::new(vec![2, 3]));
        let out = cell.forward(input).unwrap();
        assert_eq!(out.shape().dims(), &[2, 4]);
    }

    #[test]
    fn backward_is_refused() {
        let mut cell = Lstm::new(2, 2).unwrap();
        cell.init(&Shape::new(vec![2])).unwrap();
        let input = Tensor::zeros(&Shape::new(vec![2]));
        let out = cell.forward(input).unwrap();
        let grad_out = Tensor::ones(out.shape());
        assert!(cell.backward(&grad_out).is_err());
        assert!(!cell.can_learn());
    }
}
