//! Stateless (parameter-free) activations plus Dropout, which is stateless
//! in parameters but owns an RNG. Grounded in the teacher's
//! `nn::activation::{ReLU, Sigmoid}`, extended with Tanh, Softmax, and
//! Dropout and re-pointed at the new `Layer` contract.

use crate::backend::Backend;
use crate::error::{LayerError, LayerResult};
use crate::layer::LayerBase;
use crate::layer::Layer;
use crate::options::LayerOptions;
use crate::shape::Shape;
use crate::tensor::Tensor;

macro_rules! elementwise_activation {
    ($name:ident, $default_name:expr, $fwd:ident, $bwd:ident, $bwd_uses_output:expr) => {
        pub struct $name {
            base: LayerBase,
        }

        impl $name {
            pub fn new() -> Self {
                Self::with_options(LayerOptions::new())
            }

            pub fn with_options(options: LayerOptions) -> Self {
                $name {
                    base: LayerBase::new($default_name, false, options),
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            /// Shape-conditional, like `Conv2D`'s scratch: a shape change
            /// reallocates `output`/`grad_input`, a repeat call with the
            /// same shape is a no-op (spec.md §9).
            fn ensure_scratch(&mut self, shape: &Shape) {
                let need_realloc = self
                    .base
                    .scratch
                    .get("output")
                    .map(|t| t.shape() != shape)
                    .unwrap_or(true);
                if !need_realloc {
                    return;
                }
                self.base.set_scratch("output", Tensor::zeros(shape));
                self.base.set_scratch("grad_input", Tensor::zeros(shape));
            }
        }

        impl Layer for $name {
            fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
                self.ensure_scratch(input_shape);
                self.base.mark_initialized();
                Ok(())
            }

            fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
                Ok(input_shape.clone())
            }

            fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
                self.base.require_initialized()?;
                self.base.require_compute_supported()?;
                self.ensure_scratch(input.shape());
                let output = self.base.get_scratch("output")?.clone();
                self.base.backend.$fwd(&output, &input)?;
                self.base.last_output = Some(output.clone());
                self.base.last_input = Some(input);
                Ok(output)
            }

            fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
                let input = self.base.require_forwarded()?.clone();
                self.ensure_scratch(input.shape());
                let grad_input = self.base.get_scratch("grad_input")?.clone();
                if $bwd_uses_output {
                    let output = self.base.last_output.as_ref().unwrap().clone();
                    self.base.backend.$bwd(&grad_input, grad_output, &output)?;
                } else {
                    self.base.backend.$bwd(&grad_input, grad_output, &input)?;
                }
                Ok(grad_input)
            }
        }
    };
}

elementwise_activation!(ReLU, "relu", relu_into, relu_backward_into, false);
elementwise_activation!(Sigmoid, "sigmoid", sigmoid_into, sigmoid_backward_into, true);
elementwise_activation!(Tanh, "tanh", tanh_into, tanh_backward_into, true);

/// Moves `axis` to the end of the dimension list, returning the permutation
/// `permute` applies (`perm[d]` names the source axis feeding output axis
/// `d`).
fn move_axis_to_last_perm(rank: usize, axis: usize) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..rank).filter(|&d| d != axis).collect();
    perm.push(axis);
    perm
}

fn inverse_perm(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0usize; perm.len()];
    for (dst, &src) in perm.iter().enumerate() {
        inv[src] = dst;
    }
    inv
}

/// General N-D axis permutation (not part of `Backend`: this is a one-off
/// data shuffle used only by `Softmax`'s non-last-axis path, not a
/// steady-state per-step op).
fn permute(t: &Tensor, perm: &[usize]) -> Tensor {
    let dims = t.shape().dims().to_vec();
    let rank = dims.len();
    let mut strides = vec![1usize; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    let new_dims: Vec<usize> = perm.iter().map(|&p| dims[p]).collect();
    let mut new_strides = vec![1usize; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        new_strides[i] = new_strides[i + 1] * new_dims[i + 1];
    }
    let src = t.data();
    let mut out = vec![0.0f32; src.len()];
    let mut idx = vec![0usize; rank];
    for (linear, slot) in out.iter_mut().enumerate() {
        let mut rem = linear;
        for d in 0..rank {
            idx[d] = rem / new_strides[d];
            rem %= new_strides[d];
        }
        let mut orig = 0usize;
        for d in 0..rank {
            orig += idx[d] * strides[perm[d]];
        }
        *slot = src[orig];
    }
    Tensor::from_vec(out, Shape::new(new_dims)).expect("permute: shape/len invariant")
}

/// Numerically stable softmax along a configurable dimension (spec.md §4.2,
/// §363: `Softmax(dim)`). `dim` follows the common negative-indexing
/// convention (`-1` = last axis); it is resolved against the actual input
/// rank at `init`/`forward`/`backward` time. The last-axis case dispatches
/// straight to `Backend::softmax_last_dim_into`/`softmax_backward_last_dim_into`;
/// any other axis is handled by permuting it to the end, reusing the same
/// backend kernel, and permuting back — spec.md's axis-semantics Open
/// Question is about backward on rank >= 3 tensors softmaxed along a
/// *non-last* axis, which this permute-based approach resolves the same way
/// as the last-axis case rather than leaving ambiguous.
pub struct Softmax {
    base: LayerBase,
    dim: i64,
}

impl Softmax {
    pub fn new(dim: i64) -> Self {
        Self::with_options(dim, LayerOptions::new())
    }

    pub fn with_options(dim: i64, options: LayerOptions) -> Self {
        Softmax {
            base: LayerBase::new("softmax", false, options),
            dim,
        }
    }

    fn resolve_dim(&self, rank: usize) -> LayerResult<usize> {
        let rank_i = rank as i64;
        let resolved = if self.dim < 0 { self.dim + rank_i } else { self.dim };
        if resolved < 0 || resolved >= rank_i {
            return Err(LayerError::InvalidArgument(format!(
                "softmax: dim {} out of range for rank {rank}",
                self.dim
            )));
        }
        Ok(resolved as usize)
    }
}

impl Default for Softmax {
    fn default() -> Self {
        Self::new(-1)
    }
}

impl Softmax {
    /// Shape-conditional scratch, matching the activation macro's pattern.
    fn ensure_scratch(&mut self, shape: &Shape) {
        let need_realloc = self
            .base
            .scratch
            .get("output")
            .map(|t| t.shape() != shape)
            .unwrap_or(true);
        if !need_realloc {
            return;
        }
        self.base.set_scratch("output", Tensor::zeros(shape));
        self.base.set_scratch("grad_input", Tensor::zeros(shape));
    }
}

impl Layer for Softmax {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        self.resolve_dim(input_shape.rank())?;
        self.ensure_scratch(input_shape);
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        Ok(input_shape.clone())
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        self.base.require_compute_supported()?;
        let axis = self.resolve_dim(input.shape().rank())?;
        self.ensure_scratch(input.shape());
        let output = self.base.get_scratch("output")?.clone();
        if axis + 1 == input.shape().rank() {
            self.base.backend.softmax_last_dim_into(&output, &input)?;
        } else {
            let perm = move_axis_to_last_perm(input.shape().rank(), axis);
            let permuted_in = permute(&input, &perm);
            let permuted_out = Tensor::zeros(permuted_in.shape());
            self.base
                .backend
                .softmax_last_dim_into(&permuted_out, &permuted_in)?;
            let restored = permute(&permuted_out, &inverse_perm(&perm));
            output.copy_from(&restored)?;
        }
        self.base.last_output = Some(output.clone());
        self.base.last_input = Some(input);
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
        self.base.require_forwarded()?;
        let output = self.base.last_output.as_ref().unwrap().clone();
        let axis = self.resolve_dim(output.shape().rank())?;
        self.ensure_scratch(output.shape());
        let grad_input = self.base.get_scratch("grad_input")?.clone();
        if axis + 1 == output.shape().rank() {
            self.base
                .backend
                .softmax_backward_last_dim_into(&grad_input, grad_output, &output)?;
        } else {
            let perm = move_axis_to_last_perm(output.shape().rank(), axis);
            let permuted_grad_out = permute(grad_output, &perm);
            let permuted_output = permute(&output, &perm);
            let permuted_grad_in = Tensor::zeros(permuted_grad_out.shape());
            self.base.backend.softmax_backward_last_dim_into(
                &permuted_grad_in,
                &permuted_grad_out,
                &permuted_output,
            )?;
            let restored = permute(&permuted_grad_in, &inverse_perm(&perm));
            grad_input.copy_from(&restored)?;
        }
        Ok(grad_input)
    }
}

/// Inverted-scaling dropout: during training, zeroes each element
/// independently with probability `p` and scales survivors by `1/(1-p)`; in
/// eval mode (`training = false`) it is the identity. A fresh mask is drawn
/// every forward call — masks are not resumable across forward/backward
/// pairs (spec.md §4.2).
pub struct Dropout {
    base: LayerBase,
    rate: f32,
    training: bool,
}

impl Dropout {
    pub fn new(rate: f32) -> LayerResult<Self> {
        Self::with_options(rate, LayerOptions::new())
    }

    pub fn with_options(rate: f32, options: LayerOptions) -> LayerResult<Self> {
        let rate = options.dropout_rate.unwrap_or(rate);
        if !(0.0..1.0).contains(&rate) {
            return Err(LayerError::InvalidArgument(format!(
                "dropout rate must be in [0, 1), got {rate}"
            )));
        }
        let training = options.training_mode.unwrap_or(true);
        Ok(Dropout {
            base: LayerBase::new("dropout", false, options),
            rate,
            training,
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

impl Dropout {
    /// Shape-conditional `output`/`grad_input` scratch. The `mask` buffer is
    /// deliberately excluded: a fresh mask is drawn every forward call
    /// (`Backend::dropout_mask` has no destination-taking variant, since its
    /// whole job is to produce new randomness each time), so there is no
    /// steady-state buffer to reuse for it.
    fn ensure_scratch(&mut self, shape: &Shape) {
        let need_realloc = self
            .base
            .scratch
            .get("output")
            .map(|t| t.shape() != shape)
            .unwrap_or(true);
        if !need_realloc {
            return;
        }
        self.base.set_scratch("output", Tensor::zeros(shape));
        self.base.set_scratch("grad_input", Tensor::zeros(shape));
    }
}

impl Layer for Dropout {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        self.ensure_scratch(input_shape);
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        Ok(input_shape.clone())
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        self.base.require_compute_supported()?;
        self.ensure_scratch(input.shape());
        if !self.training || self.rate == 0.0 {
            self.base.last_input = Some(input.clone());
            self.base.set_scratch("mask", Tensor::ones(input.shape()));
            return Ok(input);
        }
        let mask = self
            .base
            .backend
            .dropout_mask(input.shape(), self.rate, &mut self.base.rng);
        let output = self.base.get_scratch("output")?.clone();
        self.base.backend.dropout_forward_into(&output, &input, &mask)?;
        self.base.set_scratch("mask", mask);
        self.base.last_input = Some(input);
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
        self.base.require_forwarded()?;
        self.ensure_scratch(grad_output.shape());
        let mask = self.base.get_scratch("mask")?.clone();
        let grad_input = self.base.get_scratch("grad_input")?.clone();
        self.base
            .backend
            .dropout_backward_into(&grad_input, grad_output, &mask)?;
        Ok(grad_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn relu_forward_backward() {
        let mut relu = ReLU::new();
        let shape = Shape::new(vec![4]);
        relu.init(&shape).unwrap();
        let input = Tensor::from_vec(vec![-1.0, 0.0, 1.0, 2.0], shape).unwrap();
        let out = relu.forward(input).unwrap();
        assert_eq!(out.to_vec(), vec![0.0, 0.0, 1.0, 2.0]);
        let grad_out = Tensor::ones(out.shape());
        let grad_in = relu.backward(&grad_out).unwrap();
        assert_eq!(grad_in.to_vec(), vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn dropout_eval_mode_is_identity() {
        let mut d = Dropout::new(0.5).unwrap();
        d.set_training(false);
        let shape = Shape::new(vec![5]);
        d.init(&shape).unwrap();
        let input = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0], shape).unwrap();
        let out = d.forward(input.clone()).unwrap();
        assert_eq!(out.to_vec(), input.to_vec());
    }

    #[test]
    fn dropout_scales_kept_elements() {
        let options = LayerOptions::new().rng(rand::rngs::StdRng::seed_from_u64(7));
        let mut d = Dropout::with_options(0.5, options).unwrap();
        let shape = Shape::new(vec![1000]);
        d.init(&shape).unwrap();
        let input = Tensor::ones(&shape);
        let out = d.forward(input).unwrap();
        for v in out.to_vec() {
            assert!(v == 0.0 || (v - 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn softmax_sums_to_one() {
        let mut s = Softmax::new(-1);
        let shape = Shape::new(vec![4]);
        s.init(&shape).unwrap();
        let input = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], shape).unwrap();
        let out = s.forward(input).unwrap();
        let sum: f32 = out.to_vec().iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn softmax_dim0_normalizes_columns_not_rows() {
        // [2, 2] input; dim=0 softmaxes each column across the two rows,
        // which a last-axis-only implementation cannot express.
        let mut s = Softmax::new(0);
        let shape = Shape::new(vec![2, 2]);
        s.init(&shape).unwrap();
        let input = Tensor::from_vec(vec![1.0, 2.0, 1.0, 2.0], shape).unwrap();
        let out = s.forward(input).unwrap();
        let v = out.to_vec();
        // each column sums to 1 across rows (indices 0&2, 1&3)
        assert!((v[0] + v[2] - 1.0).abs() < 1e-6);
        assert!((v[1] + v[3] - 1.0).abs() < 1e-6);
        // both columns are identical since both rows repeat [1, 2]
        assert!((v[0] - v[1]).abs() < 1e-6);
        assert!((v[2] - v[3]).abs() < 1e-6);
    }

    #[test]
    fn softmax_dim0_backward_grad_sums_to_zero_per_column() {
        let mut s = Softmax::new(0);
        let shape = Shape::new(vec![2, 2]);
        s.init(&shape).unwrap();
        let input = Tensor::from_vec(vec![0.1, -0.3, 0.4, 0.2], shape).unwrap();
        s.forward(input).unwrap();
        let grad_out = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2])).unwrap();
        let grad_in = s.backward(&grad_out).unwrap();
        let v = grad_in.to_vec();
        assert!((v[0] + v[2]).abs() < 1e-4);
        assert!((v[1] + v[3]).abs() < 1e-4);
    }

    #[test]
    fn softmax_negative_dim_out_of_range_is_invalid_argument() {
        let mut s = Softmax::new(-3);
        let err = s.init(&Shape::new(vec![2, 2])).unwrap_err();
        assert!(matches!(err, LayerError::InvalidArgument(_)));
    }
}
