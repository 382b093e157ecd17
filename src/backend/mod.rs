//! Backend abstraction: device-agnostic interface for the tensor primitive
//! surface layers consume (spec.md §6.1). All convolution, pooling,
//! activation, and linear-algebra kernels go through this trait so a future
//! SIMD or GPU implementation could replace `CpuBackend` without touching
//! any layer. Every op that a layer calls in its steady-state Forward/
//! Backward has an `_into` destination-taking variant that writes into a
//! caller-owned tensor instead of allocating, per spec.md §5/§9.

use crate::shape::Shape;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
#[error("backend error: {0}")]
pub struct BackendError(pub String);

pub type BackendResult<T> = Result<T, BackendError>;

/// A 2D spatial extent, `(height, width)` or `(rows, cols)` depending on
/// context.
pub type Hw = (usize, usize);

pub trait Backend {
    // -- elementwise binary -------------------------------------------------
    fn add(&self, a: &Tensor, b: &Tensor) -> BackendResult<Tensor>;
    fn add_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()>;
    fn sub_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()>;
    fn mul_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()>;
    fn div_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()>;
    /// `dst = a + alpha * b`, exact-shape only.
    fn add_scaled_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor, alpha: f32) -> BackendResult<()>;

    // -- elementwise scalar ---------------------------------------------------
    fn scale_into(&self, t: &Tensor, s: f32) -> BackendResult<()>;
    fn add_scalar_into(&self, dst: &Tensor, a: &Tensor, s: f32) -> BackendResult<()>;

    // -- elementwise unary ----------------------------------------------------
    fn square_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()>;
    fn sqrt_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()>;
    fn exp_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()>;
    fn log_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()>;
    fn negative_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()>;

    // -- reductions -------------------------------------------------------
    fn sum_all(&self, a: &Tensor) -> f32;
    fn mean_all(&self, a: &Tensor) -> f32;
    /// Reduce over `axis`, writing into `dst` whose shape is `a`'s shape with
    /// `axis` collapsed to 1.
    fn sum_axis_into(&self, dst: &Tensor, a: &Tensor, axis: usize) -> BackendResult<()>;
    /// Index (as `f32`) of the maximum element along `axis`.
    fn argmax_axis(&self, a: &Tensor, axis: usize) -> BackendResult<Tensor>;

    // -- comparisons & select -----------------------------------------------
    fn greater_than_scalar_into(&self, dst: &Tensor, a: &Tensor, threshold: f32) -> BackendResult<()>;
    fn where_into(&self, dst: &Tensor, cond: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()>;

    // -- linear algebra -----------------------------------------------------
    /// `a @ b`, both 2D.
    fn matmul_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()>;
    /// `a @ b^T`.
    fn matmul_nt_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()>;
    /// `a^T @ b`.
    fn matmul_tn_into(&self, dst: &Tensor, a: &Tensor, b: &Tensor) -> BackendResult<()>;
    fn transpose2d(&self, a: &Tensor) -> BackendResult<Tensor>;
    fn dot(&self, a: &Tensor, b: &Tensor) -> BackendResult<f32>;
    fn l2_normalize_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()>;

    /// `dst[b,:] = mat[b,:] + bias` for `mat: [batch, features]`, `bias: [features]`.
    fn add_bias_rows_into(&self, dst: &Tensor, mat: &Tensor, bias: &Tensor) -> BackendResult<()>;
    /// `dst[f] = sum_b mat[b, f]`.
    fn sum_rows_into(&self, dst: &Tensor, mat: &Tensor) -> BackendResult<()>;

    // -- activations (forward + fused backward) ------------------------------
    fn relu_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()>;
    fn relu_backward_into(&self, dst: &Tensor, grad_out: &Tensor, input: &Tensor) -> BackendResult<()>;
    fn sigmoid_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()>;
    fn sigmoid_backward_into(&self, dst: &Tensor, grad_out: &Tensor, fwd_output: &Tensor) -> BackendResult<()>;
    fn tanh_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()>;
    fn tanh_backward_into(&self, dst: &Tensor, grad_out: &Tensor, fwd_output: &Tensor) -> BackendResult<()>;
    /// Numerically stable softmax along the last dimension.
    fn softmax_last_dim_into(&self, dst: &Tensor, a: &Tensor) -> BackendResult<()>;
    /// `grad_in = y * (grad_out - sum(grad_out * y, last_dim))`.
    fn softmax_backward_last_dim_into(&self, dst: &Tensor, grad_out: &Tensor, fwd_output: &Tensor) -> BackendResult<()>;

    // -- dropout --------------------------------------------------------------
    /// Inverted-scaling mask: kept positions hold `1/(1-p)`, dropped hold `0`.
    fn dropout_mask(&self, shape: &Shape, p: f32, rng: &mut StdRng) -> Tensor;
    fn dropout_forward_into(&self, dst: &Tensor, a: &Tensor, mask: &Tensor) -> BackendResult<()>;
    fn dropout_backward_into(&self, dst: &Tensor, grad_out: &Tensor, mask: &Tensor) -> BackendResult<()>;

    // -- convolutions -----------------------------------------------------
    /// `input: [batch, in_ch, length]`, `kernels: [out_ch, in_ch, k]`.
    fn conv1d_into(&self, dst: &Tensor, input: &Tensor, kernels: &Tensor, stride: usize, pad: usize) -> BackendResult<()>;
    fn conv1d_kernel_grad(&self, grad_output: &Tensor, input: &Tensor, kernel_shape: &Shape, stride: usize, pad: usize) -> BackendResult<Tensor>;
    /// Transposed (gradient w.r.t. input) 1D convolution, no bias.
    fn conv1d_transpose_into(&self, dst: &Tensor, grad_output: &Tensor, kernels: &Tensor, stride: usize, pad: usize) -> BackendResult<()>;

    /// `input: [batch, in_ch, h, w]`, `kernels: [out_ch, in_ch, kh, kw]`.
    fn conv2d_into(&self, dst: &Tensor, input: &Tensor, kernels: &Tensor, stride: Hw, pad: Hw) -> BackendResult<()>;
    /// `[batch * out_h * out_w, in_ch * kh * kw]` patch matrix.
    fn im2col(&self, input: &Tensor, kh: usize, kw: usize, stride: Hw, pad: Hw, out_hw: Hw) -> BackendResult<Tensor>;
    fn conv2d_kernel_grad(&self, grad_output: &Tensor, input: &Tensor, kernel_shape: &Shape, stride: Hw, pad: Hw) -> BackendResult<Tensor>;
    fn conv2d_transpose_into(&self, dst: &Tensor, grad_output: &Tensor, kernels: &Tensor, stride: Hw, pad: Hw) -> BackendResult<()>;

    // -- pooling ------------------------------------------------------------
    fn maxpool2d_with_indices_into(&self, dst: &Tensor, indices: &Tensor, input: &Tensor, k: Hw, stride: Hw, pad: Hw) -> BackendResult<()>;
    /// Scatter-add `grad_output` into `dst_grad_input` (must be pre-zeroed by
    /// the caller) at the positions recorded in `indices`.
    fn maxpool2d_backward_into(&self, dst_grad_input: &Tensor, grad_output: &Tensor, indices: &Tensor) -> BackendResult<()>;
    fn avgpool2d_into(&self, dst: &Tensor, input: &Tensor, k: Hw, stride: Hw, pad: Hw) -> BackendResult<()>;
    fn avgpool2d_backward_into(&self, dst_grad_input: &Tensor, grad_output: &Tensor, k: Hw, stride: Hw, pad: Hw) -> BackendResult<()>;
    fn global_avgpool2d_into(&self, dst: &Tensor, input: &Tensor) -> BackendResult<()>;
    fn global_avgpool2d_backward_into(&self, dst_grad_input: &Tensor, grad_output: &Tensor) -> BackendResult<()>;

    // -- pad / concat -------------------------------------------------------
    fn pad_into(&self, dst: &Tensor, input: &Tensor, padding: &[(usize, usize)], value: f32) -> BackendResult<()>;
    fn pad_backward_into(&self, dst_grad_input: &Tensor, grad_output: &Tensor, padding: &[(usize, usize)]) -> BackendResult<()>;
    fn concat_into(&self, dst: &Tensor, inputs: &[&Tensor], dim: usize) -> BackendResult<()>;
}

pub mod cpu;
pub use cpu::CpuBackend;
