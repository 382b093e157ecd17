//! Parameter: a long-lived, trainable tensor owned by a layer. Distinct from
//! the intermediate scratch tensors a layer allocates during `init` — a
//! `Parameter` is what an external optimizer reads and writes between
//! training steps (spec.md §3, §9).

use crate::tensor::Tensor;

/// A trainable tensor plus its (lazily allocated) gradient accumulator.
///
/// `grad` starts `None`. The first `backward` call that needs to write a
/// gradient for this parameter allocates it via [`Parameter::grad_or_init`];
/// afterward [`Parameter::zero_grad`] zeroes the existing buffer in place
/// rather than dropping it, so steady-state training never reallocates.
#[derive(Clone)]
pub struct Parameter {
    data: Tensor,
    grad: Option<Tensor>,
    requires_grad: bool,
}

impl Parameter {
    pub fn new(data: Tensor) -> Self {
        Parameter {
            data,
            grad: None,
            requires_grad: true,
        }
    }

    pub fn frozen(data: Tensor) -> Self {
        Parameter {
            data,
            grad: None,
            requires_grad: false,
        }
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Tensor {
        &mut self.data
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// Gradient accumulated so far, if any has been written since the last
    /// `zero_grad`.
    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    /// The gradient tensor, allocating a zeroed buffer shaped like `data` on
    /// first use. Backward passes call this to get a destination to
    /// accumulate into via `add_scaled_into`/`add_into`.
    pub fn grad_or_init(&mut self) -> &Tensor {
        if self.grad.is_none() {
            self.grad = Some(Tensor::zeros(self.data.shape()));
        }
        self.grad.as_ref().unwrap()
    }

    /// Zero the gradient buffer in place, allocating it first if this is the
    /// first call (spec.md §3: "ZeroGrad() allocates grad if absent and sets
    /// all elements to zero").
    pub fn zero_grad(&mut self) {
        self.grad_or_init().fill(0.0);
    }
}
