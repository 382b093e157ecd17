//! The layer contract: `Init(shape) -> Forward(input) -> Backward(grad_output)`
//! (spec.md §4). This replaces the teacher's graph-based `Module` trait
//! (`forward` / `forward_graph` against an `autograd::Graph`) with direct,
//! layer-owned Forward/Backward math — there is no arbitrary computation
//! graph in this crate, so every layer computes its own gradients against
//! its own cached input/output rather than recording ops for a later
//! graph walk.

use crate::backend::{Backend, CpuBackend};
use crate::error::{LayerError, LayerResult};
use crate::options::{LayerOptions, ParamIndex};
use crate::parameter::Parameter;
use crate::shape::{DataType, Shape};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use std::collections::HashMap;

/// A trainable or stateless layer following the Init/Forward/Backward
/// contract. Every method is fallible; layers never panic on malformed
/// input, only on violated internal invariants (an `init`ed scratch tensor
/// whose shape drifted).
pub trait Layer {
    /// Allocate parameters (if not already injected) and scratch tensors for
    /// a given input shape. Calling `init` again with a new shape is valid
    /// and re-allocates scratch; existing parameter data is preserved.
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()>;

    /// The output shape this layer would produce for `input_shape`, without
    /// mutating any state. Valid to call before `init`.
    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape>;

    /// Run the forward pass, caching whatever `backward` will need. Takes
    /// `input` by value to match the external tensor contract's handle
    /// semantics (cloning a `Tensor` clones a cheap `Rc` handle, not the
    /// underlying storage); the layer stores its own clone as `last_input`.
    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor>;

    /// Run the backward pass given the gradient of the loss w.r.t. this
    /// layer's output, returning the gradient w.r.t. its input. Parameter
    /// gradients (if any) are accumulated into `self`'s parameters; callers
    /// use [`Layer::parameters_mut`] plus `zero_grad` to manage accumulation
    /// across steps.
    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor>;

    /// This layer's trainable parameters, empty for stateless layers
    /// (activations, pooling, shape ops).
    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }

    /// Zero every parameter's gradient buffer in place.
    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    /// True if this layer has any trainable parameters at all.
    fn can_learn(&self) -> bool {
        !self.parameters().is_empty()
    }
}

/// Shared state every concrete layer embeds: identity, RNG, the backend it
/// dispatches compute to, cached tensors from the last forward, its
/// parameter table, and named scratch buffers allocated once in `init` and
/// reused on every subsequent forward/backward (spec.md §5's zero-allocation
/// steady state).
pub struct LayerBase {
    pub name: String,
    pub can_learn: bool,
    pub data_type: DataType,
    pub backend: CpuBackend,
    pub rng: StdRng,
    pub parameters: HashMap<ParamIndex, Parameter>,
    pub scratch: HashMap<String, Tensor>,
    pub last_input: Option<Tensor>,
    pub last_output: Option<Tensor>,
    initialized: bool,
}

impl LayerBase {
    pub fn new(default_name: &str, can_learn: bool, options: LayerOptions) -> Self {
        let rng = options.rng.unwrap_or_else(crate::runtime::child_rng);
        LayerBase {
            name: options.name.unwrap_or_else(|| default_name.to_string()),
            can_learn: options.can_learn.unwrap_or(can_learn),
            data_type: options.data_type.unwrap_or_default(),
            backend: CpuBackend::new(),
            rng,
            parameters: options.parameters,
            scratch: HashMap::new(),
            last_input: None,
            last_output: None,
            initialized: false,
        }
    }

    /// Validate that the data type is one this crate's kernels support,
    /// returning `RuntimeFailure` rather than panicking otherwise
    /// (spec.md §9's data-type note).
    pub fn require_compute_supported(&self) -> LayerResult<()> {
        if !self.data_type.is_compute_supported() {
            return Err(LayerError::RuntimeFailure(format!(
                "{}: data type {} has no compute kernel",
                self.name, self.data_type
            )));
        }
        Ok(())
    }

    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn require_initialized(&self) -> LayerResult<()> {
        if !self.initialized {
            return Err(LayerError::NotInitialized(format!(
                "{}: init() must be called before forward()",
                self.name
            )));
        }
        Ok(())
    }

    pub fn require_forwarded(&self) -> LayerResult<&Tensor> {
        self.last_input.as_ref().ok_or_else(|| {
            LayerError::NotForwarded(format!(
                "{}: backward() called before forward()",
                self.name
            ))
        })
    }

    pub fn get_scratch(&self, key: &str) -> LayerResult<&Tensor> {
        self.scratch.get(key).ok_or_else(|| {
            LayerError::NotInitialized(format!(
                "{}: scratch tensor '{key}' missing; call init() first",
                self.name
            ))
        })
    }

    pub fn set_scratch(&mut self, key: &str, tensor: Tensor) {
        self.scratch.insert(key.to_string(), tensor);
    }

    pub fn get_param(&self, index: ParamIndex) -> LayerResult<&Parameter> {
        self.parameters.get(&index).ok_or_else(|| {
            LayerError::MissingParameter(format!("{}: parameter {index} not set", self.name))
        })
    }

    pub fn get_param_mut(&mut self, index: ParamIndex) -> LayerResult<&mut Parameter> {
        let name = self.name.clone();
        self.parameters
            .get_mut(&index)
            .ok_or_else(|| LayerError::MissingParameter(format!("{name}: parameter {index} not set")))
    }
}

/// Central finite-difference numerical gradient check for a single scalar
/// element of a tensor, used by layer tests to validate analytic
/// `backward` implementations against a loss defined as `sum(output)`.
/// Grounded in the teacher's `autograd::check::numerical_grad`, adapted to
/// the Init/Forward/Backward contract (no `Graph`).
#[cfg(any(test, feature = "test-support"))]
pub fn numerical_grad<F>(mut loss_fn: F, tensor: &Tensor, index: usize, eps: f32) -> f32
where
    F: FnMut() -> f32,
{
    let original = tensor.data()[index];
    tensor.data_mut()[index] = original + eps;
    let plus = loss_fn();
    tensor.data_mut()[index] = original - eps;
    let minus = loss_fn();
    tensor.data_mut()[index] = original;
    (plus - minus) / (2.0 * eps)
}
