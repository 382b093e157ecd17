//! Dense (fully connected): `output = input @ weights + bias`. Grounded in
//! the teacher's `nn::linear::Linear`, generalized from a 2D-only forward to
//! accept both `[in]` and `[batch, in]` input per spec.md §4.4, and
//! re-pointed at the non-graph `Layer` contract with explicit backward math
//! instead of `forward_graph`.

use crate::backend::Backend;
use crate::error::{LayerError, LayerResult};
use crate::init::xavier_uniform;
use crate::layer::{Layer, LayerBase};
use crate::options::{LayerOptions, ParamIndex};
use crate::parameter::Parameter;
use crate::shape::Shape;
use crate::tensor::Tensor;

pub struct Dense {
    base: LayerBase,
    in_features: usize,
    out_features: usize,
    use_bias: bool,
}

impl Dense {
    pub fn new(in_features: usize, out_features: usize) -> LayerResult<Self> {
        Self::with_options(in_features, out_features, true, LayerOptions::new())
    }

    pub fn with_options(
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        options: LayerOptions,
    ) -> LayerResult<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(LayerError::InvalidArgument(
                "dense: in_features and out_features must be positive".into(),
            ));
        }
        let weight_shape = Shape::new(vec![in_features, out_features]);
        let mut base = LayerBase::new("dense", true, options);
        if !base.parameters.contains_key(&ParamIndex::Weights) {
            let w = xavier_uniform(&weight_shape, &mut base.rng);
            base.parameters.insert(ParamIndex::Weights, Parameter::new(w));
        }
        if use_bias && !base.parameters.contains_key(&ParamIndex::Biases) {
            let b = Tensor::zeros(&Shape::new(vec![out_features]));
            base.parameters.insert(ParamIndex::Biases, Parameter::new(b));
        }
        Ok(Dense {
            base,
            in_features,
            out_features,
            use_bias,
        })
    }

    fn as_2d(&self, input: &Tensor) -> LayerResult<(Tensor, bool)> {
        match input.rank() {
            1 => {
                let reshaped = input.view_reshape(Shape::new(vec![1, self.in_features]))?;
                Ok((reshaped, true))
            }
            2 => Ok((input.clone(), false)),
            r => Err(LayerError::IncompatibleInput(format!(
                "dense: expected rank 1 or 2 input, got rank {r}"
            ))),
        }
    }

    /// (Re)allocate the forward/backward scratch for a given batch size.
    /// Shape-conditional, like `Conv2D`'s: a batch-size change reallocates,
    /// a repeat call with the same batch is a no-op (spec.md §9).
    fn ensure_scratch(&mut self, batch: usize) {
        let matmul_shape = Shape::new(vec![batch, self.out_features]);
        let need_realloc = self
            .base
            .scratch
            .get("matmul_out")
            .map(|t| t.shape() != &matmul_shape)
            .unwrap_or(true);
        if !need_realloc {
            return;
        }
        self.base.set_scratch("matmul_out", Tensor::zeros(&matmul_shape));
        if self.use_bias {
            self.base.set_scratch("output", Tensor::zeros(&matmul_shape));
        }
        self.base
            .set_scratch("grad_input", Tensor::zeros(&Shape::new(vec![batch, self.in_features])));
        self.base.set_scratch(
            "grad_weights_delta",
            Tensor::zeros(&Shape::new(vec![self.in_features, self.out_features])),
        );
        if self.use_bias {
            self.base
                .set_scratch("grad_bias_delta", Tensor::zeros(&Shape::new(vec![self.out_features])));
        }
    }
}

impl Layer for Dense {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        let last = *input_shape.dims().last().ok_or_else(|| {
            LayerError::IncompatibleInput("dense: input shape has no dimensions".into())
        })?;
        if last != self.in_features {
            return Err(LayerError::ShapeMismatch(format!(
                "dense: input feature dim {} != in_features {}",
                last, self.in_features
            )));
        }
        let batch = if input_shape.rank() == 1 { 1 } else { input_shape.dims()[0] };
        self.ensure_scratch(batch);
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        let mut dims = input_shape.dims().to_vec();
        *dims.last_mut().unwrap() = self.out_features;
        Ok(Shape::new(dims))
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        self.base.require_compute_supported()?;
        let (input_2d, was_1d) = self.as_2d(&input)?;
        let batch = input_2d.shape().dims()[0];
        self.ensure_scratch(batch);
        let weights = self.base.get_param(ParamIndex::Weights)?.data().clone();
        let matmul_out = self.base.get_scratch("matmul_out")?.clone();
        self.base.backend.matmul_into(&matmul_out, &input_2d, &weights)?;

        let output_2d = if self.use_bias {
            let bias = self.base.get_param(ParamIndex::Biases)?.data().clone();
            let with_bias = self.base.get_scratch("output")?.clone();
            self.base.backend.add_bias_rows_into(&with_bias, &matmul_out, &bias)?;
            with_bias
        } else {
            matmul_out
        };

        let output = if was_1d {
            output_2d.view_reshape(Shape::new(vec![self.out_features]))?
        } else {
            output_2d
        };
        self.base.last_input = Some(input);
        self.base.last_output = Some(output.clone());
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
        let input = self.base.require_forwarded()?.clone();
        let (input_2d, was_1d) = self.as_2d(&input)?;
        let batch = input_2d.shape().dims()[0];
        self.ensure_scratch(batch);
        let grad_2d = if was_1d {
            grad_output.view_reshape(Shape::new(vec![1, self.out_features]))?
        } else {
            grad_output.clone()
        };

        let weights = self.base.get_param(ParamIndex::Weights)?.data().clone();

        // grad_input = grad_output @ weights^T
        let grad_input_2d = self.base.get_scratch("grad_input")?.clone();
        self.base.backend.matmul_nt_into(&grad_input_2d, &grad_2d, &weights)?;

        if self.base.can_learn {
            // grad_weights = input^T @ grad_output, accumulated into the parameter grad.
            let grad_weights_delta = self.base.get_scratch("grad_weights_delta")?.clone();
            self.base
                .backend
                .matmul_tn_into(&grad_weights_delta, &input_2d, &grad_2d)?;
            {
                let param = self.base.get_param_mut(ParamIndex::Weights)?;
                if param.requires_grad() {
                    let grad = param.grad_or_init().clone();
                    grad.accumulate_add(&grad_weights_delta)?;
                }
            }

            if self.use_bias {
                let grad_bias_delta = self.base.get_scratch("grad_bias_delta")?.clone();
                self.base.backend.sum_rows_into(&grad_bias_delta, &grad_2d)?;
                let param = self.base.get_param_mut(ParamIndex::Biases)?;
                if param.requires_grad() {
                    let grad = param.grad_or_init().clone();
                    grad.accumulate_add(&grad_bias_delta)?;
                }
            }
        }

        let grad_input = if was_1d {
            grad_input_2d.view_reshape(Shape::new(vec![self.in_features]))?
        } else {
            grad_input_2d
        };
        Ok(grad_input)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.base.parameters.values().collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.base.parameters.values_mut().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::numerical_grad;

    #[test]
    fn identity_weights_forward() {
        let mut options = LayerOptions::new();
        let w = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0], Shape::new(vec![2, 2])).unwrap();
        options = options.parameter(ParamIndex::Weights, Parameter::new(w));
        let mut dense = Dense::with_options(2, 2, false, options).unwrap();
        dense.init(&Shape::new(vec![2])).unwrap();
        let input = Tensor::from_vec(vec![3.0, 4.0], Shape::new(vec![2])).unwrap();
        let out = dense.forward(input).unwrap();
        assert_eq!(out.to_vec(), vec![3.0, 4.0]);
    }

    #[test]
    fn gradient_check_weights() {
        let mut options = LayerOptions::new();
        let w = Tensor::from_vec(vec![0.5, -0.3, 0.2, 0.7], Shape::new(vec![2, 2])).unwrap();
        options = options.parameter(ParamIndex::Weights, Parameter::new(w));
        let mut dense = Dense::with_options(2, 2, true, options).unwrap();
        dense.init(&Shape::new(vec![2])).unwrap();
        let input = Tensor::from_vec(vec![1.0, 2.0], Shape::new(vec![2])).unwrap();

        let out = dense.forward(input.clone()).unwrap();
        let grad_out = Tensor::ones(out.shape());
        dense.backward(&grad_out).unwrap();

        let weights = dense.base.get_param(ParamIndex::Weights).unwrap().data().clone();
        let analytic = dense
            .base
            .get_param(ParamIndex::Weights)
            .unwrap()
            .grad()
            .unwrap()
            .to_vec();

        for idx in 0..weights.numel() {
            let numeric = numerical_grad(
                || {
                    let w_clone = weights.deep_clone();
                    let b = dense.base.get_param(ParamIndex::Biases).unwrap().data().clone();
                    let matmul_out = Tensor::zeros(&Shape::new(vec![1, 2]));
                    dense
                        .base
                        .backend
                        .matmul_into(&matmul_out, &input.view_reshape(Shape::new(vec![1, 2])).unwrap(), &w_clone)
                        .unwrap();
                    let with_bias = Tensor::zeros(matmul_out.shape());
                    dense.base.backend.add_bias_rows_into(&with_bias, &matmul_out, &b).unwrap();
                    with_bias.to_vec().iter().sum()
                },
                &weights,
                idx,
                1e-3,
            );
            assert!((numeric - analytic[idx]).abs() < 1e-2, "idx={idx} numeric={numeric} analytic={}", analytic[idx]);
        }
    }
}
