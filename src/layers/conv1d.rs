//! Conv1D: 1D convolution with stride/pad and optional bias. Grounded in the
//! teacher's `nn::linear::Linear` for the parameter-lifecycle shape (weight
//! init, optional bias, accumulate-into-grad) and in `backend::cpu`'s
//! `conv1d_into`/`conv1d_kernel_grad`/`conv1d_transpose_into` for the actual
//! convolution math (spec.md §4.5).

use crate::backend::Backend;
use crate::error::{LayerError, LayerResult};
use crate::init::he_uniform;
use crate::layer::{Layer, LayerBase};
use crate::options::{LayerOptions, ParamIndex};
use crate::parameter::Parameter;
use crate::shape::Shape;
use crate::tensor::Tensor;

pub struct Conv1D {
    base: LayerBase,
    in_channels: usize,
    out_channels: usize,
    kernel_len: usize,
    stride: usize,
    pad: usize,
    use_bias: bool,
}

impl Conv1D {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_len: usize,
        stride: usize,
        pad: usize,
    ) -> LayerResult<Self> {
        Self::with_options(
            in_channels,
            out_channels,
            kernel_len,
            stride,
            pad,
            true,
            LayerOptions::new(),
        )
    }

    pub fn with_options(
        in_channels: usize,
        out_channels: usize,
        kernel_len: usize,
        stride: usize,
        pad: usize,
        use_bias: bool,
        options: LayerOptions,
    ) -> LayerResult<Self> {
        if in_channels == 0 || out_channels == 0 || kernel_len == 0 || stride == 0 {
            return Err(LayerError::InvalidArgument(
                "conv1d: channels, kernel_len, and stride must be positive".into(),
            ));
        }
        let kernel_shape = Shape::new(vec![out_channels, in_channels, kernel_len]);
        let mut base = LayerBase::new("conv1d", true, options);
        if !base.parameters.contains_key(&ParamIndex::Kernels) {
            let k = he_uniform(&kernel_shape, &mut base.rng);
            base.parameters.insert(ParamIndex::Kernels, Parameter::new(k));
        }
        if use_bias && !base.parameters.contains_key(&ParamIndex::Biases) {
            let b = Tensor::zeros(&Shape::new(vec![out_channels]));
            base.parameters.insert(ParamIndex::Biases, Parameter::new(b));
        }
        Ok(Conv1D {
            base,
            in_channels,
            out_channels,
            kernel_len,
            stride,
            pad,
            use_bias,
        })
    }

    fn out_len(&self, length: usize) -> LayerResult<usize> {
        let numerator = length + 2 * self.pad;
        if numerator < self.kernel_len {
            return Err(LayerError::ShapeMismatch(format!(
                "conv1d: input length {length} with padding {} too small for kernel {}",
                self.pad, self.kernel_len
            )));
        }
        let out = (numerator - self.kernel_len) / self.stride + 1;
        if out == 0 {
            return Err(LayerError::ShapeMismatch(
                "conv1d: computed output length is zero".into(),
            ));
        }
        Ok(out)
    }
}

impl Layer for Conv1D {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        let dims = input_shape.dims();
        if dims.len() != 3 {
            return Err(LayerError::IncompatibleInput(format!(
                "conv1d: expected rank-3 input [batch, in_ch, length], got rank {}",
                dims.len()
            )));
        }
        if dims[1] != self.in_channels {
            return Err(LayerError::ShapeMismatch(format!(
                "conv1d: input channels {} != in_channels {}",
                dims[1], self.in_channels
            )));
        }
        let out_len = self.out_len(dims[2])?;
        let batch = dims[0];
        self.base.set_scratch(
            "output",
            Tensor::zeros(&Shape::new(vec![batch, self.out_channels, out_len])),
        );
        self.base.set_scratch("grad_input", Tensor::zeros(input_shape));
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        let dims = input_shape.dims();
        if dims.len() != 3 {
            return Err(LayerError::IncompatibleInput(
                "conv1d: expected rank-3 input".into(),
            ));
        }
        let out_len = self.out_len(dims[2])?;
        Ok(Shape::new(vec![dims[0], self.out_channels, out_len]))
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        self.base.require_compute_supported()?;
        let dims = input.shape().dims();
        let batch = dims[0];
        let out_len = self.out_len(dims[2])?;
        let expected_shape = Shape::new(vec![batch, self.out_channels, out_len]);
        if self.base.get_scratch("output")?.shape() != &expected_shape {
            self.base.set_scratch("output", Tensor::zeros(&expected_shape));
            self.base.set_scratch("grad_input", Tensor::zeros(input.shape()));
        }

        let kernels = self.base.get_param(ParamIndex::Kernels)?.data().clone();
        let output = self.base.get_scratch("output")?.clone();
        self.base
            .backend
            .conv1d_into(&output, &input, &kernels, self.stride, self.pad)?;

        if self.use_bias {
            let bias = self.base.get_param(ParamIndex::Biases)?.data().clone();
            let biasd = bias.data().to_vec();
            for b in 0..batch {
                for co in 0..self.out_channels {
                    for ol in 0..out_len {
                        output.data_mut()[(b * self.out_channels + co) * out_len + ol] += biasd[co];
                    }
                }
            }
        }

        self.base.last_output = Some(output.clone());
        self.base.last_input = Some(input);
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
        let input = self.base.require_forwarded()?.clone();

        if self.base.can_learn {
            let kernel_shape = self.base.get_param(ParamIndex::Kernels)?.data().shape().clone();
            let grad_kernel_delta = self.base.backend.conv1d_kernel_grad(
                grad_output,
                &input,
                &kernel_shape,
                self.stride,
                self.pad,
            )?;
            {
                let param = self.base.get_param_mut(ParamIndex::Kernels)?;
                if param.requires_grad() {
                    let grad = param.grad_or_init().clone();
                    grad.accumulate_add(&grad_kernel_delta)?;
                }
            }

            if self.use_bias {
                let god = grad_output.shape().dims();
                let (batch, out_len) = (god[0], god[2]);
                let godata = grad_output.data();
                let mut delta = vec![0.0f32; self.out_channels];
                for b in 0..batch {
                    for co in 0..self.out_channels {
                        for ol in 0..out_len {
                            delta[co] += godata[(b * self.out_channels + co) * out_len + ol];
                        }
                    }
                }
                let grad_bias_delta =
                    Tensor::from_vec(delta, Shape::new(vec![self.out_channels]))?;
                let param = self.base.get_param_mut(ParamIndex::Biases)?;
                if param.requires_grad() {
                    let grad = param.grad_or_init().clone();
                    grad.accumulate_add(&grad_bias_delta)?;
                }
            }
        }

        let kernels = self.base.get_param(ParamIndex::Kernels)?.data().clone();
        let grad_input = self.base.get_scratch("grad_input")?.clone();
        self.base
            .backend
            .conv1d_transpose_into(&grad_input, grad_output, &kernels, self.stride, self.pad)?;
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

    #[test]
    fn worked_example_small_kernel() {
        let mut options = LayerOptions::new();
        let k = Tensor::from_vec(vec![1.0, 1.0], Shape::new(vec![1, 1, 2])).unwrap();
        options = options.parameter(ParamIndex::Kernels, Parameter::new(k));
        let mut conv = Conv1D::with_options(1, 1, 2, 1, 0, true, options).unwrap();
        conv.init(&Shape::new(vec![1, 1, 4])).unwrap();

        let input = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![1, 1, 4])).unwrap();
        let out = conv.forward(input).unwrap();
        assert_eq!(out.to_vec(), vec![3.0, 5.0, 7.0]);

        let grad_out = Tensor::ones(&Shape::new(vec![1, 1, 3]));
        let grad_in = conv.backward(&grad_out).unwrap();

        let grad_kernel = conv.base.get_param(ParamIndex::Kernels).unwrap().grad().unwrap().to_vec();
        assert_eq!(grad_kernel, vec![6.0, 9.0]);

        let grad_bias = conv.base.get_param(ParamIndex::Biases).unwrap().grad().unwrap().to_vec();
        assert_eq!(grad_bias, vec![3.0]);

        assert_eq!(grad_in.to_vec(), vec![1.0, 2.0, 2.0, 1.0]);
    }

    #[test]
    fn init_rejects_non_rank3() {
        let mut conv = Conv1D::new(1, 1, 2, 1, 0).unwrap();
        assert!(conv.init(&Shape::new(vec![1, 4])).is_err());
    }

    #[test]
    fn reinit_reallocates_on_batch_change() {
        let mut conv = Conv1D::new(1, 1, 2, 1, 0).unwrap();
        conv.init(&Shape::new(vec![1, 1, 4])).unwrap();
        conv.init(&Shape::new(vec![2, 1, 4])).unwrap();
        let input = Tensor::zeros(&Shape::new(vec![2, 1, 4]));
        let out = conv.forward(input).unwrap();
        assert_eq!(out.shape().dims(), &[2, 1, 3]);
    }

    #[test]
    fn gradient_check_kernels() {
        use crate::layer::numerical_grad;

        let mut options = LayerOptions::new();
        let k = Tensor::from_vec(vec![0.4, -0.3], Shape::new(vec![1, 1, 2])).unwrap();
        options = options.parameter(ParamIndex::Kernels, Parameter::new(k));
        let mut conv = Conv1D::with_options(1, 1, 2, 1, 0, true, options).unwrap();
        conv.init(&Shape::new(vec![1, 1, 4])).unwrap();
        let input = Tensor::from_vec(vec![1.0, 2.0, -1.0, 0.5], Shape::new(vec![1, 1, 4])).unwrap();

        let out = conv.forward(input.clone()).unwrap();
        let grad_out = Tensor::ones(out.shape());
        conv.backward(&grad_out).unwrap();

        let kernels = conv.base.get_param(ParamIndex::Kernels).unwrap().data().clone();
        let analytic = conv
            .base
            .get_param(ParamIndex::Kernels)
            .unwrap()
            .grad()
            .unwrap()
            .to_vec();

        for idx in 0..kernels.numel() {
            let numeric = numerical_grad(
                || {
                    let k_clone = kernels.deep_clone();
                    let out = Tensor::zeros(&Shape::new(vec![1, 1, 3]));
                    conv.base
                        .backend
                        .conv1d_into(&out, &input, &k_clone, conv.stride, conv.pad)
                        .unwrap();
                    out.to_vec().iter().sum()
                },
                &kernels,
                idx,
                1e-3,
            );
            assert!(
                (numeric - analytic[idx]).abs() < 1e-2,
                "idx={idx} numeric={numeric} analytic={}",
                analytic[idx]
            );
        }
    }
}
