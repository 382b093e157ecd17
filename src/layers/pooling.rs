//! Pooling: MaxPool2D (with stored indices), AvgPool2D, GlobalAvgPool2D.
//! Parameter-free; grounded in `backend::cpu`'s `maxpool2d_with_indices_into`/
//! `maxpool2d_backward_into`/`avgpool2d_into`/`avgpool2d_backward_into`/
//! `global_avgpool2d_*`, following the same scratch-allocation shape as
//! `Conv2D` (this crate) for the shape-conditional output buffer (spec.md
//! §4.7).

use crate::backend::{Backend, Hw};
use crate::error::{LayerError, LayerResult};
use crate::layer::{Layer, LayerBase};
use crate::options::LayerOptions;
use crate::shape::Shape;
use crate::tensor::Tensor;

fn out_hw(h: usize, w: usize, k: Hw, stride: Hw, pad: Hw) -> LayerResult<Hw> {
    let (kh, kw) = k;
    let (sh, sw) = stride;
    let (ph, pw) = pad;
    let hn = h + 2 * ph;
    let wn = w + 2 * pw;
    if hn < kh || wn < kw {
        return Err(LayerError::ShapeMismatch(format!(
            "pooling: input {h}x{w} with padding {ph}x{pw} too small for kernel {kh}x{kw}"
        )));
    }
    let out_h = (hn - kh) / sh + 1;
    let out_w = (wn - kw) / sw + 1;
    if out_h == 0 || out_w == 0 {
        return Err(LayerError::ShapeMismatch(
            "pooling: computed output extent is zero".into(),
        ));
    }
    Ok((out_h, out_w))
}

fn require_rank4(input_shape: &Shape, who: &str) -> LayerResult<[usize; 4]> {
    let dims = input_shape.dims();
    if dims.len() != 4 {
        return Err(LayerError::IncompatibleInput(format!(
            "{who}: expected rank-4 input [batch, channels, h, w], got rank {}",
            dims.len()
        )));
    }
    Ok([dims[0], dims[1], dims[2], dims[3]])
}

/// 2x2-or-general max pooling. Forward stores the linear index (into the
/// input) that produced each output element; backward scatter-adds gradient
/// into those positions, so overlapping windows accumulate.
pub struct MaxPool2D {
    base: LayerBase,
    k: Hw,
    stride: Hw,
    pad: Hw,
}

impl MaxPool2D {
    pub fn new(k: Hw, stride: Hw, pad: Hw) -> LayerResult<Self> {
        Self::with_options(k, stride, pad, LayerOptions::new())
    }

    pub fn with_options(k: Hw, stride: Hw, pad: Hw, options: LayerOptions) -> LayerResult<Self> {
        if k.0 == 0 || k.1 == 0 || stride.0 == 0 || stride.1 == 0 {
            return Err(LayerError::InvalidArgument(
                "maxpool2d: kernel and stride extents must be positive".into(),
            ));
        }
        Ok(MaxPool2D {
            base: LayerBase::new("maxpool2d", false, options),
            k,
            stride,
            pad,
        })
    }

    fn ensure_scratch(&mut self, batch: usize, channels: usize, in_shape: &Shape, out_h: usize, out_w: usize) {
        let out_shape = Shape::new(vec![batch, channels, out_h, out_w]);
        let need_realloc = self
            .base
            .scratch
            .get("output")
            .map(|t| t.shape() != &out_shape)
            .unwrap_or(true);
        if need_realloc {
            self.base.set_scratch("output", Tensor::zeros(&out_shape));
            self.base.set_scratch("indices", Tensor::zeros(&out_shape));
            self.base.set_scratch("grad_input", Tensor::zeros(in_shape));
        }
    }
}

impl Layer for MaxPool2D {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        let [batch, channels, h, w] = require_rank4(input_shape, "maxpool2d")?;
        let (out_h, out_w) = out_hw(h, w, self.k, self.stride, self.pad)?;
        self.ensure_scratch(batch, channels, input_shape, out_h, out_w);
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        let [batch, channels, h, w] = require_rank4(input_shape, "maxpool2d")?;
        let (out_h, out_w) = out_hw(h, w, self.k, self.stride, self.pad)?;
        Ok(Shape::new(vec![batch, channels, out_h, out_w]))
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        self.base.require_compute_supported()?;
        let [batch, channels, h, w] = require_rank4(input.shape(), "maxpool2d")?;
        let (out_h, out_w) = out_hw(h, w, self.k, self.stride, self.pad)?;
        self.ensure_scratch(batch, channels, input.shape(), out_h, out_w);

        let output = self.base.get_scratch("output")?.clone();
        let indices = self.base.get_scratch("indices")?.clone();
        self.base
            .backend
            .maxpool2d_with_indices_into(&output, &indices, &input, self.k, self.stride, self.pad)?;

        self.base.last_output = Some(output.clone());
        self.base.last_input = Some(input);
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
        self.base.require_forwarded()?;
        let indices = self.base.get_scratch("indices")?.clone();
        let grad_input = self.base.get_scratch("grad_input")?.clone();
        grad_input.fill(0.0);
        self.base
            .backend
            .maxpool2d_backward_into(&grad_input, grad_output, &indices)?;
        Ok(grad_input)
    }
}

/// Mean pooling: forward averages each window; backward spreads each output
/// gradient uniformly (`1/(kh*kw)`) across its source window, accumulating
/// where windows overlap.
pub struct AvgPool2D {
    base: LayerBase,
    k: Hw,
    stride: Hw,
    pad: Hw,
}

impl AvgPool2D {
    pub fn new(k: Hw, stride: Hw, pad: Hw) -> LayerResult<Self> {
        Self::with_options(k, stride, pad, LayerOptions::new())
    }

    pub fn with_options(k: Hw, stride: Hw, pad: Hw, options: LayerOptions) -> LayerResult<Self> {
        if k.0 == 0 || k.1 == 0 || stride.0 == 0 || stride.1 == 0 {
            return Err(LayerError::InvalidArgument(
                "avgpool2d: kernel and stride extents must be positive".into(),
            ));
        }
        Ok(AvgPool2D {
            base: LayerBase::new("avgpool2d", false, options),
            k,
            stride,
            pad,
        })
    }

    fn ensure_scratch(&mut self, batch: usize, channels: usize, in_shape: &Shape, out_h: usize, out_w: usize) {
        let out_shape = Shape::new(vec![batch, channels, out_h, out_w]);
        let need_realloc = self
            .base
            .scratch
            .get("output")
            .map(|t| t.shape() != &out_shape)
            .unwrap_or(true);
        if need_realloc {
            self.base.set_scratch("output", Tensor::zeros(&out_shape));
            self.base.set_scratch("grad_input", Tensor::zeros(in_shape));
        }
    }
}

impl Layer for AvgPool2D {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        let [batch, channels, h, w] = require_rank4(input_shape, "avgpool2d")?;
        let (out_h, out_w) = out_hw(h, w, self.k, self.stride, self.pad)?;
        self.ensure_scratch(batch, channels, input_shape, out_h, out_w);
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        let [batch, channels, h, w] = require_rank4(input_shape, "avgpool2d")?;
        let (out_h, out_w) = out_hw(h, w, self.k, self.stride, self.pad)?;
        Ok(Shape::new(vec![batch, channels, out_h, out_w]))
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        self.base.require_compute_supported()?;
        let [batch, channels, h, w] = require_rank4(input.shape(), "avgpool2d")?;
        let (out_h, out_w) = out_hw(h, w, self.k, self.stride, self.pad)?;
        self.ensure_scratch(batch, channels, input.shape(), out_h, out_w);

        let output = self.base.get_scratch("output")?.clone();
        self.base
            .backend
            .avgpool2d_into(&output, &input, self.k, self.stride, self.pad)?;

        self.base.last_output = Some(output.clone());
        self.base.last_input = Some(input);
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
        self.base.require_forwarded()?;
        let grad_input = self.base.get_scratch("grad_input")?.clone();
        self.base
            .backend
            .avgpool2d_backward_into(&grad_input, grad_output, self.k, self.stride, self.pad)?;
        Ok(grad_input)
    }
}

/// Reduces spatial dimensions to a per-channel mean: `[batch, channels, H,
/// W] -> [batch, channels]`. Backward is only meaningful when the layer is
/// learning something downstream needs input gradients for; per spec.md
/// §4.7/§9, a non-learnable instance returns a zero-gradient of the input's
/// shape rather than erroring.
pub struct GlobalAvgPool2D {
    base: LayerBase,
}

impl GlobalAvgPool2D {
    pub fn new() -> Self {
        Self::with_options(LayerOptions::new())
    }

    pub fn with_options(options: LayerOptions) -> Self {
        GlobalAvgPool2D {
            base: LayerBase::new("global_avgpool2d", false, options),
        }
    }
}

impl Default for GlobalAvgPool2D {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for GlobalAvgPool2D {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        let [batch, channels, _, _] = require_rank4(input_shape, "global_avgpool2d")?;
        self.base
            .set_scratch("output", Tensor::zeros(&Shape::new(vec![batch, channels])));
        self.base.set_scratch("grad_input", Tensor::zeros(input_shape));
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        let [batch, channels, _, _] = require_rank4(input_shape, "global_avgpool2d")?;
        Ok(Shape::new(vec![batch, channels]))
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        self.base.require_compute_supported()?;
        let [batch, channels, _, _] = require_rank4(input.shape(), "global_avgpool2d")?;
        let out_shape = Shape::new(vec![batch, channels]);
        if self.base.get_scratch("output")?.shape() != &out_shape {
            self.base.set_scratch("output", Tensor::zeros(&out_shape));
            self.base.set_scratch("grad_input", Tensor::zeros(input.shape()));
        }
        let output = self.base.get_scratch("output")?.clone();
        self.base.backend.global_avgpool2d_into(&output, &input)?;
        self.base.last_output = Some(output.clone());
        self.base.last_input = Some(input);
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
        self.base.require_forwarded()?;
        let grad_input = self.base.get_scratch("grad_input")?.clone();
        if !self.base.can_learn {
            grad_input.fill(0.0);
            return Ok(grad_input);
        }
        self.base
            .backend
            .global_avgpool2d_backward_into(&grad_input, grad_output)?;
        Ok(grad_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maxpool_worked_example() {
        let mut pool = MaxPool2D::new((2, 2), (2, 2), (0, 0)).unwrap();
        pool.init(&Shape::new(vec![1, 1, 4, 4])).unwrap();
        #[rustfmt::skip]
        let input = Tensor::from_vec(
            vec![
                1.0, 2.0, 3.0, 4.0,
                5.0, 6.0, 7.0, 8.0,
                9.0, 10.0, 11.0, 12.0,
                13.0, 14.0, 15.0, 16.0,
            ],
            Shape::new(vec![1, 1, 4, 4]),
        )
        .unwrap();
        let out = pool.forward(input).unwrap();
        assert_eq!(out.to_vec(), vec![6.0, 8.0, 14.0, 16.0]);

        let grad_out = Tensor::ones(&Shape::new(vec![1, 1, 2, 2]));
        let grad_in = pool.backward(&grad_out).unwrap();
        let expected_ones = [5usize, 7, 13, 15];
        for (i, v) in grad_in.to_vec().iter().enumerate() {
            if expected_ones.contains(&i) {
                assert_eq!(*v, 1.0);
            } else {
                assert_eq!(*v, 0.0);
            }
        }
    }

    #[test]
    fn avgpool_worked_example() {
        let mut pool = AvgPool2D::new((2, 2), (2, 2), (0, 0)).unwrap();
        pool.init(&Shape::new(vec![1, 1, 4, 4])).unwrap();
        #[rustfmt::skip]
        let input = Tensor::from_vec(
            vec![
                1.0, 2.0, 3.0, 4.0,
                5.0, 6.0, 7.0, 8.0,
                9.0, 10.0, 11.0, 12.0,
                13.0, 14.0, 15.0, 16.0,
            ],
            Shape::new(vec![1, 1, 4, 4]),
        )
        .unwrap();
        let out = pool.forward(input).unwrap();
        assert_eq!(out.to_vec(), vec![3.5, 5.5, 11.5, 13.5]);

        let grad_out = Tensor::from_vec(vec![4.0, 4.0, 4.0, 4.0], Shape::new(vec![1, 1, 2, 2])).unwrap();
        let grad_in = pool.backward(&grad_out).unwrap();
        assert_eq!(grad_in.to_vec(), vec![1.0; 16]);
    }

    #[test]
    fn global_avgpool_non_learnable_returns_zero_grad() {
        let mut pool = GlobalAvgPool2D::new();
        pool.init(&Shape::new(vec![1, 2, 2, 2])).unwrap();
        let input = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], Shape::new(vec![1, 2, 2, 2])).unwrap();
        let out = pool.forward(input).unwrap();
        assert_eq!(out.to_vec(), vec![2.5, 6.5]);
        let grad_out = Tensor::ones(out.shape());
        let grad_in = pool.backward(&grad_out).unwrap();
        assert_eq!(grad_in.to_vec(), vec![0.0; 8]);
    }
}
