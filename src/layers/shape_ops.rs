//! Shape-manipulation layers: Flatten, Reshape, Unsqueeze, Squeeze,
//! Transpose2D, Pad, Concatenate. All parameter-free; backward is the
//! inverse shape transform applied to `grad_output` (spec.md §4.3).

use crate::backend::Backend;
use crate::error::{LayerError, LayerResult};
use crate::layer::{Layer, LayerBase};
use crate::options::LayerOptions;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Collapses dimensions `[start_dim, end_dim)` (half-open) into one.
pub struct Flatten {
    base: LayerBase,
    start_dim: usize,
    end_dim: usize,
}

impl Flatten {
    pub fn new(start_dim: usize, end_dim: usize) -> LayerResult<Self> {
        Self::with_options(start_dim, end_dim, LayerOptions::new())
    }

    pub fn with_options(start_dim: usize, end_dim: usize, options: LayerOptions) -> LayerResult<Self> {
        if start_dim > end_dim {
            return Err(LayerError::InvalidArgument(format!(
                "flatten: start_dim {start_dim} > end_dim {end_dim}"
            )));
        }
        Ok(Flatten {
            base: LayerBase::new("flatten", false, options),
            start_dim,
            end_dim,
        })
    }
}

impl Layer for Flatten {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        if self.end_dim > input_shape.rank() {
            return Err(LayerError::ShapeMismatch(format!(
                "flatten: end_dim {} out of range for rank {}",
                self.end_dim,
                input_shape.rank()
            )));
        }
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        let dims = input_shape.dims();
        let mut out = dims[..self.start_dim].to_vec();
        let collapsed: usize = dims[self.start_dim..self.end_dim].iter().product();
        out.push(collapsed);
        out.extend_from_slice(&dims[self.end_dim..]);
        Ok(Shape::new(out))
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        let target = self.output_shape(input.shape())?;
        self.base.last_input = Some(input.clone());
        Ok(input.view_reshape(target)?)
    }

    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
        let input = self.base.require_forwarded()?;
        Ok(grad_output.view_reshape(input.shape().clone())?)
    }
}

/// Reshapes to an explicit target shape (same element count).
pub struct Reshape {
    base: LayerBase,
    target: Shape,
}

impl Reshape {
    pub fn new(target: Shape) -> Self {
        Self::with_options(target, LayerOptions::new())
    }

    pub fn with_options(target: Shape, options: LayerOptions) -> Self {
        Reshape {
            base: LayerBase::new("reshape", false, options),
            target,
        }
    }
}

impl Layer for Reshape {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        if input_shape.numel() != self.target.numel() {
            return Err(LayerError::ShapeMismatch(format!(
                "reshape: input numel {} != target numel {}",
                input_shape.numel(),
                self.target.numel()
            )));
        }
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, _input_shape: &Shape) -> LayerResult<Shape> {
        Ok(self.target.clone())
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        self.base.last_input = Some(input.clone());
        Ok(input.view_reshape(self.target.clone())?)
    }

    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
        let input = self.base.require_forwarded()?;
        Ok(grad_output.view_reshape(input.shape().clone())?)
    }
}

/// Inserts a size-1 dimension at `dim`.
pub struct Unsqueeze {
    base: LayerBase,
    dim: usize,
}

impl Unsqueeze {
    pub fn new(dim: usize) -> Self {
        Self::with_options(dim, LayerOptions::new())
    }

    pub fn with_options(dim: usize, options: LayerOptions) -> Self {
        Unsqueeze {
            base: LayerBase::new("unsqueeze", false, options),
            dim,
        }
    }
}

impl Layer for Unsqueeze {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        if self.dim > input_shape.rank() {
            return Err(LayerError::InvalidArgument(format!(
                "unsqueeze: dim {} out of range for rank {}",
                self.dim,
                input_shape.rank()
            )));
        }
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        let mut dims = input_shape.dims().to_vec();
        dims.insert(self.dim, 1);
        Ok(Shape::new(dims))
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        let target = self.output_shape(input.shape())?;
        self.base.last_input = Some(input.clone());
        Ok(input.view_reshape(target)?)
    }

    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
        let input = self.base.require_forwarded()?;
        Ok(grad_output.view_reshape(input.shape().clone())?)
    }
}

/// Removes a size-1 dimension at `dim`.
pub struct Squeeze {
    base: LayerBase,
    dim: usize,
}

impl Squeeze {
    pub fn new(dim: usize) -> Self {
        Self::with_options(dim, LayerOptions::new())
    }

    pub fn with_options(dim: usize, options: LayerOptions) -> Self {
        Squeeze {
            base: LayerBase::new("squeeze", false, options),
            dim,
        }
    }
}

impl Layer for Squeeze {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        let dims = input_shape.dims();
        if self.dim >= dims.len() || dims[self.dim] != 1 {
            return Err(LayerError::ShapeMismatch(format!(
                "squeeze: dim {} is not size-1 in shape {input_shape}",
                self.dim
            )));
        }
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        let mut dims = input_shape.dims().to_vec();
        dims.remove(self.dim);
        Ok(Shape::new(dims))
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        let target = self.output_shape(input.shape())?;
        self.base.last_input = Some(input.clone());
        Ok(input.view_reshape(target)?)
    }

    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
        let input = self.base.require_forwarded()?;
        Ok(grad_output.view_reshape(input.shape().clone())?)
    }
}

/// 2D transpose (swaps the two axes of a rank-2 tensor).
pub struct Transpose2D {
    base: LayerBase,
}

impl Transpose2D {
    pub fn new() -> Self {
        Self::with_options(LayerOptions::new())
    }

    pub fn with_options(options: LayerOptions) -> Self {
        Transpose2D {
            base: LayerBase::new("transpose2d", false, options),
        }
    }
}

impl Default for Transpose2D {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for Transpose2D {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        if input_shape.rank() != 2 {
            return Err(LayerError::IncompatibleInput(format!(
                "transpose2d: requires rank-2 input, got rank {}",
                input_shape.rank()
            )));
        }
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        let dims = input_shape.dims();
        Ok(Shape::new(vec![dims[1], dims[0]]))
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        self.base.require_compute_supported()?;
        let output = self.base.backend.transpose2d(&input)?;
        self.base.last_input = Some(input);
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
        self.base.require_forwarded()?;
        Ok(self.base.backend.transpose2d(grad_output)?)
    }
}

/// Constant-value padding along every dimension. Only the constant-fill
/// variant is implemented; reflect/replicate padding modes are an
/// intentionally unimplemented extension (spec.md §4.3).
pub struct Pad {
    base: LayerBase,
    padding: Vec<(usize, usize)>,
    value: f32,
}

impl Pad {
    pub fn new(padding: Vec<(usize, usize)>, value: f32) -> Self {
        Self::with_options(padding, value, LayerOptions::new())
    }

    pub fn with_options(padding: Vec<(usize, usize)>, value: f32, options: LayerOptions) -> Self {
        Pad {
            base: LayerBase::new("pad", false, options),
            padding,
            value,
        }
    }
}

impl Pad {
    /// Shape-conditional `output`/`grad_input` scratch, matching
    /// `Conv2D`'s pattern: reallocated only when the input shape changes.
    fn ensure_scratch(&mut self, input_shape: &Shape) -> LayerResult<()> {
        let target = self.output_shape(input_shape)?;
        let need_realloc = self
            .base
            .scratch
            .get("output")
            .map(|t| t.shape() != &target)
            .unwrap_or(true);
        if !need_realloc {
            return Ok(());
        }
        self.base.set_scratch("output", Tensor::zeros(&target));
        self.base.set_scratch("grad_input", Tensor::zeros(input_shape));
        Ok(())
    }
}

impl Layer for Pad {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        if self.padding.len() != input_shape.rank() {
            return Err(LayerError::InvalidArgument(format!(
                "pad: padding has {} entries, input rank is {}",
                self.padding.len(),
                input_shape.rank()
            )));
        }
        self.ensure_scratch(input_shape)?;
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        let dims = input_shape.dims();
        let out: Vec<usize> = dims
            .iter()
            .zip(self.padding.iter())
            .map(|(&d, &(lo, hi))| d + lo + hi)
            .collect();
        Ok(Shape::new(out))
    }

    fn forward(&mut self, input: Tensor) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        self.base.require_compute_supported()?;
        self.ensure_scratch(input.shape())?;
        let output = self.base.get_scratch("output")?.clone();
        self.base
            .backend
            .pad_into(&output, &input, &self.padding, self.value)?;
        self.base.last_input = Some(input);
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> LayerResult<Tensor> {
        let input = self.base.require_forwarded()?.clone();
        self.ensure_scratch(input.shape())?;
        let grad_input = self.base.get_scratch("grad_input")?.clone();
        self.base
            .backend
            .pad_backward_into(&grad_input, grad_output, &self.padding)?;
        Ok(grad_input)
    }
}

/// Concatenates multiple inputs along `dim` (spec.md §4.3). This is an N-ary
/// operation exposed through [`Concatenate::forward_many`]/
/// [`Concatenate::backward_many`]; the single-tensor `Layer::forward`/
/// `backward` methods always reject, since a one-argument `forward` cannot
/// produce the shape `output_shape` promises (the sum of every input's
/// extent along `dim`).
pub struct Concatenate {
    base: LayerBase,
    dim: usize,
    other_shapes: Vec<Shape>,
}

impl Concatenate {
    pub fn new(dim: usize, other_shapes: Vec<Shape>) -> Self {
        Self::with_options(dim, other_shapes, LayerOptions::new())
    }

    pub fn with_options(dim: usize, other_shapes: Vec<Shape>, options: LayerOptions) -> Self {
        Concatenate {
            base: LayerBase::new("concatenate", false, options),
            dim,
            other_shapes,
        }
    }

    pub fn forward_many(&mut self, inputs: Vec<Tensor>) -> LayerResult<Tensor> {
        self.base.require_initialized()?;
        self.base.require_compute_supported()?;
        if inputs.is_empty() {
            return Err(LayerError::InvalidArgument("concatenate: no inputs".into()));
        }
        let refs: Vec<&Tensor> = inputs.iter().collect();
        let mut out_dims = inputs[0].shape().dims().to_vec();
        out_dims[self.dim] = inputs.iter().map(|t| t.shape().dims()[self.dim]).sum();
        let output = Tensor::zeros(&Shape::new(out_dims));
        self.base.backend.concat_into(&output, &refs, self.dim)?;
        self.base.last_input = Some(inputs[0].clone());
        self.base.set_scratch("sizes", {
            let sizes: Vec<f32> = inputs.iter().map(|t| t.shape().dims()[self.dim] as f32).collect();
            Tensor::from_vec(sizes, Shape::new(vec![inputs.len()]))
                .expect("concat sizes: len matches shape by construction")
        });
        Ok(output)
    }

    /// Splits `grad_output` back into one gradient tensor per original input,
    /// in the same order passed to [`Concatenate::forward_many`].
    pub fn backward_many(&mut self, grad_output: &Tensor) -> LayerResult<Vec<Tensor>> {
        let sizes = self.base.get_scratch("sizes")?.clone();
        let dims = grad_output.shape().dims().to_vec();
        let mut grads = Vec::new();
        let mut offset = 0usize;
        for size in sizes.to_vec() {
            let size = size as usize;
            let mut piece_dims = dims.clone();
            piece_dims[self.dim] = size;
            let grad_piece = Tensor::zeros(&Shape::new(piece_dims));
            copy_along_dim(&grad_piece, grad_output, self.dim, offset);
            grads.push(grad_piece);
            offset += size;
        }
        Ok(grads)
    }
}

fn copy_along_dim(dst: &Tensor, src: &Tensor, dim: usize, src_offset: usize) {
    let dst_dims = dst.shape().dims().to_vec();
    let src_dims = src.shape().dims().to_vec();
    let dst_strides = Shape::new(dst_dims.clone()).strides();
    let src_strides = Shape::new(src_dims).strides();
    let src_d = src.data();
    let mut dst_d = dst.data_mut();
    for linear in 0..dst.numel() {
        let mut coords = vec![0usize; dst_dims.len()];
        let mut rem = linear;
        for (i, &s) in dst_strides.iter().enumerate() {
            coords[i] = rem / s.max(1);
            rem %= s.max(1);
        }
        coords[dim] += src_offset;
        let src_linear: usize = coords.iter().zip(src_strides.iter()).map(|(c, s)| c * s).sum();
        dst_d[linear] = src_d[src_linear];
    }
}

impl Layer for Concatenate {
    fn init(&mut self, input_shape: &Shape) -> LayerResult<()> {
        for other in &self.other_shapes {
            if other.rank() != input_shape.rank() {
                return Err(LayerError::ShapeMismatch(
                    "concatenate: all inputs must share rank".into(),
                ));
            }
        }
        self.base.mark_initialized();
        Ok(())
    }

    fn output_shape(&self, input_shape: &Shape) -> LayerResult<Shape> {
        let mut dims = input_shape.dims().to_vec();
        let extra: usize = self.other_shapes.iter().map(|s| s.dims()[self.dim]).sum();
        dims[self.dim] += extra;
        Ok(Shape::new(dims))
    }

    /// `Concatenate` is N-ary; the single-tensor `Layer::forward`/`backward`
    /// contract cannot express it (`output_shape` reflects every input's
    /// contribution along `dim`, which a one-argument `forward` has no way
    /// to produce). Always rejects rather than silently returning something
    /// that disagrees with `output_shape` — use [`Concatenate::forward_many`]
    /// instead.
    fn forward(&mut self, _input: Tensor) -> LayerResult<Tensor> {
        Err(LayerError::IncompatibleInput(
            "concatenate: single-tensor forward() is not supported; call forward_many()".into(),
        ))
    }

    fn backward(&mut self, _grad_output: &Tensor) -> LayerResult<Tensor> {
        Err(LayerError::IncompatibleInput(
            "concatenate: single-tensor backward() is not supported; call backward_many()".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_collapses_trailing_dims() {
        // half-open [1, 3): collapses dims 1 and 2, matching spec.md's
        // `[start_dim, end_dim)` convention.
        let mut f = Flatten::new(1, 3).unwrap();
        let shape = Shape::new(vec![2, 3, 4]);
        f.init(&shape).unwrap();
        assert_eq!(f.output_shape(&shape).unwrap().dims(), &[2, 12]);
    }

    #[test]
    fn flatten_half_open_excludes_end_dim() {
        // [1, 2) collapses only dim 1 in isolation, leaving dim 2 untouched.
        let mut f = Flatten::new(1, 2).unwrap();
        let shape = Shape::new(vec![2, 3, 4]);
        f.init(&shape).unwrap();
        assert_eq!(f.output_shape(&shape).unwrap().dims(), &[2, 3, 4]);
    }

    #[test]
    fn reshape_round_trips_via_backward() {
        let target = Shape::new(vec![4]);
        let mut r = Reshape::new(target.clone());
        let input_shape = Shape::new(vec![2, 2]);
        r.init(&input_shape).unwrap();
        let input = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], input_shape).unwrap();
        let out = r.forward(input).unwrap();
        assert_eq!(out.shape().dims(), target.dims());
        let grad_in = r.backward(&Tensor::ones(&target)).unwrap();
        assert_eq!(grad_in.shape().dims(), &[2, 2]);
    }

    #[test]
    fn pad_forward_and_backward() {
        let mut p = Pad::new(vec![(1, 1)], 0.0);
        let shape = Shape::new(vec![2]);
        p.init(&shape).unwrap();
        let input = Tensor::from_vec(vec![5.0, 6.0], shape).unwrap();
        let out = p.forward(input).unwrap();
        assert_eq!(out.to_vec(), vec![0.0, 5.0, 6.0, 0.0]);
        let grad_out = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![4])).unwrap();
        let grad_in = p.backward(&grad_out).unwrap();
        assert_eq!(grad_in.to_vec(), vec![2.0, 3.0]);
    }

    #[test]
    fn concatenate_forward_many_matches_output_shape() {
        let mut c = Concatenate::new(0, vec![Shape::new(vec![1, 2])]);
        let input_shape = Shape::new(vec![2, 2]);
        c.init(&input_shape).unwrap();
        let expected = c.output_shape(&input_shape).unwrap();

        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2])).unwrap();
        let b = Tensor::from_vec(vec![5.0, 6.0], Shape::new(vec![1, 2])).unwrap();
        let out = c.forward_many(vec![a, b]).unwrap();
        assert_eq!(out.shape().dims(), expected.dims());
        assert_eq!(out.to_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn concatenate_backward_many_splits_by_original_sizes() {
        let mut c = Concatenate::new(0, vec![Shape::new(vec![1, 2])]);
        c.init(&Shape::new(vec![2, 2])).unwrap();
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2])).unwrap();
        let b = Tensor::from_vec(vec![5.0, 6.0], Shape::new(vec![1, 2])).unwrap();
        c.forward_many(vec![a, b]).unwrap();

        let grad_out = Tensor::from_vec(
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            Shape::new(vec![3, 2]),
        )
        .unwrap();
        let grads = c.backward_many(&grad_out).unwrap();
        assert_eq!(grads.len(), 2);
        assert_eq!(grads[0].shape().dims(), &[2, 2]);
        assert_eq!(grads[0].to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(grads[1].shape().dims(), &[1, 2]);
        assert_eq!(grads[1].to_vec(), vec![5.0, 6.0]);
    }

    #[test]
    fn concatenate_single_tensor_forward_rejects() {
        let mut c = Concatenate::new(0, vec![Shape::new(vec![1, 2])]);
        c.init(&Shape::new(vec![2, 2])).unwrap();
        let input = Tensor::zeros(&Shape::new(vec![2, 2]));
        assert!(c.forward(input).is_err());
    }
}
