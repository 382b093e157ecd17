//! Tensor: owned or view handle over contiguous `f32` storage, shape, and
//! data type. No gradient and no graph (those live in `parameter` and the
//! layer contract); this module is the conforming implementation of the
//! tensor primitive surface that the layer engine consumes (spec.md §6.1).

use crate::shape::{DataType, Shape, ShapeError};
use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

/// A tensor handle: shape, data type, and a shared, contiguous `f32` buffer.
///
/// Cloning a `Tensor` clones the handle, not the storage — use
/// [`Tensor::deep_clone`] to copy the underlying buffer. Two tensors created
/// as views of one another (via [`Tensor::view_reshape`]) share storage;
/// writes through [`Tensor::data_mut`] on either are visible through both,
/// matching the view semantics of spec.md §3.
#[derive(Clone)]
pub struct Tensor {
    storage: Rc<RefCell<Vec<f32>>>,
    offset: usize,
    shape: Shape,
    dtype: DataType,
}

impl Tensor {
    /// Allocate a new tensor from owned data. `data.len()` must equal
    /// `shape.numel()`.
    pub fn from_vec(data: Vec<f32>, shape: Shape) -> Result<Self, ShapeError> {
        Self::from_vec_typed(data, shape, DataType::F32)
    }

    pub fn from_vec_typed(data: Vec<f32>, shape: Shape, dtype: DataType) -> Result<Self, ShapeError> {
        if data.len() != shape.numel() {
            return Err(ShapeError(format!(
                "data len {} != shape numel {}",
                data.len(),
                shape.numel()
            )));
        }
        Ok(Tensor {
            storage: Rc::new(RefCell::new(data)),
            offset: 0,
            shape,
            dtype,
        })
    }

    /// The nil sentinel: empty shape, no storage allocated.
    pub fn nil() -> Self {
        Tensor {
            storage: Rc::new(RefCell::new(Vec::new())),
            offset: 0,
            shape: Shape::nil(),
            dtype: DataType::F32,
        }
    }

    /// True iff this tensor's shape is nil.
    pub fn is_nil(&self) -> bool {
        self.shape.is_nil()
    }

    pub fn zeros(shape: &Shape) -> Self {
        Tensor {
            storage: Rc::new(RefCell::new(vec![0.0; shape.numel()])),
            offset: 0,
            shape: shape.clone(),
            dtype: DataType::F32,
        }
    }

    pub fn ones(shape: &Shape) -> Self {
        Tensor {
            storage: Rc::new(RefCell::new(vec![1.0; shape.numel()])),
            offset: 0,
            shape: shape.clone(),
            dtype: DataType::F32,
        }
    }

    pub fn zeros_like(other: &Tensor) -> Self {
        Self::zeros(&other.shape)
    }

    pub fn ones_like(other: &Tensor) -> Self {
        Self::ones(&other.shape)
    }

    /// Fill every element with a constant.
    pub fn fill(&self, value: f32) {
        self.data_mut().iter_mut().for_each(|x| *x = value);
    }

    /// Fill every element by calling `f(linear_index)`.
    pub fn fill_with<F: FnMut(usize) -> f32>(&self, mut f: F) {
        for (i, x) in self.data_mut().iter_mut().enumerate() {
            *x = f(i);
        }
    }

    /// Copy `src`'s elements into `self`. Shapes must match in element count.
    pub fn copy_from(&self, src: &Tensor) -> Result<(), ShapeError> {
        if self.numel() != src.numel() {
            return Err(ShapeError(format!(
                "copy_from: numel mismatch {} != {}",
                self.numel(),
                src.numel()
            )));
        }
        self.data_mut().copy_from_slice(&src.data());
        Ok(())
    }

    /// Accumulate `delta` into `self` in place: `self += delta`. Used by
    /// gradient accumulation, where `self` is a parameter's persistent grad
    /// buffer and `delta` is a freshly computed contribution — deliberately
    /// a `Tensor` method rather than a `Backend` op, since `delta` must never
    /// alias `self`'s storage (a `Backend::add_into(self, self, delta)` call
    /// would borrow the same `RefCell` both mutably and immutably at once).
    pub fn accumulate_add(&self, delta: &Tensor) -> Result<(), ShapeError> {
        if self.numel() != delta.numel() {
            return Err(ShapeError(format!(
                "accumulate_add: numel mismatch {} != {}",
                self.numel(),
                delta.numel()
            )));
        }
        for (d, x) in self.data_mut().iter_mut().zip(delta.data().iter()) {
            *d += x;
        }
        Ok(())
    }

    /// Deep copy: new, independent storage with identical contents.
    pub fn deep_clone(&self) -> Self {
        Tensor::from_vec_typed(self.to_vec(), self.shape.clone(), self.dtype)
            .expect("deep_clone: shape/len invariant")
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Stable identity of the underlying storage, used to detect aliasing
    /// between views.
    pub fn storage_id(&self) -> usize {
        Rc::as_ptr(&self.storage) as usize
    }

    /// Read-only borrow of this tensor's elements (respecting offset).
    pub fn data(&self) -> Ref<'_, [f32]> {
        let (start, len) = (self.offset, self.shape.numel());
        Ref::map(self.storage.borrow(), |v| &v[start..start + len])
    }

    /// Mutable borrow of this tensor's elements. Interior mutability: does
    /// not require `&mut self`, so scratch/parameter tensors can be written
    /// through a shared handle (spec.md's destination-parameter convention).
    pub fn data_mut(&self) -> RefMut<'_, [f32]> {
        let (start, len) = (self.offset, self.shape.numel());
        RefMut::map(self.storage.borrow_mut(), |v| &mut v[start..start + len])
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data().to_vec()
    }

    /// Reshape to `target`, preserving element count. Zero-copy: the result
    /// shares storage with `self`.
    pub fn view_reshape(&self, target: Shape) -> Result<Tensor, ShapeError> {
        if target.numel() != self.numel() {
            return Err(ShapeError(format!(
                "reshape: numel mismatch {} != {}",
                self.numel(),
                target.numel()
            )));
        }
        Ok(Tensor {
            storage: Rc::clone(&self.storage),
            offset: self.offset,
            shape: target,
            dtype: self.dtype,
        })
    }

    /// Reshape into a new owned tensor (always copies).
    pub fn reshape_copy(&self, target: Shape) -> Result<Tensor, ShapeError> {
        if target.numel() != self.numel() {
            return Err(ShapeError(format!(
                "reshape: numel mismatch {} != {}",
                self.numel(),
                target.numel()
            )));
        }
        Tensor::from_vec_typed(self.to_vec(), target, self.dtype)
    }

    /// A zero-copy view of a contiguous span along the outermost axis:
    /// `self[start..start+len, ...]`. `self` must be rank >= 1.
    pub fn slice_outer(&self, start: usize, len: usize) -> Result<Tensor, ShapeError> {
        let dims = self.shape.dims();
        if dims.is_empty() {
            return Err(ShapeError("slice_outer: rank 0 tensor".into()));
        }
        if start + len > dims[0] {
            return Err(ShapeError(format!(
                "slice_outer: range {}..{} out of bounds for dim0={}",
                start,
                start + len,
                dims[0]
            )));
        }
        let inner: usize = dims[1..].iter().product::<usize>().max(1);
        let mut new_dims = dims.to_vec();
        new_dims[0] = len;
        Ok(Tensor {
            storage: Rc::clone(&self.storage),
            offset: self.offset + start * inner,
            shape: Shape::new(new_dims),
            dtype: self.dtype,
        })
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("offset", &self.offset)
            .finish()
    }
}
