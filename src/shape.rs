//! Shape and DataType: static descriptors carried by every tensor and parameter.

use std::fmt;
use thiserror::Error;

/// Error when a shape is invalid for the operation being attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("shape error: {0}")]
pub struct ShapeError(pub String);

/// Shape of a tensor: ordered list of positive dimension sizes.
///
/// An empty shape (`rank() == 0`) is the sentinel for an uninitialized
/// tensor; it is a valid value but carries no elements.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Create a shape from dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape { dims }
    }

    /// The empty shape, denoting an uninitialized tensor.
    pub fn nil() -> Self {
        Shape { dims: Vec::new() }
    }

    /// True iff this shape denotes an uninitialized (nil) tensor.
    pub fn is_nil(&self) -> bool {
        self.dims.is_empty()
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Total number of elements. 0 for the nil shape.
    pub fn numel(&self) -> usize {
        if self.dims.is_empty() {
            0
        } else {
            self.dims.iter().product()
        }
    }

    /// Row-major strides for this shape, in elements.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.dims.len()];
        for i in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Structural equality with another shape.
    pub fn same_as(&self, other: &Shape) -> bool {
        self.dims == other.dims
    }

    /// True if this shape has exactly one element.
    pub fn is_scalar(&self) -> bool {
        self.numel() == 1
    }

    /// Validate that every dimension is strictly positive.
    pub fn validate_positive(&self) -> Result<(), ShapeError> {
        if self.dims.iter().any(|&d| d == 0) {
            return Err(ShapeError(format!(
                "shape {:?} has a non-positive dimension",
                self.dims
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape{:?}", self.dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

/// Closed enumeration of element types.
///
/// Every layer in this crate supports `F32`; the remaining variants are
/// carried through construction and bookkeeping but compute kernels
/// restrict to `F32` (see [`crate::error::LayerError::RuntimeFailure`] for
/// the rejection path when a kernel is invoked on an unsupported variant).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    F16,
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl DataType {
    /// True for the only variant compute kernels in this crate implement.
    pub fn is_compute_supported(self) -> bool {
        matches!(self, DataType::F32)
    }
}

impl Default for DataType {
    fn default() -> Self {
        DataType::F32
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::F16 => "f16",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I8 => "i8",
            DataType::I16 => "i16",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U16 => "u16",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_numel_and_rank() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.numel(), 24);
        assert_eq!(s.rank(), 3);
    }

    #[test]
    fn nil_shape_is_empty() {
        let s = Shape::nil();
        assert!(s.is_nil());
        assert_eq!(s.numel(), 0);
    }

    #[test]
    fn strides_row_major() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.strides(), vec![12, 4, 1]);
    }

    #[test]
    fn rejects_zero_dim() {
        let s = Shape::new(vec![2, 0, 4]);
        assert!(s.validate_positive().is_err());
    }

    #[test]
    fn default_data_type_is_f32() {
        assert_eq!(DataType::default(), DataType::F32);
        assert!(DataType::F32.is_compute_supported());
        assert!(!DataType::I32.is_compute_supported());
    }
}
