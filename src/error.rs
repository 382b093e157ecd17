//! Error categories for the layer engine. Domain errors always return
//! `Result`; layers do not panic on them. Internal invariant violations
//! (a scratch tensor whose shape drifted from what `init` allocated) remain
//! `debug_assert!`/`unreachable!` panics, not part of this enum.

use crate::backend::BackendError;
use crate::shape::ShapeError;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum LayerError {
    /// Constructor received a non-positive dimension, an invalid dim range,
    /// malformed padding, or a dropout rate outside `[0, 1)`.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Input to `forward`, gradient to `backward`, or an injected parameter
    /// does not match the layer's expected shape.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// `forward`/`backward` called before `init`, or before a required
    /// parameter was set.
    #[error("not initialized: {0}")]
    NotInitialized(String),

    /// `backward` called without a preceding `forward`.
    #[error("not forwarded: {0}")]
    NotForwarded(String),

    /// E.g. Dense receiving a >2D tensor, Conv2D receiving a non-4D tensor.
    #[error("incompatible input: {0}")]
    IncompatibleInput(String),

    /// A required parameter (weights/biases/kernels) was never set.
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    /// Propagated from the tensor primitive surface, annotated with layer
    /// context.
    #[error("runtime failure: {0}")]
    RuntimeFailure(String),

    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),

    /// Propagated verbatim from the tensor primitive surface, as spec.md §7's
    /// `RuntimeFailure` category requires ("surfaced verbatim with layer-
    /// context annotation"). `BackendError` messages already name the op, so
    /// no further wrapping is added here.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type LayerResult<T> = Result<T, LayerError>;
