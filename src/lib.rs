//! layer_core: trainable neural-network layers over a pre-allocated tensor
//! primitive contract.
//!
//! Layers: shape/dtype (`shape`) -> tensor primitive (`tensor`, `backend`)
//! -> parameter lifecycle (`parameter`) -> layer contract (`layer`) ->
//! concrete layers (`layers`).
//!
//! Determinism: use [`runtime::set_seed`] before constructing layers for
//! reproducible weight initialization and dropout masks.

pub mod backend;
pub mod error;
pub mod init;
pub mod layer;
pub mod layers;
pub mod options;
pub mod parameter;
pub mod runtime;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendError, BackendResult, CpuBackend};
pub use error::{LayerError, LayerResult};
pub use init::{he_uniform, lstm_uniform, xavier_uniform};
pub use layer::{Layer, LayerBase};
pub use layers::{
    AvgPool2D, Concatenate, Conv1D, Conv2D, Dense, Dropout, Flatten, GlobalAvgPool2D, Lstm,
    MaxPool2D, Pad, ReLU, Reshape, Sigmoid, Softmax, Squeeze, Tanh, Transpose2D, Unsqueeze,
};
pub use options::{LayerOptions, ParamIndex};
pub use parameter::Parameter;
pub use runtime::{child_rng, set_seed, with_rng};
pub use shape::{DataType, Shape, ShapeError};
pub use tensor::Tensor;
