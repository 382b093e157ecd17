//! Concrete layers. Each module owns one `Layer` implementation (or, for
//! `activation`, a small family of stateless ones) following the same
//! Init/Forward/Backward shape as the teacher's `nn::linear`/`nn::activation`
//! but against the new non-graph contract in [`crate::layer`].

pub mod activation;
pub mod conv1d;
pub mod conv2d;
pub mod dense;
pub mod lstm;
pub mod pooling;
pub mod shape_ops;

pub use activation::{Dropout, ReLU, Sigmoid, Softmax, Tanh};
pub use conv1d::Conv1D;
pub use conv2d::Conv2D;
pub use dense::Dense;
pub use lstm::Lstm;
pub use pooling::{AvgPool2D, GlobalAvgPool2D, MaxPool2D};
pub use shape_ops::{Concatenate, Flatten, Pad, Reshape, Squeeze, Transpose2D, Unsqueeze};
