//! Construction-time configuration shared by every layer: a builder over the
//! knobs `LayerBase::new` accepts (name, learnability, data type, RNG
//! injection, parameter pre-seeding) so each concrete layer constructor
//! doesn't repeat the same handful of optional arguments (spec.md §3's
//! `LayerBase` fields, generalized into a builder the way the teacher's
//! `Linear::named` constructor hints at but never generalizes).

use crate::parameter::Parameter;
use crate::shape::DataType;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::fmt;

/// Identifies a parameter slot within a layer. `Custom` lets a layer (e.g.
/// LSTM, which has four gates' worth of weights) name slots beyond the
/// common three without growing this enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamIndex {
    Weights,
    Biases,
    Kernels,
    Custom(u32),
}

impl fmt::Display for ParamIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamIndex::Weights => write!(f, "weights"),
            ParamIndex::Biases => write!(f, "biases"),
            ParamIndex::Kernels => write!(f, "kernels"),
            ParamIndex::Custom(n) => write!(f, "custom({n})"),
        }
    }
}

/// Optional construction-time overrides for a layer.
///
/// Every field defaults to the layer's own choice when left unset: a name
/// derived from the layer's type, `can_learn` as the layer type dictates,
/// `F32` data, and an RNG seeded from [`crate::runtime::child_rng`].
#[derive(Default)]
pub struct LayerOptions {
    pub name: Option<String>,
    pub can_learn: Option<bool>,
    pub data_type: Option<DataType>,
    pub rng: Option<StdRng>,
    pub parameters: HashMap<ParamIndex, Parameter>,
    /// Dropout rate in `[0, 1)`; only consulted by `Dropout`. Takes priority
    /// over a rate passed directly to `Dropout::with_options` when set.
    pub dropout_rate: Option<f32>,
    /// Whether `Dropout` should draw masks (`true`) or act as the identity
    /// (`false`); only consulted by `Dropout`.
    pub training_mode: Option<bool>,
}

impl LayerOptions {
    pub fn new() -> Self {
        LayerOptions::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn can_learn(mut self, can_learn: bool) -> Self {
        self.can_learn = Some(can_learn);
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    pub fn rng(mut self, rng: StdRng) -> Self {
        self.rng = Some(rng);
        self
    }

    pub fn parameter(mut self, index: ParamIndex, param: Parameter) -> Self {
        self.parameters.insert(index, param);
        self
    }

    pub fn dropout_rate(mut self, rate: f32) -> Self {
        self.dropout_rate = Some(rate);
        self
    }

    pub fn training_mode(mut self, training: bool) -> Self {
        self.training_mode = Some(training);
        self
    }
}
