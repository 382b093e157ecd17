//! Weight initialization: Xavier, He, and the uniform scheme LSTM gates use.
//! Pure functions over an explicit `StdRng`; deterministic for a fixed seed
//! and independent of any global state, so a layer's own `StdRng` (see
//! [`crate::layer::LayerBase`]) drives its own parameter init.

use crate::shape::Shape;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Xavier (Glorot) uniform: `scale = sqrt(6 / (fan_in + fan_out))`.
/// For a 2D weight `[fan_in, fan_out]`, fills with `Uniform(-scale, scale)`.
/// Falls back to fan_in-only scaling for non-matrix shapes (e.g. conv
/// kernels), using `dims[0]` and the product of the remaining dims as an
/// effective fan_out.
pub fn xavier_uniform(shape: &Shape, rng: &mut StdRng) -> Tensor {
    let dims = shape.dims();
    let (fan_in, fan_out) = fan_in_out(dims);
    let scale = (6.0f32 / (fan_in + fan_out) as f32).sqrt();
    uniform(shape, scale, rng)
}

/// He (Kaiming) uniform: `scale = sqrt(6 / fan_in)`. Suited to ReLU-gated
/// layers.
pub fn he_uniform(shape: &Shape, rng: &mut StdRng) -> Tensor {
    let dims = shape.dims();
    let (fan_in, _) = fan_in_out(dims);
    let scale = (6.0f32 / fan_in.max(1) as f32).sqrt();
    uniform(shape, scale, rng)
}

/// Uniform initializer for LSTM gate weights: `scale = 1/sqrt(hidden_size)`,
/// the scheme the original LSTM paper and most reference implementations use
/// since Xavier/He's fan-in/fan-out framing doesn't fit a recurrent gate
/// matrix cleanly.
pub fn lstm_uniform(shape: &Shape, hidden_size: usize, rng: &mut StdRng) -> Tensor {
    let scale = 1.0 / (hidden_size.max(1) as f32).sqrt();
    uniform(shape, scale, rng)
}

fn fan_in_out(dims: &[usize]) -> (usize, usize) {
    match dims.len() {
        0 => (1, 1),
        1 => (dims[0], dims[0]),
        _ => (dims[0], dims[1..].iter().product()),
    }
}

fn uniform(shape: &Shape, scale: f32, rng: &mut StdRng) -> Tensor {
    let n = shape.numel();
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-scale..=scale)).collect();
    Tensor::from_vec(data, shape.clone()).expect("uniform: len matches shape.numel() by construction")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn xavier_uniform_is_in_range() {
        let mut rng = StdRng::seed_from_u64(1);
        let shape = Shape::new(vec![4, 8]);
        let t = xavier_uniform(&shape, &mut rng);
        let scale = (6.0f32 / 12.0).sqrt();
        for v in t.to_vec() {
            assert!(v.abs() <= scale + 1e-6);
        }
    }

    #[test]
    fn deterministic_for_fixed_seed() {
        let shape = Shape::new(vec![3, 3]);
        let mut rng_a = StdRng::seed_from_u64(42);
        let mut rng_b = StdRng::seed_from_u64(42);
        let a = he_uniform(&shape, &mut rng_a);
        let b = he_uniform(&shape, &mut rng_b);
        assert_eq!(a.to_vec(), b.to_vec());
    }
}
