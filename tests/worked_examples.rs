//! Integration tests for the concrete scenarios in spec.md §8: fixed inputs
//! and parameters with hand-computed expected outputs, covering Dense,
//! MaxPool2D, AvgPool2D, Conv1D, and Softmax.

use layer_core::{
    Dense, Layer, LayerOptions, MaxPool2D, AvgPool2D, Conv1D, Parameter as LayerParameter,
    ParamIndex, Softmax, Shape, Tensor,
};

/// `Layer::parameters()` returns an unordered `Vec` (backed by a `HashMap`),
/// so tests that need a specific parameter's gradient select it by element
/// count rather than assuming a position.
fn grad_with_len(params: &[&layer_core::Parameter], len: usize) -> Vec<f32> {
    params
        .iter()
        .find(|p| p.data().numel() == len)
        .and_then(|p| p.grad())
        .expect("no parameter with the requested length has an accumulated gradient")
        .to_vec()
}

#[test]
fn dense_forward_identity_scenario() {
    let mut options = LayerOptions::new();
    let w = Tensor::from_vec(vec![1.0, 1.0], Shape::new(vec![2, 1])).unwrap();
    options = options.parameter(ParamIndex::Weights, LayerParameter::new(w));
    let b = Tensor::from_vec(vec![0.0], Shape::new(vec![1])).unwrap();
    options = options.parameter(ParamIndex::Biases, LayerParameter::new(b));
    let mut dense = Dense::with_options(2, 1, true, options).unwrap();
    dense.init(&Shape::new(vec![2])).unwrap();

    let input = Tensor::from_vec(vec![1.0, 2.0], Shape::new(vec![2])).unwrap();
    let out = dense.forward(input).unwrap();
    assert_eq!(out.to_vec(), vec![3.0]);

    let grad_out = Tensor::from_vec(vec![1.0], Shape::new(vec![1])).unwrap();
    let grad_in = dense.backward(&grad_out).unwrap();
    assert_eq!(grad_in.to_vec(), vec![1.0, 1.0]);

    assert_eq!(grad_with_len(&dense.parameters(), 2), vec![1.0, 2.0]);
}

#[test]
fn zero_grad_then_accumulate_across_two_steps() {
    let mut dense = Dense::new(2, 1).unwrap();
    dense.init(&Shape::new(vec![2])).unwrap();

    let input = Tensor::from_vec(vec![1.0, 1.0], Shape::new(vec![2])).unwrap();
    let grad_out = Tensor::from_vec(vec![1.0], Shape::new(vec![1])).unwrap();

    dense.forward(input.clone()).unwrap();
    dense.backward(&grad_out).unwrap();
    let after_first = grad_with_len(&dense.parameters(), 2);

    dense.forward(input).unwrap();
    dense.backward(&grad_out).unwrap();
    let after_second = grad_with_len(&dense.parameters(), 2);
    for (a, b) in after_first.iter().zip(after_second.iter()) {
        assert!((b - 2.0 * a).abs() < 1e-6, "expected doubled gradient, got {a} then {b}");
    }

    dense.zero_grad();
    let after_zero = grad_with_len(&dense.parameters(), 2);
    assert!(after_zero.iter().all(|v| *v == 0.0));
}

fn grid_4x4() -> Tensor {
    #[rustfmt::skip]
    let data = vec![
        1.0, 2.0, 3.0, 4.0,
        5.0, 6.0, 7.0, 8.0,
        9.0, 10.0, 11.0, 12.0,
        13.0, 14.0, 15.0, 16.0,
    ];
    Tensor::from_vec(data, Shape::new(vec![1, 1, 4, 4])).unwrap()
}

#[test]
fn maxpool2d_scenario() {
    let mut pool = MaxPool2D::new((2, 2), (2, 2), (0, 0)).unwrap();
    pool.init(&Shape::new(vec![1, 1, 4, 4])).unwrap();
    let out = pool.forward(grid_4x4()).unwrap();
    assert_eq!(out.to_vec(), vec![6.0, 8.0, 14.0, 16.0]);

    let grad_out = Tensor::ones(&Shape::new(vec![1, 1, 2, 2]));
    let grad_in = pool.backward(&grad_out).unwrap();
    let ones_at = [5usize, 7, 13, 15];
    for (i, v) in grad_in.to_vec().iter().enumerate() {
        if ones_at.contains(&i) {
            assert_eq!(*v, 1.0);
        } else {
            assert_eq!(*v, 0.0);
        }
    }
}

#[test]
fn avgpool2d_scenario() {
    let mut pool = AvgPool2D::new((2, 2), (2, 2), (0, 0)).unwrap();
    pool.init(&Shape::new(vec![1, 1, 4, 4])).unwrap();
    let out = pool.forward(grid_4x4()).unwrap();
    assert_eq!(out.to_vec(), vec![3.5, 5.5, 11.5, 13.5]);

    let grad_out = Tensor::from_vec(vec![4.0, 4.0, 4.0, 4.0], Shape::new(vec![1, 1, 2, 2])).unwrap();
    let grad_in = pool.backward(&grad_out).unwrap();
    assert_eq!(grad_in.to_vec(), vec![1.0; 16]);
}

#[test]
fn conv1d_scenario() {
    let mut options = LayerOptions::new();
    let k = Tensor::from_vec(vec![1.0, 1.0], Shape::new(vec![1, 1, 2])).unwrap();
    options = options.parameter(ParamIndex::Kernels, LayerParameter::new(k));
    let mut conv = Conv1D::with_options(1, 1, 2, 1, 0, true, options).unwrap();
    conv.init(&Shape::new(vec![1, 1, 4])).unwrap();

    let input = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![1, 1, 4])).unwrap();
    let out = conv.forward(input).unwrap();
    assert_eq!(out.to_vec(), vec![3.0, 5.0, 7.0]);

    let grad_out = Tensor::ones(&Shape::new(vec![1, 1, 3]));
    let grad_in = conv.backward(&grad_out).unwrap();
    assert_eq!(grad_in.to_vec(), vec![1.0, 2.0, 2.0, 1.0]);
}

#[test]
fn softmax_scenario_uniform_on_zero_input() {
    let mut softmax = Softmax::new(-1);
    let shape = Shape::new(vec![3]);
    softmax.init(&shape).unwrap();
    let input = Tensor::from_vec(vec![0.0, 0.0, 0.0], shape).unwrap();
    let out = softmax.forward(input).unwrap();
    for v in out.to_vec() {
        assert!((v - 1.0 / 3.0).abs() < 1e-6);
    }
}

#[test]
fn softmax_scenario_dominant_element_is_near_one_hot() {
    let mut softmax = Softmax::new(-1);
    let shape = Shape::new(vec![3]);
    softmax.init(&shape).unwrap();
    let input = Tensor::from_vec(vec![0.0, 50.0, 0.0], shape).unwrap();
    let out = softmax.forward(input).unwrap();
    let v = out.to_vec();
    assert!((v[1] - 1.0).abs() < 1e-6);
    assert!(v[0] < 1e-6 && v[2] < 1e-6);
}

#[test]
fn softmax_backward_grad_sums_to_zero() {
    let mut softmax = Softmax::new(-1);
    let shape = Shape::new(vec![4]);
    softmax.init(&shape).unwrap();
    let input = Tensor::from_vec(vec![0.1, -0.2, 0.3, 0.4], shape).unwrap();
    softmax.forward(input).unwrap();
    let grad_out = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![4])).unwrap();
    let grad_in = softmax.backward(&grad_out).unwrap();
    let sum: f32 = grad_in.to_vec().iter().sum();
    assert!(sum.abs() < 1e-4, "sum={sum}");
}
