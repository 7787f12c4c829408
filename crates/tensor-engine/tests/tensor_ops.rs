// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Integration tests: the tensor engine exercised the way a layer stack
//! uses it — contraction plus broadcast bias, activation forward/backward,
//! deferred chains, raw file round trips.

use tensor_engine::ops::{self, Activation};
use tensor_engine::{Axis, Shape, Tensor, TensorError};

fn approx_eq(a: &[f32], b: &[f32], tol: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < tol)
}

#[test]
fn fully_connected_forward_shape_flow() {
    // x: (batch=4, 1, 1, in=3), w: (1, 1, in=3, out=2), bias: (1, 1, 1, 2).
    let mut x = Tensor::new(Shape::new(4, 1, 1, 3));
    x.set_random_uniform(-1.0, 1.0).unwrap();
    let mut w = Tensor::new(Shape::new(1, 1, 3, 2));
    w.set_random_normal(0.0, 0.05).unwrap();
    let bias = Tensor::from_slice(&[0.5, -0.5], Shape::new(1, 1, 1, 2)).unwrap();

    // The shared weight matrix is reused for every sample (m.batch == 1),
    // then the bias row broadcasts across the batch axis.
    let hidden = x.dot(&w, false, false).unwrap();
    assert_eq!(hidden.shape(), Shape::new(4, 1, 1, 2));

    let pre = hidden.add(&bias).unwrap();
    let mut activated = Tensor::default();
    Activation::Sigmoid.forward(&pre, &mut activated).unwrap();

    // Sigmoid output lies in (0, 1).
    assert!(activated.to_vec().iter().all(|&v| v > 0.0 && v < 1.0));
}

#[test]
fn gradient_accumulation_via_dot_beta() {
    // Two micro-batches accumulated into one weight gradient must equal
    // one pass over the concatenated batch.
    let x = Tensor::from_slice(
        &(0..12).map(|i| i as f32 * 0.25).collect::<Vec<_>>(),
        Shape::new(4, 1, 1, 3),
    )
    .unwrap();
    let grad_out = Tensor::from_slice(
        &(0..8).map(|i| 1.0 - i as f32 * 0.125).collect::<Vec<_>>(),
        Shape::new(4, 1, 1, 2),
    )
    .unwrap();

    // Whole-batch reference: dw = sum_k x_k^T . g_k.
    let mut reference = Tensor::default();
    x.dot_into(&grad_out, &mut reference, true, false, 0.0)
        .unwrap();
    let reference = reference.sum(Axis::Batch, 1.0).unwrap();

    // Accumulated: run each half, beta = 1.0 keeps the prior content.
    let mut acc = Tensor::new(Shape::new(2, 1, 3, 2));
    for half in 0..2 {
        let xs = x.batch_slice(half * 2, 2).unwrap();
        let gs = grad_out.batch_slice(half * 2, 2).unwrap();
        xs.dot_into(&gs, &mut acc, true, false, 1.0).unwrap();
    }
    let acc = acc.sum(Axis::Batch, 1.0).unwrap();

    assert!(approx_eq(&acc.to_vec(), &reference.to_vec(), 1e-4));
}

#[test]
fn broadcast_equals_per_batch_loop() {
    let lhs = Tensor::from_slice(
        &(0..24).map(|i| (i as f32 * 0.37).sin()).collect::<Vec<_>>(),
        Shape::new(4, 2, 1, 3),
    )
    .unwrap();
    let rhs = Tensor::from_slice(
        &(0..6).map(|i| (i as f32 * 0.91).cos()).collect::<Vec<_>>(),
        Shape::new(1, 2, 1, 3),
    )
    .unwrap();

    let broadcast = lhs.add(&rhs).unwrap();

    let mut expect = Vec::new();
    for k in 0..4 {
        let row = lhs.batch_slice(k, 1).unwrap().clone().add(&rhs).unwrap();
        expect.extend(row.to_vec());
    }
    // Bit-identical to the naive per-batch loop.
    assert_eq!(broadcast.to_vec(), expect);
}

#[test]
fn activation_backward_through_multiply_and_sum() {
    // The activation layer consumes apply / multiply / sum_by_batch /
    // clone / shared data exactly as the public contract promises.
    let x = Tensor::from_slice(
        &[0.5, -1.0, 2.0, 0.0, 1.0, -2.0],
        Shape::new(2, 1, 1, 3),
    )
    .unwrap();

    let mut fwd = Tensor::default();
    Activation::Tanh.forward(&x, &mut fwd).unwrap();

    let upstream = Tensor::from_slice(&[1.0; 6], Shape::new(2, 1, 1, 3)).unwrap();
    let mut grad = Tensor::default();
    Activation::Tanh.derive(&fwd, &mut grad, &upstream).unwrap();

    let expect: Vec<f32> = fwd.to_vec().iter().map(|&y| 1.0 - y * y).collect();
    assert!(approx_eq(&grad.to_vec(), &expect, 1e-6));

    // Per-sample gradient magnitude through sum_by_batch.
    let norms = grad.pow(2.0).unwrap().sum_by_batch().unwrap();
    assert_eq!(norms.shape(), Shape::new(2, 1, 1, 1));
}

#[test]
fn softmax_cross_check_with_manual_rows() {
    let t = Tensor::from_slice(
        &[1.0, 2.0, 3.0, -1.0, 0.0, 1.0],
        Shape::new(2, 1, 1, 3),
    )
    .unwrap();
    let mut out = Tensor::default();
    ops::softmax(&t, &mut out).unwrap();

    let v = t.to_vec();
    let mut expect = Vec::new();
    for row in v.chunks(3) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = row.iter().map(|x| (x - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        expect.extend(exps.iter().map(|e| e / sum));
    }
    assert!(approx_eq(&out.to_vec(), &expect, 1e-6));
}

#[test]
fn save_read_roundtrip_through_file() {
    let path = std::env::temp_dir().join("tensor_engine_roundtrip.bin");

    let mut t = Tensor::new(Shape::new(2, 3, 4, 5));
    t.set_random_normal(0.0, 1.0).unwrap();

    {
        let mut file = std::fs::File::create(&path).unwrap();
        t.save(&mut file).unwrap();
    }

    // The format carries no header: the reader supplies the shape.
    let mut back = Tensor::new(Shape::new(2, 3, 4, 5));
    {
        let mut file = std::fs::File::open(&path).unwrap();
        back.read(&mut file).unwrap();
    }
    std::fs::remove_file(&path).ok();

    // Raw little-endian dump reproduces values bit-for-bit.
    assert_eq!(t.to_vec(), back.to_vec());
}

#[test]
fn read_underrun_is_io_error() {
    let mut t = Tensor::new(Shape::vector(4));
    let short = [0u8; 7];
    assert!(matches!(
        t.read(&mut short.as_slice()),
        Err(TensorError::Io(_))
    ));
}

#[test]
fn chained_pipeline_matches_hand_threaded() {
    let t = Tensor::from_slice(
        &(1..=8).map(|i| i as f32).collect::<Vec<_>>(),
        Shape::new(2, 1, 2, 2),
    )
    .unwrap();

    let chained = t
        .chain()
        .mul_scalar(0.5)
        .transpose("0:2:1")
        .sum(Axis::Width, 2.0)
        .run()
        .unwrap();

    let manual = t
        .mul_scalar(0.5)
        .unwrap()
        .transpose("0:2:1")
        .unwrap()
        .sum(Axis::Width, 2.0)
        .unwrap();

    assert_eq!(chained.shape(), manual.shape());
    assert_eq!(chained.to_vec(), manual.to_vec());
}

#[test]
fn views_share_and_clones_do_not() {
    let t = Tensor::from_slice(
        &(0..12).map(|i| i as f32).collect::<Vec<_>>(),
        Shape::new(3, 1, 2, 2),
    )
    .unwrap();

    // A view writes through to the origin.
    let mut view = t.batch_slice(2, 1).unwrap();
    view.mul_scalar_mut(10.0).unwrap();
    assert_eq!(t.value_at(2, 0, 0, 0), 80.0);

    // A clone of that view is detached.
    let mut detached = view.clone();
    detached.set_all(0.0);
    assert_eq!(t.value_at(2, 0, 0, 0), 80.0);
}

#[test]
fn shared_view_reshapes_without_copy() {
    let t = Tensor::from_slice(
        &(0..16).map(|i| i as f32).collect::<Vec<_>>(),
        Shape::new(1, 1, 4, 4),
    )
    .unwrap();

    // View the last two rows as an (1,1,2,4) tensor.
    let tail = t.shared_view(Shape::new(1, 1, 2, 4), 8).unwrap();
    assert_eq!(tail.to_vec(), (8..16).map(|i| i as f32).collect::<Vec<_>>());

    // An out-of-range view fails loudly at creation.
    assert!(matches!(
        t.shared_view(Shape::new(1, 1, 3, 4), 8),
        Err(TensorError::OutOfRange { .. })
    ));
}

#[test]
fn uninitialized_is_rejected_everywhere_but_assignment() {
    let empty = Tensor::default();
    let t = Tensor::from_vec(vec![1.0, 2.0]);

    assert!(matches!(empty.add(&t), Err(TensorError::Uninitialized { .. })));
    assert!(matches!(
        empty.dot(&t, false, false),
        Err(TensorError::Uninitialized { .. })
    ));
    assert!(matches!(
        empty.sum(Axis::Batch, 1.0),
        Err(TensorError::Uninitialized { .. })
    ));
    assert!(matches!(
        empty.transpose("0:1:2"),
        Err(TensorError::Uninitialized { .. })
    ));

    // Assignment initializes.
    let mut target = Tensor::default();
    target.copy_from(&t).unwrap();
    assert_eq!(target, t);
}
