// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Elementwise activation functions and their tagged dispatch.
//!
//! The derivative convention throughout: primes are evaluated on the
//! forward OUTPUT, not the pre-activation input. `sigmoid_prime(y)` is
//! `y * (1 - y)` for `y = sigmoid(x)`; callers must pass the forward
//! result, never re-derive from `x`.

use std::fmt;
use std::str::FromStr;

use super::softmax_op::{softmax, softmax_prime};
use crate::{Tensor, TensorError};

/// Logistic sigmoid `1 / (1 + e^-x)`.
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Sigmoid derivative in terms of the sigmoid output `y`.
pub fn sigmoid_prime(y: f32) -> f32 {
    y * (1.0 - y)
}

/// Hyperbolic tangent.
pub fn tanh(x: f32) -> f32 {
    x.tanh()
}

/// Tanh derivative in terms of the tanh output `y`.
pub fn tanh_prime(y: f32) -> f32 {
    1.0 - y * y
}

/// Rectified linear unit `max(0, x)`.
pub fn relu(x: f32) -> f32 {
    if x <= 0.0 {
        0.0
    } else {
        x
    }
}

/// Relu derivative evaluated on the relu output `y`: 1 where the unit
/// fired, 0 elsewhere.
pub fn relu_prime(y: f32) -> f32 {
    if y <= 0.0 {
        0.0
    } else {
        1.0
    }
}

fn identity(x: f32) -> f32 {
    x
}

fn identity_prime(_y: f32) -> f32 {
    1.0
}

/// The closed set of activation kinds, dispatched by tag.
///
/// The kind set is small and fixed, so a tagged enum replaces open-ended
/// virtual dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Activation {
    Identity,
    Sigmoid,
    Tanh,
    Relu,
    Softmax,
}

impl Activation {
    /// Applies the forward transform into `output` (allocated lazily when
    /// uninitialized).
    pub fn forward(&self, input: &Tensor, output: &mut Tensor) -> Result<(), TensorError> {
        match self {
            Activation::Identity => input.apply_into(identity, output),
            Activation::Sigmoid => input.apply_into(sigmoid, output),
            Activation::Tanh => input.apply_into(tanh, output),
            Activation::Relu => input.apply_into(relu, output),
            // Softmax couples elements within a row, so it goes through
            // the whole-tensor apply path.
            Activation::Softmax => input.apply_fn(|x, out| softmax(x, out), output),
        }
    }

    /// Computes the input gradient from the forward OUTPUT and the
    /// upstream gradient: `grad_in = upstream * f'(output)` for the
    /// elementwise kinds, and the full Jacobian-vector product for
    /// softmax.
    pub fn derive(
        &self,
        output: &Tensor,
        grad_in: &mut Tensor,
        upstream: &Tensor,
    ) -> Result<(), TensorError> {
        match self {
            Activation::Softmax => softmax_prime(output, Some(upstream), grad_in),
            _ => {
                let primed = output.apply(self.prime())?;
                upstream.mul_into(&primed, grad_in)
            }
        }
    }

    fn prime(self) -> fn(f32) -> f32 {
        match self {
            Activation::Identity => identity_prime,
            Activation::Sigmoid => sigmoid_prime,
            Activation::Tanh => tanh_prime,
            Activation::Relu => relu_prime,
            Activation::Softmax => unreachable!("softmax has no scalar prime"),
        }
    }
}

impl FromStr for Activation {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, TensorError> {
        match s.to_ascii_lowercase().as_str() {
            "identity" | "none" => Ok(Activation::Identity),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "relu" => Ok(Activation::Relu),
            "softmax" => Ok(Activation::Softmax),
            other => Err(TensorError::InvalidArgument {
                op: "activation",
                detail: format!("unknown activation '{other}'"),
            }),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Identity => "identity",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Relu => "relu",
            Activation::Softmax => "softmax",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shape;

    fn approx_eq(a: &[f32], b: &[f32], tol: f32) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < tol)
    }

    #[test]
    fn test_sigmoid_values() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.9999);
        assert!(sigmoid(-10.0) < 0.0001);
    }

    #[test]
    fn test_sigmoid_prime_uses_output() {
        // f'(x) = y(1-y) with y = f(x).
        let y = sigmoid(0.7);
        let numeric = (sigmoid(0.7 + 1e-3) - sigmoid(0.7 - 1e-3)) / 2e-3;
        assert!((sigmoid_prime(y) - numeric).abs() < 1e-4);
    }

    #[test]
    fn test_tanh_prime_uses_output() {
        let y = tanh(0.3);
        let numeric = (tanh(0.3 + 1e-3) - tanh(0.3 - 1e-3)) / 2e-3;
        assert!((tanh_prime(y) - numeric).abs() < 1e-4);
    }

    #[test]
    fn test_relu() {
        assert_eq!(relu(-2.0), 0.0);
        assert_eq!(relu(0.0), 0.0);
        assert_eq!(relu(3.5), 3.5);
        assert_eq!(relu_prime(0.0), 0.0);
        assert_eq!(relu_prime(3.5), 1.0);
    }

    #[test]
    fn test_forward_sigmoid() {
        let t = Tensor::from_vec(vec![0.0, 1.0, -1.0]);
        let mut out = Tensor::default();
        Activation::Sigmoid.forward(&t, &mut out).unwrap();
        assert!(approx_eq(
            &out.to_vec(),
            &[0.5, sigmoid(1.0), sigmoid(-1.0)],
            1e-6
        ));
    }

    #[test]
    fn test_forward_softmax_dispatch() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0]);
        let mut out = Tensor::default();
        Activation::Softmax.forward(&t, &mut out).unwrap();
        let sum: f32 = out.to_vec().iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_derive_scales_upstream() {
        // relu': ones where the forward output is positive.
        let forward = Tensor::from_vec(vec![0.0, 2.0, 5.0]);
        let upstream = Tensor::from_vec(vec![1.0, 10.0, 100.0]);
        let mut grad = Tensor::default();
        Activation::Relu.derive(&forward, &mut grad, &upstream).unwrap();
        assert!(approx_eq(&grad.to_vec(), &[0.0, 10.0, 100.0], 1e-6));
    }

    #[test]
    fn test_derive_sigmoid_batch() {
        let x = Tensor::from_slice(&[0.5, -0.5, 1.5, 0.0], Shape::new(2, 1, 1, 2)).unwrap();
        let mut fwd = Tensor::default();
        Activation::Sigmoid.forward(&x, &mut fwd).unwrap();

        let upstream = Tensor::from_slice(&[1.0; 4], Shape::new(2, 1, 1, 2)).unwrap();
        let mut grad = Tensor::default();
        Activation::Sigmoid.derive(&fwd, &mut grad, &upstream).unwrap();

        let expect: Vec<f32> = fwd.to_vec().iter().map(|&y| y * (1.0 - y)).collect();
        assert!(approx_eq(&grad.to_vec(), &expect, 1e-6));
    }

    #[test]
    fn test_from_str() {
        assert_eq!("relu".parse::<Activation>().unwrap(), Activation::Relu);
        assert_eq!("SOFTMAX".parse::<Activation>().unwrap(), Activation::Softmax);
        assert_eq!("none".parse::<Activation>().unwrap(), Activation::Identity);
        assert!(matches!(
            "gelu".parse::<Activation>(),
            Err(TensorError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_display_roundtrip() {
        for a in [
            Activation::Identity,
            Activation::Sigmoid,
            Activation::Tanh,
            Activation::Relu,
            Activation::Softmax,
        ] {
            assert_eq!(a.to_string().parse::<Activation>().unwrap(), a);
        }
    }
}
