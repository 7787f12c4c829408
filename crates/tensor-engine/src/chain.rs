// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Deferred operation chains for fluent multi-step pipelines.
//!
//! [`crate::Tensor::chain`] anchors a copy of a tensor and returns an
//! [`OpChain`]; builder calls append transformation steps without
//! executing them, and [`OpChain::run`] applies the recorded steps
//! strictly in append order, threading each step's output into the next.
//! There is no laziness beyond "not yet executed" — the first failing
//! step aborts the chain.
//!
//! ```
//! use tensor_engine::Tensor;
//!
//! let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
//! let out = t
//!     .chain()
//!     .mul_scalar(2.0)
//!     .add_scalar(1.0)
//!     .run()
//!     .unwrap();
//! assert_eq!(out.to_vec(), vec![3.0, 5.0, 7.0, 9.0]);
//! ```

use crate::{Axis, Tensor, TensorError};

type Step = Box<dyn FnOnce(Tensor) -> Result<Tensor, TensorError>>;

/// A recorded, replayable sequence of tensor transforms.
///
/// Holds a deep copy of the anchor tensor taken at chain start, so later
/// mutation of the original does not change what `run()` computes.
pub struct OpChain {
    anchor: Tensor,
    steps: Vec<Step>,
}

impl OpChain {
    pub(crate) fn new(anchor: Tensor) -> Self {
        Self {
            anchor,
            steps: Vec::new(),
        }
    }

    fn push(mut self, step: impl FnOnce(Tensor) -> Result<Tensor, TensorError> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// `true` when no steps have been recorded.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Appends `+ value` elementwise.
    pub fn add_scalar(self, value: f32) -> Self {
        self.push(move |t| t.add_scalar(value))
    }

    /// Appends `- value` elementwise.
    pub fn sub_scalar(self, value: f32) -> Self {
        self.push(move |t| t.sub_scalar(value))
    }

    /// Appends `* value` elementwise.
    pub fn mul_scalar(self, value: f32) -> Self {
        self.push(move |t| t.mul_scalar(value))
    }

    /// Appends `/ value` elementwise.
    pub fn div_scalar(self, value: f32) -> Self {
        self.push(move |t| t.div_scalar(value))
    }

    /// Appends a per-element power.
    pub fn pow(self, m: f32) -> Self {
        self.push(move |t| t.pow(m))
    }

    /// Appends `+ m`, broadcast per axis.
    pub fn add(self, m: Tensor) -> Self {
        self.push(move |t| t.add(&m))
    }

    /// Appends `+ alpha * m`.
    pub fn add_scaled(self, m: Tensor, alpha: f32) -> Self {
        self.push(move |t| t.add_scaled(&m, alpha))
    }

    /// Appends `- m`.
    pub fn sub(self, m: Tensor) -> Self {
        self.push(move |t| t.sub(&m))
    }

    /// Appends an elementwise product.
    pub fn mul(self, m: Tensor) -> Self {
        self.push(move |t| t.mul(&m))
    }

    /// Appends an elementwise division.
    pub fn div(self, m: Tensor) -> Self {
        self.push(move |t| t.div(&m))
    }

    /// Appends a batched matrix product.
    pub fn dot(self, m: Tensor, trans: bool, trans_m: bool) -> Self {
        self.push(move |t| t.dot(&m, trans, trans_m))
    }

    /// Appends an axis permutation such as `"0:2:1"`.
    pub fn transpose(self, direction: &str) -> Self {
        let direction = direction.to_string();
        self.push(move |t| t.transpose(&direction))
    }

    /// Appends a single-axis sum scaled by `alpha`.
    pub fn sum(self, axis: Axis, alpha: f32) -> Self {
        self.push(move |t| t.sum(axis, alpha))
    }

    /// Appends a reduction of every non-batch axis.
    pub fn sum_by_batch(self) -> Self {
        self.push(|t| t.sum_by_batch())
    }

    /// Appends a single-axis mean.
    pub fn average(self, axis: Axis) -> Self {
        self.push(move |t| t.average(axis))
    }

    /// Appends an elementwise scalar map.
    pub fn apply(self, f: impl Fn(f32) -> f32 + 'static) -> Self {
        self.push(move |t| t.apply(&f))
    }

    /// Consumes the chain, applying every recorded step in append order.
    pub fn run(self) -> Result<Tensor, TensorError> {
        let mut t = self.anchor;
        for step in self.steps {
            t = step(t)?;
        }
        Ok(t)
    }
}

impl std::fmt::Debug for OpChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpChain")
            .field("anchor", &self.anchor)
            .field("steps", &self.steps.len())
            .finish()
    }
}
