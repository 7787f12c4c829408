// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # tensor-engine
//!
//! A 4-D `(batch, channel, height, width)` tensor engine for neural
//! network workloads.
//!
//! This crate provides:
//! - [`Tensor`] — strided storage over a shared, reference-counted buffer,
//!   with arithmetic, reductions, batched contraction, views, and raw I/O.
//! - [`Shape`] / [`Axis`] — the fixed 4-axis shape descriptor and its
//!   derived row-major strides.
//! - [`BroadcastPlan`] — per-axis NumPy-style broadcasting realized by a
//!   single generic loop, no materialized copies.
//! - [`backend`] — interchangeable numeric kernel sets (portable fallback
//!   and a vectorized set behind the `simd` feature), selected at build
//!   time and invisible to callers.
//! - [`OpChain`] — deferred operation chains for fluent pipelines.
//! - [`ops`] — activation transforms (sigmoid, tanh, relu, softmax and
//!   their output-based derivatives) expressed purely through the tensor
//!   contract.
//!
//! # Design Goals
//! - Explicit ownership: views alias on purpose, [`Tensor::clone`] always
//!   deep-copies, and the buffer is freed by its last holder.
//! - Dual API forms: every binary operation has allocating, in-place, and
//!   output-parameter variants.
//! - Single-threaded, synchronous execution; failures are raised at the
//!   detecting call site via [`TensorError`].

pub mod backend;
mod broadcast;
mod chain;
mod error;
pub mod ops;
mod shape;
mod tensor;

pub use broadcast::BroadcastPlan;
pub use chain::OpChain;
pub use error::TensorError;
pub use ops::Activation;
pub use shape::{Axis, Shape};
pub use tensor::{SharedBuffer, Tensor};
