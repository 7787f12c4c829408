// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for tensor operations.

use crate::Shape;

/// Errors that can occur during tensor operations.
///
/// All failures are raised synchronously at the call site that detects
/// them; there is no retry or deferred reporting anywhere in this crate.
#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    /// Two operand shapes are incompatible for the requested operation,
    /// either under the elementwise broadcasting rule or the contraction rule.
    #[error("incompatible shapes for {op}: {lhs} vs {rhs}")]
    DimensionMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    /// A malformed argument: empty buffer handed to a mapping constructor,
    /// ragged nested literal, unknown transpose direction or activation name.
    #[error("invalid argument for {op}: {detail}")]
    InvalidArgument { op: &'static str, detail: String },

    /// An index or view reaches beyond the underlying buffer.
    #[error("out of range in {op}: index {index} beyond length {len}")]
    OutOfRange {
        op: &'static str,
        index: usize,
        len: usize,
    },

    /// A reshape or raw-buffer construction whose element count does not
    /// match the target shape.
    #[error("size mismatch: expected {expected} elements, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// The operation requires an initialized tensor but the operand is the
    /// canonical empty (length 0) tensor.
    #[error("operation '{op}' on uninitialized tensor")]
    Uninitialized { op: &'static str },

    /// A failure while saving or reading raw tensor data.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
