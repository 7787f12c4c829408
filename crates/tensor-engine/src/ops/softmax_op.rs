// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Softmax and its Jacobian-vector product.

use crate::{Shape, Tensor, TensorError};

/// Computes softmax over each sample's feature row.
///
/// Per batch row: subtract the row maximum (numerical stability),
/// exponentiate, then divide by the row sum of exponentials. `output` is
/// allocated lazily when uninitialized; otherwise its shape must match.
///
/// # Errors
/// Returns [`TensorError::Uninitialized`] for an empty input and
/// [`TensorError::DimensionMismatch`] for a pre-allocated output of the
/// wrong shape.
pub fn softmax(input: &Tensor, output: &mut Tensor) -> Result<(), TensorError> {
    if input.is_uninitialized() {
        return Err(TensorError::Uninitialized { op: "softmax" });
    }
    let dim = input.shape();
    let feat = dim.feature_len();

    // Shift each sample row by its maximum before exponentiating.
    let mut shifted = input.clone();
    shifted.for_each_row_mut(feat, |_, row| {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        for v in row.iter_mut() {
            *v -= max;
        }
    })?;

    shifted.apply_into(f32::exp, output)?;

    let sums = output.sum_by_batch()?;
    output.for_each_row_mut(feat, |b, row| {
        let s = sums.value_at(b, 0, 0, 0);
        for v in row.iter_mut() {
            *v /= s;
        }
    })?;
    Ok(())
}

/// Computes the softmax Jacobian-vector product.
///
/// `y` is the softmax OUTPUT (not the pre-activation input). For each
/// width row and output index `j`, accumulates over all `l`:
/// `y[l] * (1 - y[j])` when `l == j`, else `-y[l] * y[j]`, multiplied by
/// the upstream gradient at `l` when one is supplied. This is O(width²)
/// per row; no shortcut assuming a paired cross-entropy loss is taken.
///
/// # Errors
/// Returns [`TensorError::DimensionMismatch`] when `upstream` or a
/// pre-allocated `output` disagree with `y`'s shape.
pub fn softmax_prime(
    y: &Tensor,
    upstream: Option<&Tensor>,
    output: &mut Tensor,
) -> Result<(), TensorError> {
    if y.is_uninitialized() {
        return Err(TensorError::Uninitialized { op: "softmax_prime" });
    }
    let dim = y.shape();
    if output.is_uninitialized() {
        *output = Tensor::new(dim);
    } else if output.shape() != dim {
        return Err(TensorError::DimensionMismatch {
            op: "softmax_prime",
            lhs: dim,
            rhs: output.shape(),
        });
    }
    if let Some(u) = upstream {
        if u.shape() != dim {
            return Err(TensorError::DimensionMismatch {
                op: "softmax_prime",
                lhs: dim,
                rhs: u.shape(),
            });
        }
    }

    let w = dim.width();
    let yv = y.to_vec();
    let uv = upstream.map(Tensor::to_vec);

    output.for_each_row_mut(w, |r, out_row| {
        let base = r * w;
        for j in 0..w {
            let mut sum = 0.0f32;
            for l in 0..w {
                let mut val = if l == j {
                    yv[base + l] * (1.0 - yv[base + j])
                } else {
                    -yv[base + l] * yv[base + j]
                };
                if let Some(u) = &uv {
                    val *= u[base + l];
                }
                sum += val;
            }
            out_row[j] = sum;
        }
    })?;
    Ok(())
}

/// Softmax output shape helper used by tests.
#[cfg(test)]
fn row_sums(t: &Tensor) -> Vec<f32> {
    t.to_vec()
        .chunks(t.shape().feature_len())
        .map(|r| r.iter().sum())
        .collect()
}
