// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Broadcast planning for binary elementwise operations.
//!
//! A binary operation between two shapes is legal when, per axis, the sizes
//! are equal or one side is exactly 1. The plan replaces per-pattern code
//! paths (batch-only, channel-only, full match) with one mechanism: each
//! operand gets an effective stride of 0 on every axis it is replayed
//! along, and a single generic loop walks the resolved shape row by row.
//! The result is bit-identical to a naive nested loop over the
//! unbroadcast equivalent shapes, because element visit order is the same.

use crate::{Shape, TensorError};

/// An ephemeral, per-call iteration plan for one broadcast binary operation.
///
/// Never persisted; recomputed from the operand shapes on every call.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastPlan {
    shape: Shape,
    lhs_strides: [usize; 4],
    rhs_strides: [usize; 4],
}

impl BroadcastPlan {
    /// Resolves the output shape and per-operand strides, or fails with a
    /// dimension mismatch when an axis disagrees without either side
    /// being 1.
    pub fn compute(op: &'static str, lhs: &Shape, rhs: &Shape) -> Result<Self, TensorError> {
        let ld = lhs.dims();
        let rd = rhs.dims();
        let mut out = [0usize; 4];

        for i in 0..4 {
            out[i] = if ld[i] == rd[i] {
                ld[i]
            } else if ld[i] == 1 {
                rd[i]
            } else if rd[i] == 1 {
                ld[i]
            } else {
                return Err(TensorError::DimensionMismatch {
                    op,
                    lhs: *lhs,
                    rhs: *rhs,
                });
            };
        }

        let shape = Shape::new(out[0], out[1], out[2], out[3]);
        Ok(Self {
            shape,
            lhs_strides: broadcast_strides(lhs, &shape),
            rhs_strides: broadcast_strides(rhs, &shape),
        })
    }

    /// The broadcast-resolved output shape.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Width-axis stride of the left operand: 1, or 0 when its single
    /// column is replayed across the row.
    pub fn lhs_row_stride(&self) -> usize {
        self.lhs_strides[3]
    }

    /// Width-axis stride of the right operand.
    pub fn rhs_row_stride(&self) -> usize {
        self.rhs_strides[3]
    }

    /// Walks every output row (fixed batch/channel/height coordinates),
    /// yielding `(lhs_offset, rhs_offset, out_offset)` into the operands'
    /// flat views. The row length is `shape().width()`; within the row each
    /// operand advances by its row stride.
    pub fn for_each_row(&self, mut f: impl FnMut(usize, usize, usize)) {
        let out_strides = self.shape.strides();
        for b in 0..self.shape.batch() {
            for c in 0..self.shape.channel() {
                for h in 0..self.shape.height() {
                    let l = b * self.lhs_strides[0] + c * self.lhs_strides[1] + h * self.lhs_strides[2];
                    let r = b * self.rhs_strides[0] + c * self.rhs_strides[1] + h * self.rhs_strides[2];
                    let o = b * out_strides[0] + c * out_strides[1] + h * out_strides[2];
                    f(l, r, o);
                }
            }
        }
    }
}

/// Effective strides of `operand` when iterated over `target`: the
/// operand's own row-major strides, zeroed on every axis where its size-1
/// dimension is replayed.
fn broadcast_strides(operand: &Shape, target: &Shape) -> [usize; 4] {
    let own = operand.strides();
    let od = operand.dims();
    let td = target.dims();
    let mut out = [0usize; 4];
    for i in 0..4 {
        out[i] = if od[i] == td[i] { own[i] } else { 0 };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_shapes() {
        let s = Shape::new(2, 3, 4, 5);
        let plan = BroadcastPlan::compute("add", &s, &s).unwrap();
        assert_eq!(plan.shape(), s);
        assert_eq!(plan.lhs_row_stride(), 1);
        assert_eq!(plan.rhs_row_stride(), 1);
    }

    #[test]
    fn test_batch_broadcast() {
        let lhs = Shape::new(4, 2, 3, 5);
        let rhs = Shape::new(1, 2, 3, 5);
        let plan = BroadcastPlan::compute("add", &lhs, &rhs).unwrap();
        assert_eq!(plan.shape(), lhs);

        // The right operand must revisit its single batch for every b.
        let mut rhs_offsets = Vec::new();
        plan.for_each_row(|_, r, _| rhs_offsets.push(r));
        let rows_per_batch = 2 * 3;
        assert_eq!(rhs_offsets.len(), 4 * rows_per_batch);
        assert_eq!(
            &rhs_offsets[..rows_per_batch],
            &rhs_offsets[rows_per_batch..2 * rows_per_batch]
        );
    }

    #[test]
    fn test_width_broadcast() {
        let lhs = Shape::new(2, 1, 3, 4);
        let rhs = Shape::new(2, 1, 3, 1);
        let plan = BroadcastPlan::compute("mul", &lhs, &rhs).unwrap();
        assert_eq!(plan.shape(), lhs);
        assert_eq!(plan.rhs_row_stride(), 0);
        assert_eq!(plan.lhs_row_stride(), 1);
    }

    #[test]
    fn test_symmetric_resolution() {
        // Either side may carry the size-1 axis.
        let lhs = Shape::new(1, 3, 1, 5);
        let rhs = Shape::new(4, 1, 2, 5);
        let plan = BroadcastPlan::compute("add", &lhs, &rhs).unwrap();
        assert_eq!(plan.shape(), Shape::new(4, 3, 2, 5));
    }

    #[test]
    fn test_mismatch_rejected() {
        let lhs = Shape::new(2, 3, 4, 5);
        let rhs = Shape::new(2, 3, 4, 6);
        let err = BroadcastPlan::compute("add", &lhs, &rhs).unwrap_err();
        assert!(matches!(err, TensorError::DimensionMismatch { op: "add", .. }));
    }

    #[test]
    fn test_row_offsets_cover_output() {
        let lhs = Shape::new(2, 2, 2, 3);
        let rhs = Shape::new(1, 2, 1, 3);
        let plan = BroadcastPlan::compute("add", &lhs, &rhs).unwrap();

        let mut out_offsets = Vec::new();
        plan.for_each_row(|_, _, o| out_offsets.push(o));
        // Every output row visited exactly once, in layout order.
        let expected: Vec<usize> = (0..2 * 2 * 2).map(|i| i * 3).collect();
        assert_eq!(out_offsets, expected);
    }
}
