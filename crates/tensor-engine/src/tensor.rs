// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The core tensor type: strided 4-D storage over a shared buffer.
//!
//! A [`Tensor`] owns (or shares) a flat `f32` buffer plus a [`Shape`].
//! Buffer sharing is explicit: only the view constructors
//! ([`Tensor::from_shared`], [`Tensor::batch_slice`],
//! [`Tensor::shared_view`]) create aliases, and mutating a shared view
//! mutates every other holder's visible data. [`Tensor::clone`] always
//! produces an independent deep copy.
//!
//! Every binary operation comes in three forms: allocating (`add`),
//! in-place (`add_mut`), and output-parameter (`add_into`), keeping
//! ownership and allocation cost explicit at each call site.

use std::fmt;
use std::io::{Read, Write};
use std::ops::Range;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use rand::Rng;
use rand_distr::Distribution;

use crate::backend;
use crate::broadcast::BroadcastPlan;
use crate::chain::OpChain;
use crate::{Axis, Shape, TensorError};

/// Reference-counted storage shared between a tensor and its views.
///
/// The buffer is freed when the last holder (owner or view) is dropped.
pub type SharedBuffer = Arc<RwLock<Vec<f32>>>;

fn read_buf(buf: &SharedBuffer) -> RwLockReadGuard<'_, Vec<f32>> {
    buf.read().unwrap_or_else(PoisonError::into_inner)
}

/// A 4-D `(batch, channel, height, width)` tensor of `f32` values.
///
/// The default value is the canonical uninitialized tensor (length 0);
/// every operation other than assignment rejects it.
pub struct Tensor {
    dim: Shape,
    strides: [usize; 4],
    is_contiguous: bool,
    offset: usize,
    data: Option<SharedBuffer>,
}

/// Read-side operand data: either a borrowed lock guard or an owned
/// snapshot taken when the operand aliases the write target.
enum SrcData<'a> {
    Guard(RwLockReadGuard<'a, Vec<f32>>, Range<usize>),
    Owned(Vec<f32>),
}

impl SrcData<'_> {
    fn slice(&self) -> &[f32] {
        match self {
            SrcData::Guard(g, r) => &g[r.clone()],
            SrcData::Owned(v) => v,
        }
    }
}

impl Tensor {
    /// Customary tolerance for approximate comparisons, e.g. with
    /// [`Tensor::all_close`].
    pub const EPSILON: f32 = 1e-5;

    // ── Construction ───────────────────────────────────────────

    /// Creates a zero-filled tensor of the given shape.
    ///
    /// An empty shape (any axis 0) yields the canonical uninitialized
    /// tensor — a legitimate default state, not an error.
    pub fn new(dim: Shape) -> Self {
        if dim.is_empty() {
            return Self {
                dim,
                strides: dim.strides(),
                is_contiguous: true,
                offset: 0,
                data: None,
            };
        }
        Self {
            dim,
            strides: dim.strides(),
            is_contiguous: true,
            offset: 0,
            data: Some(Arc::new(RwLock::new(vec![0.0; dim.len()]))),
        }
    }

    /// Creates a tensor by copying a raw slice.
    ///
    /// # Errors
    /// Returns [`TensorError::SizeMismatch`] if the slice length does not
    /// equal `dim.len()`.
    pub fn from_slice(values: &[f32], dim: Shape) -> Result<Self, TensorError> {
        if values.len() != dim.len() {
            return Err(TensorError::SizeMismatch {
                expected: dim.len(),
                actual: values.len(),
            });
        }
        let mut t = Tensor::new(dim);
        if let Some(buf) = &t.data {
            buf.write()
                .unwrap_or_else(PoisonError::into_inner)
                .copy_from_slice(values);
        }
        Ok(t)
    }

    /// Creates a `(1, 1, 1, w)` tensor from a flat literal.
    pub fn from_vec(values: Vec<f32>) -> Self {
        let dim = Shape::vector(values.len());
        if dim.is_empty() {
            return Tensor::default();
        }
        Self {
            dim,
            strides: dim.strides(),
            is_contiguous: true,
            offset: 0,
            data: Some(Arc::new(RwLock::new(values))),
        }
    }

    /// Creates a `(1, 1, h, w)` tensor from a nested literal.
    ///
    /// # Errors
    /// Returns [`TensorError::InvalidArgument`] if the literal is empty or
    /// its rows have inconsistent lengths.
    pub fn from_vec2(values: Vec<Vec<f32>>) -> Result<Self, TensorError> {
        Self::from_vec3(vec![values])
    }

    /// Creates a `(1, c, h, w)` tensor from a nested literal.
    pub fn from_vec3(values: Vec<Vec<Vec<f32>>>) -> Result<Self, TensorError> {
        Self::from_vec4(vec![values])
    }

    /// Creates a `(b, c, h, w)` tensor from a fully nested literal.
    pub fn from_vec4(values: Vec<Vec<Vec<Vec<f32>>>>) -> Result<Self, TensorError> {
        let ragged = || TensorError::InvalidArgument {
            op: "from_vec",
            detail: "nested literal rows have inconsistent lengths".into(),
        };
        let empty = || TensorError::InvalidArgument {
            op: "from_vec",
            detail: "nested literal has an empty nesting level".into(),
        };

        let b = values.len();
        if b == 0 {
            return Err(empty());
        }
        let c = values[0].len();
        let h = values.first().and_then(|v| v.first()).map_or(0, Vec::len);
        let w = values
            .first()
            .and_then(|v| v.first())
            .and_then(|v| v.first())
            .map_or(0, Vec::len);
        if c == 0 || h == 0 || w == 0 {
            return Err(empty());
        }

        let mut flat = Vec::with_capacity(b * c * h * w);
        for channels in &values {
            if channels.len() != c {
                return Err(ragged());
            }
            for rows in channels {
                if rows.len() != h {
                    return Err(ragged());
                }
                for row in rows {
                    if row.len() != w {
                        return Err(ragged());
                    }
                    flat.extend_from_slice(row);
                }
            }
        }
        Self::from_slice(&flat, Shape::new(b, c, h, w))
    }

    /// Creates a tensor that aliases an existing buffer at an element
    /// offset — the "map" constructor. No copy is made; mutations are
    /// visible through every other holder of the buffer.
    ///
    /// # Errors
    /// - [`TensorError::InvalidArgument`] for an empty buffer or shape.
    /// - [`TensorError::OutOfRange`] when `offset + dim.len()` exceeds the
    ///   buffer length.
    pub fn from_shared(
        buffer: SharedBuffer,
        dim: Shape,
        offset: usize,
    ) -> Result<Self, TensorError> {
        if dim.is_empty() {
            return Err(TensorError::InvalidArgument {
                op: "from_shared",
                detail: "cannot map an empty shape".into(),
            });
        }
        let buf_len = read_buf(&buffer).len();
        if buf_len == 0 {
            return Err(TensorError::InvalidArgument {
                op: "from_shared",
                detail: "cannot map an empty buffer".into(),
            });
        }
        if offset + dim.len() > buf_len {
            return Err(TensorError::OutOfRange {
                op: "from_shared",
                index: offset + dim.len(),
                len: buf_len,
            });
        }
        Ok(Self {
            dim,
            strides: dim.strides(),
            is_contiguous: false,
            offset,
            data: Some(buffer),
        })
    }

    // ── State accessors ────────────────────────────────────────

    /// The tensor's shape.
    pub fn shape(&self) -> Shape {
        self.dim
    }

    /// Batch size.
    pub fn batch(&self) -> usize {
        self.dim.batch()
    }

    /// Channel count.
    pub fn channel(&self) -> usize {
        self.dim.channel()
    }

    /// Height (rows).
    pub fn height(&self) -> usize {
        self.dim.height()
    }

    /// Width (columns).
    pub fn width(&self) -> usize {
        self.dim.width()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.dim.len()
    }

    /// `true` when this tensor has no buffer (length 0).
    pub fn is_empty(&self) -> bool {
        self.is_uninitialized()
    }

    /// `true` when this tensor is in the canonical uninitialized state.
    pub fn is_uninitialized(&self) -> bool {
        self.data.is_none()
    }

    /// Memory footprint of the viewed elements in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }

    /// Current row-major strides.
    pub fn strides(&self) -> [usize; 4] {
        self.strides
    }

    /// `false` when this tensor aliases a buffer created elsewhere.
    pub fn is_contiguous(&self) -> bool {
        self.is_contiguous
    }

    /// A new handle on the underlying shared buffer, or `None` for the
    /// uninitialized tensor. Use with [`Tensor::from_shared`] to build
    /// aliasing maps.
    pub fn buffer(&self) -> Option<SharedBuffer> {
        self.data.clone()
    }

    // ── Element access ─────────────────────────────────────────

    /// Value at `(b, c, h, w)`.
    ///
    /// Coordinates are bounds-checked in debug builds only; release builds
    /// trust the caller the way the rest of the hot path does.
    ///
    /// # Panics
    /// Panics when called on an uninitialized tensor.
    pub fn value_at(&self, b: usize, c: usize, h: usize, w: usize) -> f32 {
        debug_assert!(
            b < self.batch() && c < self.channel() && h < self.height() && w < self.width(),
            "index ({b}, {c}, {h}, {w}) out of {}",
            self.dim
        );
        let buf = self.data.as_ref().expect("value_at on uninitialized tensor");
        read_buf(buf)[self.flat_index(b, c, h, w)]
    }

    /// Stores `value` at `(b, c, h, w)`.
    ///
    /// # Panics
    /// Panics when called on an uninitialized tensor.
    pub fn set_value(&mut self, b: usize, c: usize, h: usize, w: usize, value: f32) {
        debug_assert!(
            b < self.batch() && c < self.channel() && h < self.height() && w < self.width(),
            "index ({b}, {c}, {h}, {w}) out of {}",
            self.dim
        );
        let idx = self.flat_index(b, c, h, w);
        let buf = self.data.as_ref().expect("set_value on uninitialized tensor");
        buf.write().unwrap_or_else(PoisonError::into_inner)[idx] = value;
    }

    /// Copies the viewed elements into a fresh vector (empty for the
    /// uninitialized tensor).
    pub fn to_vec(&self) -> Vec<f32> {
        match &self.data {
            None => Vec::new(),
            Some(buf) => read_buf(buf)[self.range()].to_vec(),
        }
    }

    /// Fills every element with `value`. No-op on the uninitialized tensor.
    pub fn set_all(&mut self, value: f32) {
        if let Some(buf) = &self.data {
            let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
            g[self.range()].fill(value);
        }
    }

    /// Fills every element with zero.
    pub fn set_zero(&mut self) {
        self.set_all(0.0);
    }

    /// Fills the tensor from a normal distribution.
    ///
    /// # Errors
    /// Returns [`TensorError::InvalidArgument`] for a non-finite or
    /// negative standard deviation.
    pub fn set_random_normal(&mut self, mean: f32, std: f32) -> Result<(), TensorError> {
        let dist = rand_distr::Normal::new(mean, std).map_err(|e| TensorError::InvalidArgument {
            op: "set_random_normal",
            detail: e.to_string(),
        })?;
        let mut rng = rand::thread_rng();
        if let Some(buf) = &self.data {
            let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
            for v in &mut g[self.range()] {
                *v = dist.sample(&mut rng);
            }
        }
        Ok(())
    }

    /// Fills the tensor from a uniform distribution over `[min, max)`.
    ///
    /// # Errors
    /// Returns [`TensorError::InvalidArgument`] when `min >= max`.
    pub fn set_random_uniform(&mut self, min: f32, max: f32) -> Result<(), TensorError> {
        if !(min < max) {
            return Err(TensorError::InvalidArgument {
                op: "set_random_uniform",
                detail: format!("empty range: {min} >= {max}"),
            });
        }
        let mut rng = rand::thread_rng();
        if let Some(buf) = &self.data {
            let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
            for v in &mut g[self.range()] {
                *v = rng.gen_range(min..max);
            }
        }
        Ok(())
    }

    /// Copies values (and shape) from another tensor.
    ///
    /// Assignment is the one operation permitted on an uninitialized
    /// tensor: it becomes a deep copy of `from`. An initialized target
    /// must have the same element count.
    pub fn copy_from(&mut self, from: &Tensor) -> Result<(), TensorError> {
        if from.is_uninitialized() {
            return Err(TensorError::Uninitialized { op: "copy_from" });
        }
        if self.is_uninitialized() {
            *self = from.clone();
            return Ok(());
        }
        if self.len() != from.len() {
            return Err(TensorError::SizeMismatch {
                expected: self.len(),
                actual: from.len(),
            });
        }
        let src = if self.shares_buffer_with(from) {
            SrcData::Owned(from.to_vec())
        } else {
            SrcData::Guard(read_buf(from.buffer_handle("copy_from")?), from.range())
        };
        let dim = from.dim;
        let range = self.range();
        let buf = self.buffer_handle("copy_from")?.clone();
        let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
        backend::copy(range.len(), src.slice(), &mut g[range]);
        drop(g);
        self.dim = dim;
        self.strides = dim.strides();
        Ok(())
    }

    /// `true` when every pairwise difference is within `tol`. Shapes must
    /// match; the uninitialized tensor only matches itself.
    pub fn all_close(&self, other: &Tensor, tol: f32) -> bool {
        if self.dim != other.dim {
            return false;
        }
        self.to_vec()
            .iter()
            .zip(other.to_vec().iter())
            .all(|(a, b)| (a - b).abs() <= tol)
    }

    // ── Arithmetic: tensor operands ────────────────────────────

    /// `self + m`, broadcast per axis. Returns a new tensor.
    pub fn add(&self, m: &Tensor) -> Result<Tensor, TensorError> {
        self.add_scaled(m, 1.0)
    }

    /// `self + alpha * m`, broadcast per axis. Returns a new tensor.
    pub fn add_scaled(&self, m: &Tensor, alpha: f32) -> Result<Tensor, TensorError> {
        let mut out = Tensor::default();
        self.add_scaled_into(m, alpha, &mut out)?;
        Ok(out)
    }

    /// `self += m`. Fails if broadcasting would change `self`'s shape.
    pub fn add_mut(&mut self, m: &Tensor) -> Result<(), TensorError> {
        self.add_scaled_mut(m, 1.0)
    }

    /// `self += alpha * m`, realized with the scaled-add kernel so no
    /// scaled copy of `m` is materialized.
    pub fn add_scaled_mut(&mut self, m: &Tensor, alpha: f32) -> Result<(), TensorError> {
        self.binary_mut(m, "add", |y, r, rs| {
            if rs == 1 {
                backend::axpy(y.len(), alpha, r, y);
            } else {
                for (i, v) in y.iter_mut().enumerate() {
                    *v += alpha * r[i * rs];
                }
            }
        })
    }

    /// `out = self + m`, allocating `out` lazily when uninitialized.
    pub fn add_into(&self, m: &Tensor, out: &mut Tensor) -> Result<(), TensorError> {
        self.add_scaled_into(m, 1.0, out)
    }

    /// `out = self + alpha * m`.
    pub fn add_scaled_into(
        &self,
        m: &Tensor,
        alpha: f32,
        out: &mut Tensor,
    ) -> Result<(), TensorError> {
        self.binary_into(m, out, "add", |l, ls, r, rs, o| {
            if ls == 1 && rs == 1 {
                backend::copy(o.len(), l, o);
                backend::axpy(o.len(), alpha, r, o);
            } else {
                for (i, v) in o.iter_mut().enumerate() {
                    *v = l[i * ls] + alpha * r[i * rs];
                }
            }
        })
    }

    /// `self - m`, broadcast per axis. Returns a new tensor.
    pub fn sub(&self, m: &Tensor) -> Result<Tensor, TensorError> {
        self.sub_scaled(m, 1.0)
    }

    /// `self - alpha * m`. Returns a new tensor.
    pub fn sub_scaled(&self, m: &Tensor, alpha: f32) -> Result<Tensor, TensorError> {
        let mut out = Tensor::default();
        self.sub_scaled_into(m, alpha, &mut out)?;
        Ok(out)
    }

    /// `self -= m`.
    pub fn sub_mut(&mut self, m: &Tensor) -> Result<(), TensorError> {
        self.sub_scaled_mut(m, 1.0)
    }

    /// `self -= alpha * m`, through the scaled-add kernel.
    pub fn sub_scaled_mut(&mut self, m: &Tensor, alpha: f32) -> Result<(), TensorError> {
        self.binary_mut(m, "sub", |y, r, rs| {
            if rs == 1 {
                backend::axpy(y.len(), -alpha, r, y);
            } else {
                for (i, v) in y.iter_mut().enumerate() {
                    *v -= alpha * r[i * rs];
                }
            }
        })
    }

    /// `out = self - m`.
    pub fn sub_into(&self, m: &Tensor, out: &mut Tensor) -> Result<(), TensorError> {
        self.sub_scaled_into(m, 1.0, out)
    }

    /// `out = self - alpha * m`.
    pub fn sub_scaled_into(
        &self,
        m: &Tensor,
        alpha: f32,
        out: &mut Tensor,
    ) -> Result<(), TensorError> {
        self.binary_into(m, out, "sub", |l, ls, r, rs, o| {
            if ls == 1 && rs == 1 {
                backend::copy(o.len(), l, o);
                backend::axpy(o.len(), -alpha, r, o);
            } else {
                for (i, v) in o.iter_mut().enumerate() {
                    *v = l[i * ls] - alpha * r[i * rs];
                }
            }
        })
    }

    /// Elementwise `self * m` (not a matrix product), broadcast per axis.
    pub fn mul(&self, m: &Tensor) -> Result<Tensor, TensorError> {
        let mut out = Tensor::default();
        self.mul_into(m, &mut out)?;
        Ok(out)
    }

    /// Elementwise `self *= m`.
    pub fn mul_mut(&mut self, m: &Tensor) -> Result<(), TensorError> {
        self.binary_mut(m, "mul", |y, r, rs| {
            for (i, v) in y.iter_mut().enumerate() {
                *v *= r[i * rs];
            }
        })
    }

    /// Elementwise `out = self * m`.
    pub fn mul_into(&self, m: &Tensor, out: &mut Tensor) -> Result<(), TensorError> {
        self.binary_into(m, out, "mul", |l, ls, r, rs, o| {
            for (i, v) in o.iter_mut().enumerate() {
                *v = l[i * ls] * r[i * rs];
            }
        })
    }

    /// Elementwise `self / m`. Division by zero follows IEEE 754
    /// (`inf`/`nan`) — deliberately unguarded.
    pub fn div(&self, m: &Tensor) -> Result<Tensor, TensorError> {
        let mut out = Tensor::default();
        self.div_into(m, &mut out)?;
        Ok(out)
    }

    /// Elementwise `self /= m`.
    pub fn div_mut(&mut self, m: &Tensor) -> Result<(), TensorError> {
        self.binary_mut(m, "div", |y, r, rs| {
            for (i, v) in y.iter_mut().enumerate() {
                *v /= r[i * rs];
            }
        })
    }

    /// Elementwise `out = self / m`.
    pub fn div_into(&self, m: &Tensor, out: &mut Tensor) -> Result<(), TensorError> {
        self.binary_into(m, out, "div", |l, ls, r, rs, o| {
            for (i, v) in o.iter_mut().enumerate() {
                *v = l[i * ls] / r[i * rs];
            }
        })
    }

    // ── Arithmetic: scalar operands ────────────────────────────

    /// `self + value` elementwise. Returns a new tensor.
    pub fn add_scalar(&self, value: f32) -> Result<Tensor, TensorError> {
        self.apply(|x| x + value)
    }

    /// `self += value` elementwise.
    pub fn add_scalar_mut(&mut self, value: f32) -> Result<(), TensorError> {
        self.apply_mut(|x| x + value)
    }

    /// `self - value` elementwise. Returns a new tensor.
    pub fn sub_scalar(&self, value: f32) -> Result<Tensor, TensorError> {
        self.apply(|x| x - value)
    }

    /// `self -= value` elementwise.
    pub fn sub_scalar_mut(&mut self, value: f32) -> Result<(), TensorError> {
        self.apply_mut(|x| x - value)
    }

    /// `self * value` elementwise, through the scaled-add kernel.
    pub fn mul_scalar(&self, value: f32) -> Result<Tensor, TensorError> {
        let src = self.snapshot_or_guard("mul_scalar", None)?;
        let mut out = Tensor::new(self.dim);
        let range = out.range();
        let buf = out.buffer_handle("mul_scalar")?.clone();
        let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
        backend::axpy(range.len(), value, src.slice(), &mut g[range]);
        drop(g);
        Ok(out)
    }

    /// `self *= value` elementwise.
    pub fn mul_scalar_mut(&mut self, value: f32) -> Result<(), TensorError> {
        self.apply_mut(|x| x * value)
    }

    /// `self / value` elementwise; `value == 0` follows IEEE 754.
    pub fn div_scalar(&self, value: f32) -> Result<Tensor, TensorError> {
        self.mul_scalar(1.0 / value)
    }

    /// `self /= value` elementwise.
    pub fn div_scalar_mut(&mut self, value: f32) -> Result<(), TensorError> {
        self.apply_mut(|x| x / value)
    }

    /// Per-element power `x^m` (not a matrix power). Returns a new tensor.
    pub fn pow(&self, m: f32) -> Result<Tensor, TensorError> {
        self.apply(|x| x.powf(m))
    }

    /// Per-element power in place.
    pub fn pow_mut(&mut self, m: f32) -> Result<(), TensorError> {
        self.apply_mut(|x| x.powf(m))
    }

    // ── Reductions ─────────────────────────────────────────────

    /// Sums every non-batch axis, yielding a `(batch, 1, 1, 1)` tensor.
    pub fn sum_by_batch(&self) -> Result<Tensor, TensorError> {
        self.require_init("sum_by_batch")?;
        let feat = self.dim.feature_len();
        let src = self.snapshot_or_guard("sum_by_batch", None)?;
        let s = src.slice();
        let mut out = Tensor::new(Shape::new(self.batch(), 1, 1, 1));
        {
            let buf = out.buffer_handle("sum_by_batch")?.clone();
            let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
            for (k, v) in g.iter_mut().enumerate() {
                *v = s[k * feat..(k + 1) * feat].iter().sum();
            }
        }
        Ok(out)
    }

    /// Sums along one axis, scaled by `alpha`. The reduced axis collapses
    /// to size 1.
    pub fn sum(&self, axis: Axis, alpha: f32) -> Result<Tensor, TensorError> {
        let mut out = Tensor::default();
        self.sum_into(&mut out, axis, alpha)?;
        Ok(out)
    }

    /// Sums along one axis into `output` (allocated lazily when
    /// uninitialized).
    pub fn sum_into(
        &self,
        output: &mut Tensor,
        axis: Axis,
        alpha: f32,
    ) -> Result<(), TensorError> {
        self.require_init("sum")?;
        let out_dim = self.dim.reduced(axis);
        if output.is_uninitialized() {
            *output = Tensor::new(out_dim);
        } else if output.dim != out_dim {
            return Err(TensorError::DimensionMismatch {
                op: "sum",
                lhs: out_dim,
                rhs: output.dim,
            });
        }

        let src = self.snapshot_or_guard("sum", Some(output))?;
        let s = src.slice();
        let in_strides = self.dim.strides();
        let out_strides = out_dim.strides();
        let [db, dc, dh, dw] = self.dim.dims();
        let ax = axis.index();

        let range = output.range();
        let buf = output.buffer_handle("sum")?.clone();
        let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
        let o = &mut g[range];
        o.fill(0.0);
        for b in 0..db {
            for c in 0..dc {
                for h in 0..dh {
                    for w in 0..dw {
                        let mut coords = [b, c, h, w];
                        let in_off = b * in_strides[0]
                            + c * in_strides[1]
                            + h * in_strides[2]
                            + w * in_strides[3];
                        coords[ax] = 0;
                        let out_off = coords[0] * out_strides[0]
                            + coords[1] * out_strides[1]
                            + coords[2] * out_strides[2]
                            + coords[3] * out_strides[3];
                        o[out_off] += s[in_off];
                    }
                }
            }
        }
        if alpha != 1.0 {
            for v in o.iter_mut() {
                *v *= alpha;
            }
        }
        Ok(())
    }

    /// Folds multiple axes by iterated single-axis reduction, in the order
    /// supplied. `alpha` is applied once, on the first fold.
    pub fn sum_axes(&self, axes: &[Axis], alpha: f32) -> Result<Tensor, TensorError> {
        let first = axes.first().ok_or(TensorError::InvalidArgument {
            op: "sum_axes",
            detail: "no axes supplied".into(),
        })?;
        let mut t = self.sum(*first, alpha)?;
        for axis in &axes[1..] {
            t = t.sum(*axis, 1.0)?;
        }
        Ok(t)
    }

    /// Mean along one axis.
    pub fn average(&self, axis: Axis) -> Result<Tensor, TensorError> {
        self.require_init("average")?;
        self.sum(axis, 1.0 / self.dim.dim(axis) as f32)
    }

    /// Mean over multiple axes.
    pub fn average_axes(&self, axes: &[Axis]) -> Result<Tensor, TensorError> {
        self.require_init("average")?;
        let count: usize = axes.iter().map(|a| self.dim.dim(*a)).product();
        self.sum_axes(axes, 1.0 / count as f32)
    }

    /// Mean over every element, as a `(1, 1, 1, 1)` tensor.
    pub fn average_all(&self) -> Result<Tensor, TensorError> {
        self.require_init("average")?;
        let total: f32 = self.to_vec().iter().sum();
        Tensor::from_slice(&[total / self.len() as f32], Shape::new(1, 1, 1, 1))
    }

    /// Sum of absolute values, through the backend kernel.
    pub fn asum(&self) -> Result<f32, TensorError> {
        self.require_init("asum")?;
        let src = self.snapshot_or_guard("asum", None)?;
        Ok(backend::asum(self.len(), src.slice()))
    }

    /// Euclidean norm of the flattened tensor.
    pub fn l2norm(&self) -> Result<f32, TensorError> {
        self.require_init("l2norm")?;
        let src = self.snapshot_or_guard("l2norm", None)?;
        Ok(src.slice().iter().map(|x| x * x).sum::<f32>().sqrt())
    }

    /// Index of the maximum element within each sample's feature row.
    pub fn argmax(&self) -> Result<Vec<usize>, TensorError> {
        self.require_init("argmax")?;
        let feat = self.dim.feature_len();
        let v = self.to_vec();
        let mut out = Vec::with_capacity(self.batch());
        for row in v.chunks(feat) {
            let mut best = 0;
            for (i, x) in row.iter().enumerate() {
                if *x > row[best] {
                    best = i;
                }
            }
            out.push(best);
        }
        Ok(out)
    }

    // ── Contraction ────────────────────────────────────────────

    /// Batched matrix product over the `(height, width)` axes.
    ///
    /// `self` is a stack of `batch` matrices; `m.batch` is either equal
    /// (per-sample right-hand matrix) or 1 (the same matrix reused for
    /// every sample — a contraction-specific reuse rule, distinct from
    /// elementwise broadcasting). `trans`/`trans_m` request transposed
    /// interpretation per GEMM convention. The result has shape
    /// `(batch, 1, H, W)` of the transposed-adjusted operands.
    pub fn dot(&self, m: &Tensor, trans: bool, trans_m: bool) -> Result<Tensor, TensorError> {
        let mut out = Tensor::default();
        self.dot_into(m, &mut out, trans, trans_m, 0.0)?;
        Ok(out)
    }

    /// `output = self · m + beta * output`, for gradient accumulation
    /// without a separate add step.
    pub fn dot_into(
        &self,
        m: &Tensor,
        output: &mut Tensor,
        trans: bool,
        trans_m: bool,
        beta: f32,
    ) -> Result<(), TensorError> {
        self.require_init("dot")?;
        m.require_init("dot")?;
        if self.channel() != 1 || m.channel() != 1 {
            return Err(TensorError::InvalidArgument {
                op: "dot",
                detail: format!(
                    "contraction needs channel 1 on both operands, got {} and {}",
                    self.dim, m.dim
                ),
            });
        }
        if m.batch() != 1 && m.batch() != self.batch() {
            return Err(TensorError::DimensionMismatch {
                op: "dot",
                lhs: self.dim,
                rhs: m.dim,
            });
        }

        let (rows, inner) = if trans {
            (self.width(), self.height())
        } else {
            (self.height(), self.width())
        };
        let (m_inner, cols) = if trans_m {
            (m.width(), m.height())
        } else {
            (m.height(), m.width())
        };
        if inner != m_inner {
            return Err(TensorError::DimensionMismatch {
                op: "dot",
                lhs: self.dim,
                rhs: m.dim,
            });
        }

        let out_dim = Shape::new(self.batch(), 1, rows, cols);
        if output.is_uninitialized() {
            *output = Tensor::new(out_dim);
        } else if output.dim != out_dim {
            return Err(TensorError::DimensionMismatch {
                op: "dot",
                lhs: out_dim,
                rhs: output.dim,
            });
        }

        // Materialize operands that alias the output before locking it.
        let b_src = if m.shares_buffer_with(output) || m.shares_buffer_with(self) {
            SrcData::Owned(m.to_vec())
        } else {
            SrcData::Guard(read_buf(m.buffer_handle("dot")?), m.range())
        };
        let a_src = self.snapshot_or_guard("dot", Some(output))?;
        let a = a_src.slice();
        let b = b_src.slice();

        let range = output.range();
        let buf = output.buffer_handle("dot")?.clone();
        let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
        let c = &mut g[range];

        let lda = self.width();
        let ldb = m.width();
        let a_step = self.dim.feature_len();
        let b_step = if m.batch() == 1 { 0 } else { m.dim.feature_len() };
        let c_step = rows * cols;

        for k in 0..self.batch() {
            backend::gemm(
                trans,
                trans_m,
                rows,
                cols,
                inner,
                1.0,
                &a[k * a_step..],
                lda,
                &b[k * b_step..],
                ldb,
                beta,
                &mut c[k * c_step..],
                cols,
            );
        }
        Ok(())
    }

    // ── Transforms and views ───────────────────────────────────

    /// Permutes the channel/height/width axes per an axis-order string
    /// such as `"0:2:1"` (swap height and width). Always produces an
    /// independent copy — logical and physical layout never diverge.
    ///
    /// # Errors
    /// Returns [`TensorError::InvalidArgument`] for a malformed direction.
    pub fn transpose(&self, direction: &str) -> Result<Tensor, TensorError> {
        self.require_init("transpose")?;
        let perm = parse_direction(direction)?;

        let inner = [self.channel(), self.height(), self.width()];
        let out_dim = Shape::new(
            self.batch(),
            inner[perm[0]],
            inner[perm[1]],
            inner[perm[2]],
        );
        let mut out = Tensor::new(out_dim);

        let src = self.snapshot_or_guard("transpose", None)?;
        let s = src.slice();
        let in_strides = self.dim.strides();
        let out_strides = out_dim.strides();

        let range = out.range();
        let buf = out.buffer_handle("transpose")?.clone();
        let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
        let d = &mut g[range];
        for b in 0..self.batch() {
            for i0 in 0..out_dim.channel() {
                for i1 in 0..out_dim.height() {
                    for i2 in 0..out_dim.width() {
                        // Coordinate i_k of the output runs along input
                        // inner axis perm[k].
                        let mut in_coords = [0usize; 3];
                        in_coords[perm[0]] = i0;
                        in_coords[perm[1]] = i1;
                        in_coords[perm[2]] = i2;
                        let in_off = b * in_strides[0]
                            + in_coords[0] * in_strides[1]
                            + in_coords[1] * in_strides[2]
                            + in_coords[2] * in_strides[3];
                        let out_off = b * out_strides[0]
                            + i0 * out_strides[1]
                            + i1 * out_strides[2]
                            + i2 * out_strides[3];
                        d[out_off] = s[in_off];
                    }
                }
            }
        }
        drop(g);
        Ok(out)
    }

    /// A zero-copy view of `size` consecutive samples starting at batch
    /// `offset`. The view shares this tensor's buffer.
    ///
    /// # Errors
    /// Returns [`TensorError::OutOfRange`] when the slice reaches past the
    /// batch axis, [`TensorError::InvalidArgument`] for `size == 0`.
    pub fn batch_slice(&self, offset: usize, size: usize) -> Result<Tensor, TensorError> {
        self.require_init("batch_slice")?;
        if size == 0 {
            return Err(TensorError::InvalidArgument {
                op: "batch_slice",
                detail: "zero-sized slice".into(),
            });
        }
        if offset + size > self.batch() {
            return Err(TensorError::OutOfRange {
                op: "batch_slice",
                index: offset + size,
                len: self.batch(),
            });
        }
        let dim = Shape::new(size, self.channel(), self.height(), self.width());
        Ok(Tensor {
            dim,
            strides: dim.strides(),
            is_contiguous: false,
            offset: self.offset + offset * self.dim.feature_len(),
            data: self.data.clone(),
        })
    }

    /// A zero-copy view with a different shape at an element offset into
    /// this tensor's buffer. Precondition: `offset + dim.len()` must stay
    /// within the underlying buffer.
    ///
    /// # Errors
    /// Returns [`TensorError::OutOfRange`] on violation of the
    /// precondition, [`TensorError::InvalidArgument`] for an empty shape.
    pub fn shared_view(&self, dim: Shape, offset: usize) -> Result<Tensor, TensorError> {
        let buf = self.buffer_handle("shared_view")?;
        if dim.is_empty() {
            return Err(TensorError::InvalidArgument {
                op: "shared_view",
                detail: "cannot view an empty shape".into(),
            });
        }
        let buf_len = read_buf(buf).len();
        let new_offset = self.offset + offset;
        if new_offset + dim.len() > buf_len {
            return Err(TensorError::OutOfRange {
                op: "shared_view",
                index: new_offset + dim.len(),
                len: buf_len,
            });
        }
        Ok(Tensor {
            dim,
            strides: dim.strides(),
            is_contiguous: false,
            offset: new_offset,
            data: self.data.clone(),
        })
    }

    /// Changes the shape in place; the element count must be unchanged.
    ///
    /// Strides are recomputed from the new shape.
    pub fn reshape(&mut self, dim: Shape) -> Result<(), TensorError> {
        if self.dim.len() != dim.len() {
            return Err(TensorError::SizeMismatch {
                expected: self.dim.len(),
                actual: dim.len(),
            });
        }
        self.dim = dim;
        self.strides = dim.strides();
        Ok(())
    }

    /// Min-max normalization to `[0, 1]`. A constant tensor divides zero
    /// by zero per IEEE 754 — unguarded like every other division here.
    pub fn normalize(&self) -> Result<Tensor, TensorError> {
        self.require_init("normalize")?;
        let v = self.to_vec();
        let min = v.iter().copied().fold(f32::INFINITY, f32::min);
        let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        self.apply(move |x| (x - min) / (max - min))
    }

    /// Min-max normalization in place.
    pub fn normalize_mut(&mut self) -> Result<(), TensorError> {
        self.require_init("normalize")?;
        let v = self.to_vec();
        let min = v.iter().copied().fold(f32::INFINITY, f32::min);
        let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        self.apply_mut(move |x| (x - min) / (max - min))
    }

    /// Zero-mean, unit-variance standardization over the whole tensor.
    pub fn standardize(&self) -> Result<Tensor, TensorError> {
        let (mean, std) = self.moments("standardize")?;
        self.apply(move |x| (x - mean) / std)
    }

    /// Standardization in place.
    pub fn standardize_mut(&mut self) -> Result<(), TensorError> {
        let (mean, std) = self.moments("standardize")?;
        self.apply_mut(move |x| (x - mean) / std)
    }

    // ── Functional apply ───────────────────────────────────────

    /// Maps a scalar function over every element into a new tensor.
    pub fn apply(&self, f: impl Fn(f32) -> f32) -> Result<Tensor, TensorError> {
        let mut out = Tensor::default();
        self.apply_into(f, &mut out)?;
        Ok(out)
    }

    /// Maps a scalar function into `out` (allocated lazily when
    /// uninitialized; otherwise its shape must match).
    pub fn apply_into(
        &self,
        f: impl Fn(f32) -> f32,
        out: &mut Tensor,
    ) -> Result<(), TensorError> {
        self.require_init("apply")?;
        if out.is_uninitialized() {
            *out = Tensor::new(self.dim);
        } else if out.dim != self.dim {
            return Err(TensorError::DimensionMismatch {
                op: "apply",
                lhs: self.dim,
                rhs: out.dim,
            });
        }
        let src = self.snapshot_or_guard("apply", Some(out))?;
        let s = src.slice();
        let range = out.range();
        let buf = out.buffer_handle("apply")?.clone();
        let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
        for (o, x) in g[range].iter_mut().zip(s) {
            *o = f(*x);
        }
        Ok(())
    }

    /// Maps a scalar function over every element in place.
    pub fn apply_mut(&mut self, f: impl Fn(f32) -> f32) -> Result<(), TensorError> {
        let range = self.range();
        let buf = self.buffer_handle("apply")?.clone();
        let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
        for v in &mut g[range] {
            *v = f(*v);
        }
        Ok(())
    }

    /// Applies a whole-tensor transform into `out`. This is the substrate
    /// for transforms that couple elements within a row (softmax).
    pub fn apply_fn(
        &self,
        f: impl FnOnce(&Tensor, &mut Tensor) -> Result<(), TensorError>,
        out: &mut Tensor,
    ) -> Result<(), TensorError> {
        self.require_init("apply")?;
        f(self, out)
    }

    // ── Deferred chain ─────────────────────────────────────────

    /// Anchors a copy of this tensor and returns a builder for a deferred
    /// operation chain; see [`OpChain`].
    pub fn chain(&self) -> OpChain {
        OpChain::new(self.clone())
    }

    // ── I/O ────────────────────────────────────────────────────

    /// Writes the elements as consecutive little-endian 32-bit floats in
    /// buffer order — a raw dump with no shape header.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<(), TensorError> {
        let buf = self.buffer_handle("save")?;
        let g = read_buf(buf);
        for v in &g[self.range()] {
            writer.write_all(&v.to_le_bytes())?;
        }
        drop(g);
        tracing::debug!("saved {} elements ({} bytes)", self.len(), self.size_bytes());
        Ok(())
    }

    /// Fills the tensor from consecutive little-endian 32-bit floats. The
    /// target shape must already be set — the format is not
    /// self-describing.
    pub fn read<R: Read>(&mut self, reader: &mut R) -> Result<(), TensorError> {
        let range = self.range();
        let buf = self.buffer_handle("read")?.clone();
        let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
        let mut bytes = [0u8; 4];
        for v in &mut g[range] {
            reader.read_exact(&mut bytes)?;
            *v = f32::from_le_bytes(bytes);
        }
        drop(g);
        tracing::debug!("read {} elements", self.len());
        Ok(())
    }

    // ── Internals ──────────────────────────────────────────────

    fn flat_index(&self, b: usize, c: usize, h: usize, w: usize) -> usize {
        self.offset
            + b * self.strides[0]
            + c * self.strides[1]
            + h * self.strides[2]
            + w * self.strides[3]
    }

    fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.dim.len()
    }

    fn buffer_handle(&self, op: &'static str) -> Result<&SharedBuffer, TensorError> {
        self.data.as_ref().ok_or(TensorError::Uninitialized { op })
    }

    fn require_init(&self, op: &'static str) -> Result<(), TensorError> {
        self.buffer_handle(op).map(|_| ())
    }

    fn shares_buffer_with(&self, other: &Tensor) -> bool {
        match (&self.data, &other.data) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Read-side access that snapshots the data when this tensor aliases
    /// `writer`, so the caller can then take the write lock safely.
    fn snapshot_or_guard(
        &self,
        op: &'static str,
        writer: Option<&Tensor>,
    ) -> Result<SrcData<'_>, TensorError> {
        let aliased = writer.is_some_and(|w| self.shares_buffer_with(w));
        if aliased {
            Ok(SrcData::Owned(self.to_vec()))
        } else {
            Ok(SrcData::Guard(
                read_buf(self.buffer_handle(op)?),
                self.range(),
            ))
        }
    }

    fn moments(&self, op: &'static str) -> Result<(f32, f32), TensorError> {
        self.require_init(op)?;
        let v = self.to_vec();
        let n = v.len() as f32;
        let mean = v.iter().sum::<f32>() / n;
        let var = v.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
        Ok((mean, var.sqrt()))
    }

    /// Shared executor for the output-parameter binary forms. The row
    /// closure receives `(lhs, lhs_stride, rhs, rhs_stride, out_row)`;
    /// strides are 1, or 0 on a replayed operand.
    fn binary_into(
        &self,
        m: &Tensor,
        out: &mut Tensor,
        op: &'static str,
        row: impl Fn(&[f32], usize, &[f32], usize, &mut [f32]),
    ) -> Result<(), TensorError> {
        self.require_init(op)?;
        m.require_init(op)?;
        let plan = BroadcastPlan::compute(op, &self.dim, &m.dim)?;
        if out.is_uninitialized() {
            *out = Tensor::new(plan.shape());
        } else if out.dim != plan.shape() {
            return Err(TensorError::DimensionMismatch {
                op,
                lhs: plan.shape(),
                rhs: out.dim,
            });
        }

        // Owned snapshots are taken before any guard so aliased operands
        // never re-enter a lock that is already held.
        let r_src = if m.shares_buffer_with(out) || m.shares_buffer_with(self) {
            SrcData::Owned(m.to_vec())
        } else {
            SrcData::Guard(read_buf(m.buffer_handle(op)?), m.range())
        };
        let l_src = self.snapshot_or_guard(op, Some(out))?;
        let l = l_src.slice();
        let r = r_src.slice();

        let range = out.range();
        let buf = out.buffer_handle(op)?.clone();
        let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
        let o = &mut g[range];

        let w = plan.shape().width();
        let (ls, rs) = (plan.lhs_row_stride(), plan.rhs_row_stride());
        plan.for_each_row(|lo, ro, oo| {
            row(&l[lo..], ls, &r[ro..], rs, &mut o[oo..oo + w]);
        });
        Ok(())
    }

    /// Shared executor for the in-place binary forms. Fails when
    /// broadcasting would change `self`'s shape. The row closure receives
    /// `(self_row, rhs, rhs_stride)`.
    fn binary_mut(
        &mut self,
        m: &Tensor,
        op: &'static str,
        row: impl Fn(&mut [f32], &[f32], usize),
    ) -> Result<(), TensorError> {
        self.require_init(op)?;
        m.require_init(op)?;
        let plan = BroadcastPlan::compute(op, &self.dim, &m.dim)?;
        if plan.shape() != self.dim {
            return Err(TensorError::DimensionMismatch {
                op,
                lhs: self.dim,
                rhs: m.dim,
            });
        }

        let r_src = if m.shares_buffer_with(self) {
            SrcData::Owned(m.to_vec())
        } else {
            SrcData::Guard(read_buf(m.buffer_handle(op)?), m.range())
        };
        let r = r_src.slice();

        let range = self.range();
        let buf = self.buffer_handle(op)?.clone();
        let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
        let y = &mut g[range];

        let w = self.dim.width();
        let rs = plan.rhs_row_stride();
        plan.for_each_row(|_, ro, oo| {
            row(&mut y[oo..oo + w], &r[ro..], rs);
        });
        Ok(())
    }

    /// Contiguous row iteration over the view, `row_len` elements at a
    /// time, for transforms that couple elements within a row.
    pub(crate) fn for_each_row_mut(
        &mut self,
        row_len: usize,
        mut f: impl FnMut(usize, &mut [f32]),
    ) -> Result<(), TensorError> {
        let range = self.range();
        let buf = self.buffer_handle("apply")?.clone();
        let mut g = buf.write().unwrap_or_else(PoisonError::into_inner);
        for (i, row) in g[range].chunks_mut(row_len).enumerate() {
            f(i, row);
        }
        Ok(())
    }
}

fn parse_direction(direction: &str) -> Result<[usize; 3], TensorError> {
    let bad = || TensorError::InvalidArgument {
        op: "transpose",
        detail: format!("malformed axis order '{direction}', expected e.g. \"0:2:1\""),
    };
    let parts: Vec<usize> = direction
        .split(':')
        .map(|p| p.trim().parse::<usize>().map_err(|_| bad()))
        .collect::<Result<_, _>>()?;
    if parts.len() != 3 {
        return Err(bad());
    }
    let mut seen = [false; 3];
    for &p in &parts {
        if p > 2 || seen[p] {
            return Err(bad());
        }
        seen[p] = true;
    }
    Ok([parts[0], parts[1], parts[2]])
}

impl Default for Tensor {
    /// The canonical uninitialized tensor.
    fn default() -> Self {
        let dim = Shape::empty();
        Self {
            dim,
            strides: dim.strides(),
            is_contiguous: true,
            offset: 0,
            data: None,
        }
    }
}

impl Clone for Tensor {
    /// Deep copy: the clone always owns an independent buffer, regardless
    /// of the source's sharing state.
    fn clone(&self) -> Self {
        match &self.data {
            None => Self {
                dim: self.dim,
                strides: self.strides,
                is_contiguous: true,
                offset: 0,
                data: None,
            },
            Some(buf) => {
                let values = read_buf(buf)[self.range()].to_vec();
                Self {
                    dim: self.dim,
                    strides: self.dim.strides(),
                    is_contiguous: true,
                    offset: 0,
                    data: Some(Arc::new(RwLock::new(values))),
                }
            }
        }
    }
}

impl PartialEq for Tensor {
    /// Value equality: same shape and exactly equal elements.
    fn eq(&self, other: &Self) -> bool {
        if self.dim != other.dim {
            return false;
        }
        match (&self.data, &other.data) {
            (None, None) => true,
            (Some(_), Some(_)) => self.to_vec() == other.to_vec(),
            _ => false,
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dim", &self.dim)
            .field("contiguous", &self.is_contiguous)
            .field("offset", &self.offset)
            .field("initialized", &self.data.is_some())
            .finish()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_uninitialized() {
            return write!(f, "Tensor <uninitialized>");
        }
        writeln!(f, "Tensor {}", self.dim)?;
        let v = self.to_vec();
        let [_, c, h, w] = self.dim.dims();
        for (bi, sample) in v.chunks(self.dim.feature_len()).enumerate() {
            if bi > 0 {
                writeln!(f)?;
            }
            for (ci, chan) in sample.chunks(h * w).enumerate() {
                if c > 1 {
                    writeln!(f, "channel {ci}:")?;
                }
                for row in chan.chunks(w) {
                    let line: Vec<String> = row.iter().map(|x| format!("{x}")).collect();
                    writeln!(f, "{}", line.join(" "))?;
                }
            }
        }
        Ok(())
    }
}
