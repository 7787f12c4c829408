// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Tensor shape descriptors and stride arithmetic.
//!
//! Every tensor in this crate is four-dimensional: `(batch, channel,
//! height, width)`. Lower-rank data is represented with leading axes of
//! size 1. A shape with any axis of size 0 is the canonical empty shape —
//! the state of an uninitialized tensor — and is a legitimate default, not
//! an error.

use std::fmt;

use crate::TensorError;

/// The four fixed axes of a tensor, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Axis {
    /// Sample axis (outermost).
    Batch,
    /// Channel axis.
    Channel,
    /// Row axis.
    Height,
    /// Column axis (innermost, stride 1).
    Width,
}

impl Axis {
    /// All axes, outermost first.
    pub const ALL: [Axis; 4] = [Axis::Batch, Axis::Channel, Axis::Height, Axis::Width];

    /// Returns the axis position: batch = 0 .. width = 3.
    pub fn index(self) -> usize {
        match self {
            Axis::Batch => 0,
            Axis::Channel => 1,
            Axis::Height => 2,
            Axis::Width => 3,
        }
    }
}

impl TryFrom<usize> for Axis {
    type Error = TensorError;

    fn try_from(value: usize) -> Result<Self, TensorError> {
        match value {
            0 => Ok(Axis::Batch),
            1 => Ok(Axis::Channel),
            2 => Ok(Axis::Height),
            3 => Ok(Axis::Width),
            _ => Err(TensorError::InvalidArgument {
                op: "axis",
                detail: format!("axis index {value} out of 0..4"),
            }),
        }
    }
}

/// Describes the dimensionality of a [`crate::Tensor`].
///
/// Shapes are plain values; strides are always derived from the current
/// dimensions, never stored stale.
///
/// # Examples
/// ```
/// use tensor_engine::Shape;
/// let s = Shape::new(2, 3, 4, 5);
/// assert_eq!(s.len(), 120);
/// assert_eq!(s.strides(), [60, 20, 5, 1]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Shape {
    batch: usize,
    channel: usize,
    height: usize,
    width: usize,
}

impl Shape {
    /// Creates a shape from all four axis sizes.
    pub fn new(batch: usize, channel: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            channel,
            height,
            width,
        }
    }

    /// The canonical empty shape: all axes 0, length 0.
    pub fn empty() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// A 1-D shape `(1, 1, 1, width)`.
    pub fn vector(width: usize) -> Self {
        Self::new(1, 1, 1, width)
    }

    /// A 2-D shape `(1, 1, height, width)`.
    pub fn matrix(height: usize, width: usize) -> Self {
        Self::new(1, 1, height, width)
    }

    /// A 3-D shape `(1, channel, height, width)`.
    pub fn feature(channel: usize, height: usize, width: usize) -> Self {
        Self::new(1, channel, height, width)
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.batch * self.channel * self.height * self.width
    }

    /// `true` when this is the empty shape (any axis 0).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements per sample: `channel · height · width`.
    pub fn feature_len(&self) -> usize {
        self.channel * self.height * self.width
    }

    /// Row-major strides, recomputed from the current dimensions.
    ///
    /// `strides()[i]` is the number of elements to skip in the flat buffer
    /// to advance one step along axis `i`; the width stride is always 1.
    pub fn strides(&self) -> [usize; 4] {
        [
            self.channel * self.height * self.width,
            self.height * self.width,
            self.width,
            1,
        ]
    }

    /// Batch size.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Channel count.
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Height (rows).
    pub fn height(&self) -> usize {
        self.height
    }

    /// Width (columns).
    pub fn width(&self) -> usize {
        self.width
    }

    /// Size of the given axis.
    pub fn dim(&self, axis: Axis) -> usize {
        match axis {
            Axis::Batch => self.batch,
            Axis::Channel => self.channel,
            Axis::Height => self.height,
            Axis::Width => self.width,
        }
    }

    /// This shape with the given axis collapsed to size 1 (reduction output).
    pub fn reduced(&self, axis: Axis) -> Shape {
        let mut s = *self;
        match axis {
            Axis::Batch => s.batch = 1,
            Axis::Channel => s.channel = 1,
            Axis::Height => s.height = 1,
            Axis::Width => s.width = 1,
        }
        s
    }

    /// Dimensions as an array, outermost first.
    pub fn dims(&self) -> [usize; 4] {
        [self.batch, self.channel, self.height, self.width]
    }
}

impl Default for Shape {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.batch, self.channel, self.height, self.width
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len_and_strides() {
        let s = Shape::new(2, 3, 4, 5);
        assert_eq!(s.len(), 120);
        assert_eq!(s.strides(), [60, 20, 5, 1]);
        assert_eq!(s.feature_len(), 60);
    }

    #[test]
    fn test_stride_law() {
        // strides[i] == product(dims[i+1:]) for arbitrary shapes.
        for &(b, c, h, w) in &[(1, 1, 1, 1), (2, 1, 3, 4), (4, 2, 8, 16), (1, 7, 5, 3)] {
            let s = Shape::new(b, c, h, w);
            let dims = s.dims();
            let strides = s.strides();
            for i in 0..4 {
                let expected: usize = dims[i + 1..].iter().product();
                assert_eq!(strides[i], expected, "axis {i} of {s}");
            }
            assert_eq!(s.len(), dims.iter().product::<usize>());
        }
    }

    #[test]
    fn test_empty_shape() {
        let s = Shape::empty();
        assert!(s.is_empty());
        assert_eq!(s.len(), 0);
        assert_eq!(Shape::default(), s);

        // Any zero axis makes the shape empty.
        assert!(Shape::new(2, 0, 3, 3).is_empty());
    }

    #[test]
    fn test_convenience_constructors() {
        assert_eq!(Shape::vector(5), Shape::new(1, 1, 1, 5));
        assert_eq!(Shape::matrix(3, 4), Shape::new(1, 1, 3, 4));
        assert_eq!(Shape::feature(2, 3, 4), Shape::new(1, 2, 3, 4));
    }

    #[test]
    fn test_reduced() {
        let s = Shape::new(4, 3, 2, 5);
        assert_eq!(s.reduced(Axis::Batch), Shape::new(1, 3, 2, 5));
        assert_eq!(s.reduced(Axis::Width), Shape::new(4, 3, 2, 1));
    }

    #[test]
    fn test_axis_roundtrip() {
        for axis in Axis::ALL {
            assert_eq!(Axis::try_from(axis.index()).unwrap(), axis);
        }
        assert!(Axis::try_from(4).is_err());
    }

    #[test]
    fn test_display() {
        let s = Shape::new(2, 1, 3, 4);
        assert_eq!(format!("{s}"), "[2, 1, 3, 4]");
    }
}
