// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::error::Error;

/// Result alias used throughout the numeric core.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor and streaming-statistic utilities.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Numeric guard detected a non-finite value that would otherwise propagate NaNs.
    NonFiniteValue { label: &'static str, value: f32 },
    /// A row or group index exceeded the addressable range.
    IndexOutOfRange { index: usize, len: usize },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "non-finite value detected for {label}: {value}")
            }
            TensorError::IndexOutOfRange { index, len } => {
                write!(f, "index {index} is out of range for length {len}")
            }
        }
    }
}

impl Error for TensorError {}

/// Dense row-major matrix of `f32` values.
///
/// Sample batches are `(batch, dim)`; per-group reference statistics are
/// stored as single-row tensors. The op surface is intentionally small: it
/// covers exactly what the feature extractors need.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a zero-filled tensor.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        })
    }

    /// Builds a tensor from a row-major data vector.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Builds a single-row tensor from a slice.
    pub fn from_row(values: &[f32]) -> PureResult<Self> {
        Self::from_vec(1, values.len(), values.to_vec())
    }

    /// Builds a tensor by evaluating `f` at every coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Ok(Self { rows, cols, data })
    }

    /// Returns the `(rows, cols)` shape.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Immutable view over the row-major backing storage.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view over the row-major backing storage.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Borrows row `r` as a slice.
    pub fn row(&self, r: usize) -> PureResult<&[f32]> {
        if r >= self.rows {
            return Err(TensorError::IndexOutOfRange {
                index: r,
                len: self.rows,
            });
        }
        Ok(&self.data[r * self.cols..(r + 1) * self.cols])
    }

    fn assert_same_shape(&self, other: &Tensor) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(())
    }

    /// Matrix product `self @ other`.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut out = vec![0.0f32; self.rows * other.cols];
        for r in 0..self.rows {
            for k in 0..self.cols {
                let lhs = self.data[r * self.cols + k];
                if lhs == 0.0 {
                    continue;
                }
                let row = &other.data[k * other.cols..(k + 1) * other.cols];
                let dst = &mut out[r * other.cols..(r + 1) * other.cols];
                for (d, &v) in dst.iter_mut().zip(row.iter()) {
                    *d += lhs * v;
                }
            }
        }
        Tensor::from_vec(self.rows, other.cols, out)
    }

    /// Matrix-vector product returning one scalar per row.
    pub fn matvec(&self, vector: &[f32]) -> PureResult<Vec<f32>> {
        if vector.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: vector.len(),
            });
        }
        let mut out = Vec::with_capacity(self.rows);
        for r in 0..self.rows {
            let row = &self.data[r * self.cols..(r + 1) * self.cols];
            out.push(row.iter().zip(vector.iter()).map(|(a, b)| a * b).sum());
        }
        Ok(out)
    }

    /// Returns the transpose.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.data.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Elementwise subtraction.
    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.assert_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Adds `factor * other` into `self` in place.
    pub fn add_scaled(&mut self, other: &Tensor, factor: f32) -> PureResult<()> {
        self.assert_same_shape(other)?;
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += factor * src;
        }
        Ok(())
    }

    /// Adds `row` to every row of the tensor.
    pub fn add_row(&self, row: &[f32]) -> PureResult<Tensor> {
        if row.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: row.len(),
            });
        }
        let mut data = Vec::with_capacity(self.data.len());
        for r in 0..self.rows {
            for c in 0..self.cols {
                data.push(self.data[r * self.cols + c] + row[c]);
            }
        }
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Subtracts `row` from every row of the tensor.
    pub fn sub_row(&self, row: &[f32]) -> PureResult<Tensor> {
        if row.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: row.len(),
            });
        }
        let mut data = Vec::with_capacity(self.data.len());
        for r in 0..self.rows {
            for c in 0..self.cols {
                data.push(self.data[r * self.cols + c] - row[c]);
            }
        }
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Divides every row of the tensor elementwise by `row`.
    pub fn div_row(&self, row: &[f32]) -> PureResult<Tensor> {
        if row.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: row.len(),
            });
        }
        for (c, value) in row.iter().enumerate() {
            if *value == 0.0 || !value.is_finite() {
                return Err(TensorError::NonFiniteValue {
                    label: "row_divisor",
                    value: row[c],
                });
            }
        }
        let mut data = Vec::with_capacity(self.data.len());
        for r in 0..self.rows {
            for c in 0..self.cols {
                data.push(self.data[r * self.cols + c] / row[c]);
            }
        }
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Applies `f` to every element, returning a new tensor.
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        Tensor {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&self, factor: f32) -> Tensor {
        self.map(|v| v * factor)
    }

    /// Per-column mean over all rows.
    pub fn mean_axis0(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.cols];
        for r in 0..self.rows {
            for c in 0..self.cols {
                out[c] += self.data[r * self.cols + c];
            }
        }
        let denom = self.rows as f32;
        for value in out.iter_mut() {
            *value /= denom;
        }
        out
    }

    /// Gathers the listed rows into a new tensor, duplicates allowed.
    pub fn select_rows(&self, indices: &[usize]) -> PureResult<Tensor> {
        if indices.is_empty() {
            return Err(TensorError::EmptyInput("row_selection"));
        }
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &idx in indices {
            data.extend_from_slice(self.row(idx)?);
        }
        Tensor::from_vec(indices.len(), self.cols, data)
    }

    /// Squared Euclidean distance between every row of `self` and every row
    /// of `other`: the result has shape `(self.rows, other.rows)`.
    pub fn pairwise_sq_distances(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.cols {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut data = Vec::with_capacity(self.rows * other.rows);
        for r in 0..self.rows {
            let lhs = &self.data[r * self.cols..(r + 1) * self.cols];
            for q in 0..other.rows {
                let rhs = &other.data[q * other.cols..(q + 1) * other.cols];
                let mut acc = 0.0f32;
                for (a, b) in lhs.iter().zip(rhs.iter()) {
                    let d = a - b;
                    acc += d * d;
                }
                data.push(acc);
            }
        }
        Tensor::from_vec(self.rows, other.rows, data)
    }

    /// Squared Euclidean distance between matching rows of two equally
    /// shaped tensors, one scalar per row.
    pub fn rowwise_sq_distances(&self, other: &Tensor) -> PureResult<Vec<f32>> {
        self.assert_same_shape(other)?;
        let mut out = Vec::with_capacity(self.rows);
        for r in 0..self.rows {
            let lhs = &self.data[r * self.cols..(r + 1) * self.cols];
            let rhs = &other.data[r * other.cols..(r + 1) * other.cols];
            let mut acc = 0.0f32;
            for (a, b) in lhs.iter().zip(rhs.iter()) {
                let d = a - b;
                acc += d * d;
            }
            out.push(acc);
        }
        Ok(out)
    }

    /// Sum of squared elements.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|&v| v * v).sum()
    }
}

/// Euclidean norm of a plain vector.
pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|&v| v * v).sum::<f32>().sqrt()
}
