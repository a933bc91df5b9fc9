// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::tensor::{PureResult, TensorError};

/// Incremental mean over a stream of grouped vectors.
///
/// The estimate is maintained with the convex update
/// `value <- value * (1 - 1/k) + sample * 1/k`, so after `k` pushes the
/// value is the exact arithmetic mean of every sample since the last reset
/// without ever forming an unbounded running sum. Scalar streams are the
/// one-group, width-one case; there is no separate scalar code path.
#[derive(Clone, Debug, PartialEq)]
pub struct RunningMean {
    count: u64,
    value: Vec<Vec<f32>>,
}

impl RunningMean {
    /// Creates a zeroed accumulator with one slot per group width.
    pub fn new(widths: &[usize]) -> Self {
        Self {
            count: 0,
            value: widths.iter().map(|&w| vec![0.0; w]).collect(),
        }
    }

    /// Number of samples folded in since the last reset.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Number of groups tracked by the accumulator.
    pub fn groups(&self) -> usize {
        self.value.len()
    }

    /// Current mean estimate, one vector per group. Zero before the first
    /// push by convention.
    pub fn value(&self) -> &[Vec<f32>] {
        &self.value
    }

    /// Folds one grouped sample into the mean.
    pub fn push<S: AsRef<[f32]>>(&mut self, groups: &[S]) -> PureResult<()> {
        if groups.len() != self.value.len() {
            return Err(TensorError::DataLength {
                expected: self.value.len(),
                got: groups.len(),
            });
        }
        for (held, sample) in self.value.iter().zip(groups.iter()) {
            if sample.as_ref().len() != held.len() {
                return Err(TensorError::DataLength {
                    expected: held.len(),
                    got: sample.as_ref().len(),
                });
            }
        }
        self.count += 1;
        let alpha = 1.0 / self.count as f32;
        for (held, sample) in self.value.iter_mut().zip(groups.iter()) {
            for (dst, &src) in held.iter_mut().zip(sample.as_ref().iter()) {
                *dst = *dst * (1.0 - alpha) + src * alpha;
            }
        }
        Ok(())
    }

    /// Zeroes the estimate and the sample counter.
    pub fn reset(&mut self) {
        self.count = 0;
        for group in self.value.iter_mut() {
            for v in group.iter_mut() {
                *v = 0.0;
            }
        }
    }
}
