// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::FeatureResult;
use crate::extractor::{FeatureCore, FeatureExtractor, FeatureVector, ReferenceMode};
use tilt_tensor::Tensor;

/// Zero-group extractor that disables tilting while preserving the
/// interface: `extract` yields an empty list and the tilting term is zero
/// for every sample.
#[derive(Debug)]
pub struct NoOpFeature {
    core: FeatureCore,
}

impl NoOpFeature {
    /// Builds the disabled extractor.
    pub fn new() -> Self {
        Self {
            core: FeatureCore::new("noop", ReferenceMode::Raw, Vec::new())
                .expect("zero-group core is always valid"),
        }
    }
}

impl Default for NoOpFeature {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor for NoOpFeature {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeatureCore {
        &mut self.core
    }

    fn raw_statistic(&mut self, _batch: &Tensor) -> FeatureResult<FeatureVector> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_is_empty_and_tilt_is_zero() {
        let mut feature = NoOpFeature::new();
        for rows in [1usize, 7, 64] {
            let batch = Tensor::zeros(rows, 3).unwrap();
            let out = feature.extract(&batch).unwrap();
            assert!(out.is_empty());
            let tilt = feature.log_density_term(rows, &out).unwrap();
            assert_eq!(tilt, vec![0.0; rows]);
        }
    }

    #[test]
    fn update_is_a_harmless_noop() {
        let mut feature = NoOpFeature::new();
        let batch = Tensor::zeros(2, 3).unwrap();
        let out = feature.extract(&batch).unwrap();
        feature.update_weights(&out, 0.5).unwrap();
        assert!(feature.weights().is_empty());
    }
}
