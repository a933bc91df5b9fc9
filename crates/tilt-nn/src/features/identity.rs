// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::FeatureResult;
use crate::extractor::{FeatureCore, FeatureExtractor, FeatureVector, ReferenceMode};
use crate::features::reference_or_zeros;
use tilt_tensor::Tensor;

/// The flattened raw sample as its own statistic: moment-matches the sample
/// mean directly.
#[derive(Debug)]
pub struct IdentityFeature {
    core: FeatureCore,
}

impl IdentityFeature {
    /// One group of width `dim`, matching the flattened sample width.
    pub fn new(dim: usize, reference: Option<Tensor>) -> FeatureResult<Self> {
        let reference = reference_or_zeros(reference, dim, "identity")?;
        let core = FeatureCore::new("identity", ReferenceMode::Referenced, vec![reference])?;
        Ok(Self { core })
    }
}

impl FeatureExtractor for IdentityFeature {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeatureCore {
        &mut self.core
    }

    fn raw_statistic(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector> {
        Ok(vec![batch.clone()])
    }
}
