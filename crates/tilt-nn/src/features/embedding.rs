// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{FeatureError, FeatureResult};
use crate::extractor::{FeatureCore, FeatureExtractor, FeatureVector, ReferenceMode};
use crate::io::StatsArchive;
use crate::models::EmbeddingNet;
use std::sync::Arc;
use tilt_tensor::Tensor;

/// Distributional mean feature: the pooled embedding of a frozen feature
/// network minus a precomputed reference mean (`mu`). Raw mode, since the
/// deviation against the external mean is formed right here, once.
pub struct EmbeddingMeanFeature {
    core: FeatureCore,
    embed: Arc<dyn EmbeddingNet>,
}

impl core::fmt::Debug for EmbeddingMeanFeature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EmbeddingMeanFeature")
            .field("core", &self.core)
            .finish()
    }
}

impl EmbeddingMeanFeature {
    /// Loads `mu` from the archive; its width must match the embedding
    /// width. One group of that width.
    pub fn new(embed: Arc<dyn EmbeddingNet>, archive: &StatsArchive) -> FeatureResult<Self> {
        let mu = archive.vector("mu")?;
        if mu.len() != embed.embed_dim() {
            return Err(FeatureError::InvalidArgument {
                feature: "embedding_mean",
                name: "mu",
                reason: format!(
                    "width {} does not match embedding width {}",
                    mu.len(),
                    embed.embed_dim()
                ),
            });
        }
        let core = FeatureCore::new(
            "embedding_mean",
            ReferenceMode::Raw,
            vec![Tensor::from_row(&mu)?],
        )?;
        Ok(Self { core, embed })
    }
}

impl FeatureExtractor for EmbeddingMeanFeature {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeatureCore {
        &mut self.core
    }

    fn raw_statistic(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector> {
        let pooled = self.embed.embed(batch)?;
        let mu = self.core.references()[0].row(0)?.to_vec();
        Ok(vec![pooled.sub_row(&mu)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LinearEmbedding;

    fn identity_embedding() -> Arc<LinearEmbedding> {
        Arc::new(LinearEmbedding::new(
            Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap(),
        ))
    }

    fn mu_archive(mu: &[f32]) -> StatsArchive {
        let mut archive = StatsArchive::new("stats");
        archive.insert("mu", Tensor::from_row(mu).unwrap());
        archive
    }

    #[test]
    fn statistic_is_embedding_minus_reference_mean() {
        let mut feature =
            EmbeddingMeanFeature::new(identity_embedding(), &mu_archive(&[1.0, -1.0])).unwrap();
        let batch = Tensor::from_vec(1, 2, vec![3.0, 4.0]).unwrap();
        let out = feature.extract(&batch).unwrap();
        assert_eq!(out[0].data(), &[2.0, 5.0]);
    }

    #[test]
    fn repeated_extraction_is_bit_identical() {
        let mut feature =
            EmbeddingMeanFeature::new(identity_embedding(), &mu_archive(&[0.5, 0.5])).unwrap();
        let batch = Tensor::from_vec(2, 2, vec![0.1, 0.2, -0.3, 0.4]).unwrap();
        let a = feature.extract(&batch).unwrap();
        let b = feature.extract(&batch).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn mean_width_must_match_embedding() {
        let err =
            EmbeddingMeanFeature::new(identity_embedding(), &mu_archive(&[1.0])).unwrap_err();
        assert!(matches!(err, FeatureError::InvalidArgument { .. }));
    }
}
