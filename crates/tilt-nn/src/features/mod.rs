// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Concrete feature extractors. Every variant shares the weight-update and
//! averaging machinery of [`crate::extractor::FeatureCore`]; they differ
//! only in the raw per-sample statistic they compute.

pub mod activation;
pub mod cluster;
pub mod composite;
pub mod embedding;
pub mod identity;
pub mod noop;
pub mod pca;
pub mod score;

pub use activation::ActivationFeature;
pub use cluster::{ClusterFeature, ClusterVersion};
pub use composite::CompositeFeature;
pub use embedding::EmbeddingMeanFeature;
pub use identity::IdentityFeature;
pub use noop::NoOpFeature;
pub use pca::{KernelPcaFeature, PcaFeature};
pub use score::{ScoreFeature, ScoreGradientFeature, ScoreKlFeature};

use crate::error::{FeatureError, FeatureResult};
use tilt_tensor::Tensor;

/// Resolves an optional reference row against the group width the extractor
/// will produce, defaulting to zeros. Width mismatches are construction
/// errors, not extraction-time surprises.
pub(crate) fn reference_or_zeros(
    reference: Option<Tensor>,
    width: usize,
    feature: &'static str,
) -> FeatureResult<Tensor> {
    match reference {
        Some(reference) => {
            if reference.shape() != (1, width) {
                return Err(FeatureError::InvalidArgument {
                    feature,
                    name: "reference",
                    reason: format!(
                        "expected a 1x{width} row, got {:?}",
                        reference.shape()
                    ),
                });
            }
            Ok(reference)
        }
        None => Ok(Tensor::zeros(1, width)?),
    }
}
