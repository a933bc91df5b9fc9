// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{FeatureError, FeatureResult};
use crate::extractor::{FeatureCore, FeatureExtractor, FeatureVector, ReferenceMode};
use crate::features::reference_or_zeros;
use crate::models::Discriminator;
use std::sync::Arc;
use tilt_tensor::Tensor;

/// Sigmoid of one named internal discriminator activation.
///
/// The capture is a single-use sink attached and detached inside
/// [`Discriminator::forward_captured`], so no stale activation can
/// accumulate across calls. The layer index is an explicit constructor
/// parameter, validated against the discriminator's layer list.
pub struct ActivationFeature {
    core: FeatureCore,
    dis: Arc<dyn Discriminator>,
    layer: usize,
}

impl core::fmt::Debug for ActivationFeature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ActivationFeature")
            .field("core", &self.core)
            .field("layer", &self.layer)
            .finish()
    }
}

impl ActivationFeature {
    /// One group whose width is the output width of `layer`.
    pub fn new(
        dis: Arc<dyn Discriminator>,
        layer: usize,
        reference: Option<Tensor>,
    ) -> FeatureResult<Self> {
        let widths = dis.layer_widths();
        if layer >= widths.len() {
            return Err(FeatureError::LayerOutOfRange {
                layer,
                layers: widths.len(),
            });
        }
        let reference = reference_or_zeros(reference, widths[layer], "activation")?;
        let core = FeatureCore::new("activation", ReferenceMode::Referenced, vec![reference])?;
        Ok(Self { core, dis, layer })
    }

    /// Index of the captured layer.
    pub fn layer(&self) -> usize {
        self.layer
    }
}

impl FeatureExtractor for ActivationFeature {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeatureCore {
        &mut self.core
    }

    fn raw_statistic(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector> {
        let (_scores, activation) = self.dis.forward_captured(batch, self.layer)?;
        Ok(vec![activation.map(|v| 1.0 / (1.0 + (-v).exp()))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MlpDiscriminator;

    #[test]
    fn captures_the_requested_layer_width() {
        let dis = Arc::new(MlpDiscriminator::new(&[3, 6, 1]).unwrap());
        let mut feature = ActivationFeature::new(dis, 0, None).unwrap();
        let batch = Tensor::from_vec(2, 3, vec![0.1, -0.2, 0.3, 0.4, -0.5, 0.6]).unwrap();
        let out = feature.extract(&batch).unwrap();
        assert_eq!(out[0].shape(), (2, 6));
        // Sigmoid output stays inside (0, 1).
        assert!(out[0].data().iter().all(|&v| v > 0.0 && v < 1.0));
    }

    #[test]
    fn layer_index_is_validated_at_construction() {
        let dis = Arc::new(MlpDiscriminator::new(&[3, 6, 1]).unwrap());
        let err = ActivationFeature::new(dis, 5, None).unwrap_err();
        assert!(matches!(err, FeatureError::LayerOutOfRange { layer: 5, layers: 2 }));
    }

    #[test]
    fn repeated_extraction_is_deterministic() {
        let dis = Arc::new(MlpDiscriminator::new(&[3, 4, 1]).unwrap());
        let mut feature = ActivationFeature::new(dis, 0, None).unwrap();
        let batch = Tensor::from_vec(1, 3, vec![0.2, 0.4, -0.6]).unwrap();
        let a = feature.extract(&batch).unwrap();
        let b = feature.extract(&batch).unwrap();
        assert_eq!(a, b);
    }
}
