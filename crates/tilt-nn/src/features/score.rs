// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::FeatureResult;
use crate::extractor::{FeatureCore, FeatureExtractor, FeatureVector, ReferenceMode};
use crate::features::reference_or_zeros;
use crate::models::Discriminator;
use std::sync::Arc;
use tilt_tensor::Tensor;

/// Discriminator score as the matched statistic: drives the mean critic
/// output toward the reference score.
pub struct ScoreFeature {
    core: FeatureCore,
    dis: Arc<dyn Discriminator>,
}

impl core::fmt::Debug for ScoreFeature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScoreFeature").field("core", &self.core).finish()
    }
}

impl ScoreFeature {
    /// One scalar group; the reference defaults to zero.
    pub fn new(dis: Arc<dyn Discriminator>, reference: Option<Tensor>) -> FeatureResult<Self> {
        let reference = reference_or_zeros(reference, 1, "score")?;
        let core = FeatureCore::new("score", ReferenceMode::Referenced, vec![reference])?;
        Ok(Self { core, dis })
    }
}

impl FeatureExtractor for ScoreFeature {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeatureCore {
        &mut self.core
    }

    fn raw_statistic(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector> {
        Ok(vec![self.dis.forward(batch, None)?])
    }
}

/// Gradient of the summed discriminator output with respect to the input
/// batch, matching the critic's sensitivity field instead of its value.
pub struct ScoreGradientFeature {
    core: FeatureCore,
    dis: Arc<dyn Discriminator>,
}

impl core::fmt::Debug for ScoreGradientFeature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScoreGradientFeature")
            .field("core", &self.core)
            .finish()
    }
}

impl ScoreGradientFeature {
    /// One group of width `dim`, the flattened sample width.
    pub fn new(
        dis: Arc<dyn Discriminator>,
        dim: usize,
        reference: Option<Tensor>,
    ) -> FeatureResult<Self> {
        let reference = reference_or_zeros(reference, dim, "score_gradient")?;
        let core = FeatureCore::new("score_gradient", ReferenceMode::Referenced, vec![reference])?;
        Ok(Self { core, dis })
    }
}

impl FeatureExtractor for ScoreGradientFeature {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeatureCore {
        &mut self.core
    }

    fn raw_statistic(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector> {
        Ok(vec![self.dis.input_gradient(batch)?])
    }
}

/// Per-sample KL of the discriminator's class probabilities against an
/// exponential moving average of the batch mean probability vector, minus a
/// scalar reference. Raw mode: the subtraction happens here, against the
/// externally supplied reference score.
pub struct ScoreKlFeature {
    core: FeatureCore,
    dis: Arc<dyn Discriminator>,
    ref_score: f32,
    ema_coef: f32,
    ema: Option<Vec<f32>>,
}

impl core::fmt::Debug for ScoreKlFeature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScoreKlFeature")
            .field("core", &self.core)
            .field("ref_score", &self.ref_score)
            .field("ema_coef", &self.ema_coef)
            .field("ema_primed", &self.ema.is_some())
            .finish()
    }
}

impl ScoreKlFeature {
    /// Smoothing coefficient of the probability-mean EMA.
    pub const DEFAULT_EMA_COEF: f32 = 0.1;

    /// One scalar group. `ref_score` defaults to `ln 9`, the log of the
    /// usual score ceiling on ten-class data.
    pub fn new(dis: Arc<dyn Discriminator>, ref_score: Option<f32>) -> FeatureResult<Self> {
        let ref_score = ref_score.unwrap_or_else(|| 9.0f32.ln());
        let core = FeatureCore::new(
            "score_kl",
            ReferenceMode::Raw,
            vec![Tensor::from_row(&[ref_score])?],
        )?;
        Ok(Self {
            core,
            dis,
            ref_score,
            ema_coef: Self::DEFAULT_EMA_COEF,
            ema: None,
        })
    }

    /// Reference score subtracted from the raw statistic.
    pub fn ref_score(&self) -> f32 {
        self.ref_score
    }
}

impl FeatureExtractor for ScoreKlFeature {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeatureCore {
        &mut self.core
    }

    fn raw_statistic(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector> {
        let probs = self.dis.probabilities(batch)?;
        let batch_mean = probs.mean_axis0();
        let ema = match self.ema.as_mut() {
            Some(ema) => {
                for (held, &sample) in ema.iter_mut().zip(batch_mean.iter()) {
                    *held = (1.0 - self.ema_coef) * *held + self.ema_coef * sample;
                }
                ema.clone()
            }
            None => {
                self.ema = Some(batch_mean.clone());
                batch_mean
            }
        };
        let mut scores = Vec::with_capacity(probs.rows());
        for r in 0..probs.rows() {
            let row = probs.row(r)?;
            let mut kl = 0.0f32;
            for (&p, &m) in row.iter().zip(ema.iter()) {
                let p = p.max(1e-12);
                let m = m.max(1e-12);
                kl += p * (p.ln() - m.ln());
            }
            scores.push(kl - self.ref_score);
        }
        Ok(vec![Tensor::from_vec(probs.rows(), 1, scores)?])
    }

    fn reset(&mut self) {
        self.ema = None;
        self.core.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Discriminator;
    use tilt_tensor::PureResult;

    /// Critic that answers the same score for every sample.
    struct ConstantCritic(f32);

    impl Discriminator for ConstantCritic {
        fn forward(&self, batch: &Tensor, _label: Option<&Tensor>) -> PureResult<Tensor> {
            Tensor::from_fn(batch.rows(), 1, |_, _| self.0)
        }

        fn layer_widths(&self) -> Vec<usize> {
            vec![1]
        }

        fn forward_captured(&self, batch: &Tensor, _layer: usize) -> PureResult<(Tensor, Tensor)> {
            let scores = self.forward(batch, None)?;
            Ok((scores.clone(), scores))
        }

        fn input_gradient(&self, batch: &Tensor) -> PureResult<Tensor> {
            Tensor::zeros(batch.rows(), batch.cols())
        }
    }

    #[test]
    fn weight_rises_when_score_exceeds_reference() {
        let dis = Arc::new(ConstantCritic(0.7));
        let reference = Tensor::from_row(&[0.5]).unwrap();
        let mut feature = ScoreFeature::new(dis, Some(reference)).unwrap();
        let batch = Tensor::zeros(8, 4).unwrap();
        let out = feature.extract(&batch).unwrap();
        assert!((out[0].data()[0] - 0.2).abs() < 1e-6);
        feature.update_weights(&out, 0.1).unwrap();
        let weight = feature.core().weights()[0][0];
        assert!(
            weight > 0.0,
            "weight should increase for scores above reference, got {weight}"
        );
        // The increased weight reduces future log-density for the same excess.
        let tilt = feature.log_density_term(8, &out).unwrap();
        assert!(tilt[0] < 0.0);
    }

    #[test]
    fn gradient_feature_matches_discriminator_width() {
        let dis = Arc::new(ConstantCritic(0.3));
        let mut feature = ScoreGradientFeature::new(dis, 4, None).unwrap();
        let batch = Tensor::zeros(2, 4).unwrap();
        let out = feature.extract(&batch).unwrap();
        assert_eq!(out[0].shape(), (2, 4));
    }

    #[test]
    fn kl_feature_is_zero_for_uniform_probabilities() {
        // Constant scores give identical probability rows, so every row
        // equals the EMA and the KL collapses to zero.
        let dis = Arc::new(ConstantCritic(0.0));
        let mut feature = ScoreKlFeature::new(dis, Some(0.0)).unwrap();
        let batch = Tensor::zeros(4, 2).unwrap();
        let out = feature.extract(&batch).unwrap();
        for &v in out[0].data() {
            assert!(v.abs() < 1e-5, "expected ~0 KL, got {v}");
        }
    }

    #[test]
    fn kl_reset_clears_the_probability_ema() {
        let dis = Arc::new(ConstantCritic(0.4));
        let mut feature = ScoreKlFeature::new(dis, None).unwrap();
        let batch = Tensor::zeros(2, 2).unwrap();
        let _ = feature.extract(&batch).unwrap();
        assert!(feature.ema.is_some());
        feature.reset();
        assert!(feature.ema.is_none());
        assert_eq!(feature.core().avg_feature().count(), 0);
    }
}
