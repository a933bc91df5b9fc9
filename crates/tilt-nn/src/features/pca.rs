// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{FeatureError, FeatureResult};
use crate::extractor::{FeatureCore, FeatureExtractor, FeatureVector, ReferenceMode};
use crate::features::reference_or_zeros;
use crate::io::StatsArchive;
use tilt_tensor::Tensor;

/// Linear projection onto precomputed principal components, normalized by
/// the covariance eigenvalues.
#[derive(Debug)]
pub struct PcaFeature {
    core: FeatureCore,
    components: Tensor,
    mean: Vec<f32>,
    cov_eigs: Vec<f32>,
}

impl PcaFeature {
    /// Reads `components` (k x d), `mean` (d), and `cov_eigs` (k) from the
    /// archive. One group of width `k`.
    pub fn new(archive: &StatsArchive, reference: Option<Tensor>) -> FeatureResult<Self> {
        let components = archive.require("components")?.clone();
        let mean = archive.vector("mean")?;
        let cov_eigs = archive.vector("cov_eigs")?;
        if mean.len() != components.cols() {
            return Err(FeatureError::InvalidArgument {
                feature: "pca",
                name: "mean",
                reason: format!(
                    "width {} does not match component width {}",
                    mean.len(),
                    components.cols()
                ),
            });
        }
        if cov_eigs.len() != components.rows() {
            return Err(FeatureError::InvalidArgument {
                feature: "pca",
                name: "cov_eigs",
                reason: format!(
                    "{} eigenvalues for {} components",
                    cov_eigs.len(),
                    components.rows()
                ),
            });
        }
        if cov_eigs.iter().any(|v| !v.is_finite() || *v == 0.0) {
            return Err(FeatureError::InvalidArgument {
                feature: "pca",
                name: "cov_eigs",
                reason: "eigenvalues must be finite and non-zero".into(),
            });
        }
        let reference = reference_or_zeros(reference, components.rows(), "pca")?;
        let core = FeatureCore::new("pca", ReferenceMode::Referenced, vec![reference])?;
        Ok(Self {
            core,
            components,
            mean,
            cov_eigs,
        })
    }
}

impl FeatureExtractor for PcaFeature {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeatureCore {
        &mut self.core
    }

    fn raw_statistic(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector> {
        let centered = batch.sub_row(&self.mean)?;
        let projected = centered.matmul(&self.components.transpose())?;
        Ok(vec![projected.div_row(&self.cov_eigs)?])
    }
}

/// Gaussian-kernel evaluation against a fixed support set dotted with
/// precomputed dual coefficients.
#[derive(Debug)]
pub struct KernelPcaFeature {
    core: FeatureCore,
    support: Tensor,
    scaled_alphas: Tensor,
    gamma: f32,
}

impl KernelPcaFeature {
    /// Reads `support` (m x d), `scaled_alphas` (m x k), and the scalar
    /// `gamma` from the archive. One group of width `k`.
    pub fn new(archive: &StatsArchive, reference: Option<Tensor>) -> FeatureResult<Self> {
        let support = archive.require("support")?.clone();
        let scaled_alphas = archive.require("scaled_alphas")?.clone();
        let gamma = archive.scalar("gamma")?;
        if scaled_alphas.rows() != support.rows() {
            return Err(FeatureError::InvalidArgument {
                feature: "kernel_pca",
                name: "scaled_alphas",
                reason: format!(
                    "{} coefficient rows for {} support points",
                    scaled_alphas.rows(),
                    support.rows()
                ),
            });
        }
        if !gamma.is_finite() || gamma <= 0.0 {
            return Err(FeatureError::InvalidArgument {
                feature: "kernel_pca",
                name: "gamma",
                reason: format!("must be positive, got {gamma}"),
            });
        }
        let reference = reference_or_zeros(reference, scaled_alphas.cols(), "kernel_pca")?;
        let core = FeatureCore::new("kernel_pca", ReferenceMode::Referenced, vec![reference])?;
        Ok(Self {
            core,
            support,
            scaled_alphas,
            gamma,
        })
    }
}

impl FeatureExtractor for KernelPcaFeature {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeatureCore {
        &mut self.core
    }

    fn raw_statistic(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector> {
        let gamma = self.gamma;
        let kernel = batch
            .pairwise_sq_distances(&self.support)?
            .map(|d| (-gamma * d).exp());
        Ok(vec![kernel.matmul(&self.scaled_alphas)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pca_archive() -> StatsArchive {
        let mut archive = StatsArchive::new("pca");
        // Axis-aligned components over 2-D samples.
        archive.insert(
            "components",
            Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap(),
        );
        archive.insert("mean", Tensor::from_row(&[1.0, 2.0]).unwrap());
        archive.insert("cov_eigs", Tensor::from_row(&[2.0, 4.0]).unwrap());
        archive
    }

    #[test]
    fn projection_centers_and_normalizes() {
        let mut feature = PcaFeature::new(&pca_archive(), None).unwrap();
        let batch = Tensor::from_vec(1, 2, vec![3.0, 6.0]).unwrap();
        let out = feature.extract(&batch).unwrap();
        assert_eq!(out[0].data(), &[1.0, 1.0]);
    }

    #[test]
    fn projection_is_deterministic_across_calls() {
        let mut feature = PcaFeature::new(&pca_archive(), None).unwrap();
        let batch = Tensor::from_vec(2, 2, vec![0.5, -1.5, 2.0, 7.0]).unwrap();
        let a = feature.extract(&batch).unwrap();
        let b = feature.extract(&batch).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_eigenvalues_are_rejected_at_construction() {
        let mut archive = pca_archive();
        archive.insert("cov_eigs", Tensor::from_row(&[2.0, 0.0]).unwrap());
        assert!(PcaFeature::new(&archive, None).is_err());
    }

    fn kernel_pca_archive() -> StatsArchive {
        let mut archive = StatsArchive::new("kpca");
        archive.insert(
            "support",
            Tensor::from_vec(2, 2, vec![0.0, 0.0, 1.0, 1.0]).unwrap(),
        );
        archive.insert(
            "scaled_alphas",
            Tensor::from_vec(2, 1, vec![1.0, -1.0]).unwrap(),
        );
        archive.insert("gamma", Tensor::from_row(&[0.5]).unwrap());
        archive
    }

    #[test]
    fn kernel_projection_matches_closed_form() {
        let mut feature = KernelPcaFeature::new(&kernel_pca_archive(), None).unwrap();
        let batch = Tensor::from_vec(1, 2, vec![0.0, 0.0]).unwrap();
        let out = feature.extract(&batch).unwrap();
        // k(x, s0) = 1, k(x, s1) = exp(-0.5 * 2) = exp(-1).
        let expected = 1.0 - (-1.0f32).exp();
        assert!((out[0].data()[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn kernel_pca_validates_gamma_and_shapes() {
        let mut archive = kernel_pca_archive();
        archive.insert("gamma", Tensor::from_row(&[-1.0]).unwrap());
        assert!(KernelPcaFeature::new(&archive, None).is_err());

        let mut archive = kernel_pca_archive();
        archive.insert(
            "scaled_alphas",
            Tensor::from_vec(3, 1, vec![1.0, -1.0, 0.0]).unwrap(),
        );
        assert!(KernelPcaFeature::new(&archive, None).is_err());
    }
}
