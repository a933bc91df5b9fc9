// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{FeatureError, FeatureResult};
use crate::extractor::{FeatureCore, FeatureExtractor, FeatureVector, ReferenceMode};
use crate::features::reference_or_zeros;
use crate::io::StatsArchive;
use crate::models::{Discriminator, EmbeddingNet};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::cell::RefCell;
use std::sync::Arc;
use tilt_tensor::Tensor;

/// Numbered statistic formulas over a fixed set of offline-computed
/// cluster centroids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterVersion {
    /// Sigmoid of (distance-to-centroid − 2·sigma) per centroid.
    V0,
    /// Squared distance to every centroid, normalized by cluster count.
    V1,
    /// RBF-kernel MMD statistic against the centroids.
    V2,
    /// The `V2` statistic computed in a discriminator embedding space.
    V3,
}

impl ClusterVersion {
    /// Parses the configuration tag.
    pub fn parse(tag: &str) -> FeatureResult<Self> {
        match tag {
            "0" => Ok(ClusterVersion::V0),
            "1" => Ok(ClusterVersion::V1),
            "2" => Ok(ClusterVersion::V2),
            "3" => Ok(ClusterVersion::V3),
            other => Err(FeatureError::UnsupportedVersion {
                feature: "cluster",
                version: other.to_string(),
            }),
        }
    }

    /// Configuration tag of the version.
    pub fn tag(&self) -> &'static str {
        match self {
            ClusterVersion::V0 => "0",
            ClusterVersion::V1 => "1",
            ClusterVersion::V2 => "2",
            ClusterVersion::V3 => "3",
        }
    }
}

/// Precomputed RBF-kernel quantities for the MMD variants: the centroids in
/// kernel space, the bandwidth `theta = mean(‖centroid‖²)/10`, and the
/// centroid self-correlation `k(c_i, c_i)`.
#[derive(Clone, Debug)]
struct KernelSpace {
    centroids: Tensor,
    bandwidth: f32,
    self_corr: Vec<f32>,
}

impl KernelSpace {
    fn new(centroids: Tensor) -> FeatureResult<Self> {
        let n = centroids.rows() as f32;
        let bandwidth = centroids.squared_l2_norm() / n / 10.0;
        if !bandwidth.is_finite() || bandwidth <= 0.0 {
            return Err(FeatureError::InvalidArgument {
                feature: "cluster",
                name: "centroids",
                reason: format!("degenerate kernel bandwidth {bandwidth}"),
            });
        }
        let self_corr = centroids
            .rowwise_sq_distances(&centroids)?
            .iter()
            .map(|d| (-d / (2.0 * bandwidth)).exp())
            .collect();
        Ok(Self {
            centroids,
            bandwidth,
            self_corr,
        })
    }

    fn kernel(&self, sq_dist: f32) -> f32 {
        (-sq_dist / (2.0 * self.bandwidth)).exp()
    }
}

enum ClusterKind {
    Sigmoid,
    SquaredDistance,
    Mmd(KernelSpace),
    EmbeddedMmd {
        dis: Arc<dyn Discriminator>,
        layer: usize,
        kernel: KernelSpace,
    },
}

/// Cluster-distance statistic over fixed centroids/sigmas/priors, with one
/// formula per version tag.
pub struct ClusterFeature {
    core: FeatureCore,
    centroids: Tensor,
    sigmas: Vec<f32>,
    priors: Vec<f32>,
    version: ClusterVersion,
    kind: ClusterKind,
    embed: Option<Arc<dyn EmbeddingNet>>,
    rng: RefCell<StdRng>,
}

impl core::fmt::Debug for ClusterFeature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClusterFeature")
            .field("core", &self.core)
            .field("version", &self.version)
            .field("clusters", &self.centroids.rows())
            .finish()
    }
}

fn load_clusters(archive: &StatsArchive) -> FeatureResult<(Tensor, Vec<f32>, Vec<f32>)> {
    let centroids = archive.require("centroids")?.clone();
    let sigmas = archive.vector("sigmas")?;
    let priors = archive.vector("priors")?;
    let n = centroids.rows();
    for (name, values) in [("sigmas", &sigmas), ("priors", &priors)] {
        if values.len() != n {
            return Err(FeatureError::InvalidArgument {
                feature: "cluster",
                name: "stats",
                reason: format!("'{name}' has {} entries for {n} centroids", values.len()),
            });
        }
    }
    Ok((centroids, sigmas, priors))
}

impl ClusterFeature {
    /// Builds a version `0`, `1`, or `2` extractor from an archive holding
    /// `centroids`, `sigmas`, and `priors`. One group of width
    /// `n_clusters`. Version `3` needs a discriminator, see
    /// [`ClusterFeature::in_discriminator_space`].
    pub fn new(
        archive: &StatsArchive,
        version: ClusterVersion,
        reference: Option<Tensor>,
        seed: Option<u64>,
    ) -> FeatureResult<Self> {
        if version == ClusterVersion::V3 {
            return Err(FeatureError::MissingCollaborator {
                feature: "cluster",
                collaborator: "discriminator",
            });
        }
        let (centroids, sigmas, priors) = load_clusters(archive)?;
        let kind = match version {
            ClusterVersion::V0 => ClusterKind::Sigmoid,
            ClusterVersion::V1 => ClusterKind::SquaredDistance,
            ClusterVersion::V2 => ClusterKind::Mmd(KernelSpace::new(centroids.clone())?),
            ClusterVersion::V3 => unreachable!("rejected above"),
        };
        Self::assemble(centroids, sigmas, priors, version, kind, reference, seed)
    }

    /// Builds the version `3` extractor: the MMD statistic evaluated on the
    /// activation of `layer`, with centroid embeddings captured once here.
    pub fn in_discriminator_space(
        archive: &StatsArchive,
        dis: Arc<dyn Discriminator>,
        layer: usize,
        reference: Option<Tensor>,
        seed: Option<u64>,
    ) -> FeatureResult<Self> {
        let widths = dis.layer_widths();
        if layer >= widths.len() {
            return Err(FeatureError::LayerOutOfRange {
                layer,
                layers: widths.len(),
            });
        }
        let (centroids, sigmas, priors) = load_clusters(archive)?;
        let (_scores, embedded) = dis.forward_captured(&centroids, layer)?;
        let kernel = KernelSpace::new(embedded)?;
        let kind = ClusterKind::EmbeddedMmd { dis, layer, kernel };
        Self::assemble(
            centroids,
            sigmas,
            priors,
            ClusterVersion::V3,
            kind,
            reference,
            seed,
        )
    }

    fn assemble(
        centroids: Tensor,
        sigmas: Vec<f32>,
        priors: Vec<f32>,
        version: ClusterVersion,
        kind: ClusterKind,
        reference: Option<Tensor>,
        seed: Option<u64>,
    ) -> FeatureResult<Self> {
        let reference = reference_or_zeros(reference, centroids.rows(), "cluster")?;
        let core = FeatureCore::new("cluster", ReferenceMode::Referenced, vec![reference])?;
        let rng = match seed {
            Some(value) => StdRng::seed_from_u64(value),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            core,
            centroids,
            sigmas,
            priors,
            version,
            kind,
            embed: None,
            rng: RefCell::new(rng),
        })
    }

    /// Installs a frozen embedding applied to the batch before the
    /// distance computation (versions `0`–`2`; version `3` embeds through
    /// the discriminator instead).
    pub fn set_embedding(&mut self, embed: Arc<dyn EmbeddingNet>) {
        self.embed = Some(embed);
    }

    /// Statistic version in use.
    pub fn version(&self) -> ClusterVersion {
        self.version
    }

    /// Cluster priors loaded alongside the centroids.
    pub fn priors(&self) -> &[f32] {
        &self.priors
    }

    /// MMD statistic of `x` against the kernel-space centroids: self-kernel
    /// over a random same-batch pairing, plus centroid self-correlation,
    /// minus twice the cross-kernel.
    fn mmd_statistic(&self, x: &Tensor, kernel: &KernelSpace) -> FeatureResult<Tensor> {
        let rows = x.rows();
        let ids: Vec<usize> = {
            let mut rng = self.rng.borrow_mut();
            (0..rows).map(|_| rng.gen_range(0..rows)).collect()
        };
        let paired = x.select_rows(&ids)?;
        let self_kernel: Vec<f32> = x
            .rowwise_sq_distances(&paired)?
            .iter()
            .map(|&d| kernel.kernel(d))
            .collect();
        let cross = x.pairwise_sq_distances(&kernel.centroids)?;
        let clusters = kernel.centroids.rows();
        Ok(Tensor::from_fn(rows, clusters, |i, j| {
            self_kernel[i] + kernel.self_corr[j]
                - 2.0 * kernel.kernel(cross.data()[i * clusters + j])
        })?)
    }
}

impl FeatureExtractor for ClusterFeature {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeatureCore {
        &mut self.core
    }

    fn raw_statistic(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector> {
        let x = match &self.embed {
            Some(embed) => embed.embed(batch)?,
            None => batch.clone(),
        };
        let statistic = match &self.kind {
            ClusterKind::Sigmoid => {
                let dists = x.pairwise_sq_distances(&self.centroids)?.map(f32::sqrt);
                let shift: Vec<f32> = self.sigmas.iter().map(|s| 2.0 * s).collect();
                dists
                    .sub_row(&shift)?
                    .map(|v| 1.0 / (1.0 + (-v).exp()))
            }
            ClusterKind::SquaredDistance => x
                .pairwise_sq_distances(&self.centroids)?
                .scale(1.0 / self.centroids.rows() as f32),
            ClusterKind::Mmd(kernel) => self.mmd_statistic(&x, kernel)?,
            ClusterKind::EmbeddedMmd { dis, layer, kernel } => {
                let (_scores, embedded) = dis.forward_captured(batch, *layer)?;
                self.mmd_statistic(&embedded, kernel)?
            }
        };
        Ok(vec![statistic])
    }
}
