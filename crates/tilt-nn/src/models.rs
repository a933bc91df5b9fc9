// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Collaborator interfaces consumed by the feature extractors.
//!
//! The engine never owns model architectures; it talks to them through the
//! traits below. [`MlpDiscriminator`] is a small deterministic
//! implementation so the engine can be exercised end-to-end without
//! external model weights.

use crate::error::{FeatureError, FeatureResult};
use crate::io::StatsArchive;
use tilt_tensor::{PureResult, Tensor, TensorError};

/// Pretrained sample generator driven by the external sampler.
pub trait Generator {
    /// Width of the latent codes accepted by [`Generator::forward`].
    fn latent_dim(&self) -> usize;

    /// Maps a `(batch, latent_dim)` tensor of latent codes to samples,
    /// optionally conditioned on a label batch.
    fn forward(&self, latent: &Tensor, label: Option<&Tensor>) -> PureResult<Tensor>;

    /// Maps normalized samples back to displayable range.
    fn inverse_transform(&self, samples: &Tensor) -> PureResult<Tensor>;
}

/// Pretrained critic scored against generated samples.
pub trait Discriminator {
    /// Scores a `(batch, dim)` tensor, one column per sample, optionally
    /// conditioned on a label batch.
    fn forward(&self, batch: &Tensor, label: Option<&Tensor>) -> PureResult<Tensor>;

    /// Output width of every internal layer, in forward order.
    fn layer_widths(&self) -> Vec<usize>;

    /// Runs a forward pass with a single-use activation sink on `layer`:
    /// the sink is attached before the pass and detached before this call
    /// returns, so no captured buffer can leak across calls. Returns the
    /// scores together with the captured `(batch, layer_width)` activation.
    fn forward_captured(&self, batch: &Tensor, layer: usize) -> PureResult<(Tensor, Tensor)>;

    /// Gradient of the summed score with respect to the input batch.
    fn input_gradient(&self, batch: &Tensor) -> PureResult<Tensor>;

    /// Per-sample class probabilities. The default derives a two-class row
    /// from the sigmoid of the score.
    fn probabilities(&self, batch: &Tensor) -> PureResult<Tensor> {
        let scores = self.forward(batch, None)?;
        Tensor::from_fn(scores.rows(), 2, |r, c| {
            let p = 1.0 / (1.0 + (-scores.data()[r]).exp());
            if c == 0 {
                p
            } else {
                1.0 - p
            }
        })
    }
}

/// Frozen feature network producing pooled embeddings.
pub trait EmbeddingNet {
    /// Width of the pooled embedding rows.
    fn embed_dim(&self) -> usize;

    /// Maps a `(batch, dim)` tensor to `(batch, embed_dim)` embeddings.
    fn embed(&self, batch: &Tensor) -> PureResult<Tensor>;
}

#[derive(Clone, Debug)]
struct DenseLayer {
    weight: Tensor,
    bias: Vec<f32>,
}

impl DenseLayer {
    fn out_dim(&self) -> usize {
        self.weight.cols()
    }
}

/// Deterministic fully-connected discriminator: tanh hidden layers, linear
/// scalar head, analytic input gradient. Weights are either generated from
/// a fixed pattern or loaded from a [`StatsArchive`].
#[derive(Clone, Debug)]
pub struct MlpDiscriminator {
    layers: Vec<DenseLayer>,
}

impl MlpDiscriminator {
    /// Builds a network with the given layer dimensions, e.g. `[4, 8, 1]`
    /// for one hidden layer. The final width must be one. Parameters follow
    /// a fixed small-value pattern so construction is reproducible.
    pub fn new(dims: &[usize]) -> FeatureResult<Self> {
        if dims.len() < 2 {
            return Err(FeatureError::InvalidArgument {
                feature: "mlp_discriminator",
                name: "dims",
                reason: "at least an input and an output width are required".into(),
            });
        }
        if *dims.last().unwrap() != 1 {
            return Err(FeatureError::InvalidArgument {
                feature: "mlp_discriminator",
                name: "dims",
                reason: format!("score head must have width 1, got {}", dims.last().unwrap()),
            });
        }
        let mut layers = Vec::with_capacity(dims.len() - 1);
        for window in dims.windows(2) {
            let (rows, cols) = (window[0], window[1]);
            let weight = Tensor::from_fn(rows, cols, |r, c| {
                let idx = (r * cols + c) % 21;
                (idx as f32 - 10.0) * 0.01
            })?;
            layers.push(DenseLayer {
                weight,
                bias: vec![0.0; cols],
            });
        }
        Ok(Self { layers })
    }

    /// Restores a network from archive entries `layer{i}.weight` and
    /// `layer{i}.bias`.
    pub fn from_archive(archive: &StatsArchive) -> FeatureResult<Self> {
        let mut layers: Vec<DenseLayer> = Vec::new();
        loop {
            let idx = layers.len();
            let Some(weight) = archive.get(&format!("layer{idx}.weight")) else {
                break;
            };
            let bias = archive.vector(&format!("layer{idx}.bias"))?;
            if bias.len() != weight.cols() {
                return Err(FeatureError::Tensor(TensorError::DataLength {
                    expected: weight.cols(),
                    got: bias.len(),
                }));
            }
            if let Some(previous) = layers.last() {
                if previous.out_dim() != weight.rows() {
                    return Err(FeatureError::Tensor(TensorError::ShapeMismatch {
                        left: previous.weight.shape(),
                        right: weight.shape(),
                    }));
                }
            }
            layers.push(DenseLayer {
                weight: weight.clone(),
                bias,
            });
        }
        if layers.is_empty() {
            return Err(FeatureError::MissingEntry {
                archive: archive.label().to_string(),
                name: "layer0.weight".into(),
            });
        }
        if layers.last().unwrap().out_dim() != 1 {
            return Err(FeatureError::InvalidArgument {
                feature: "mlp_discriminator",
                name: "layer weights",
                reason: "score head must have width 1".into(),
            });
        }
        Ok(Self { layers })
    }

    /// Width of the input rows the network accepts.
    pub fn input_dim(&self) -> usize {
        self.layers[0].weight.rows()
    }

    fn is_head(&self, layer: usize) -> bool {
        layer + 1 == self.layers.len()
    }

    /// Forward pass retaining every post-activation, head included.
    fn activations(&self, batch: &Tensor) -> PureResult<Vec<Tensor>> {
        let mut out = Vec::with_capacity(self.layers.len());
        let mut current = batch.clone();
        for (idx, layer) in self.layers.iter().enumerate() {
            let pre = current.matmul(&layer.weight)?.add_row(&layer.bias)?;
            current = if self.is_head(idx) {
                pre
            } else {
                pre.map(f32::tanh)
            };
            out.push(current.clone());
        }
        Ok(out)
    }
}

impl Discriminator for MlpDiscriminator {
    fn forward(&self, batch: &Tensor, _label: Option<&Tensor>) -> PureResult<Tensor> {
        Ok(self.activations(batch)?.pop().expect("head activation"))
    }

    fn layer_widths(&self) -> Vec<usize> {
        self.layers.iter().map(DenseLayer::out_dim).collect()
    }

    fn forward_captured(&self, batch: &Tensor, layer: usize) -> PureResult<(Tensor, Tensor)> {
        if layer >= self.layers.len() {
            return Err(TensorError::IndexOutOfRange {
                index: layer,
                len: self.layers.len(),
            });
        }
        let mut activations = self.activations(batch)?;
        let scores = activations.last().expect("head activation").clone();
        let captured = activations.swap_remove(layer);
        Ok((scores, captured))
    }

    fn input_gradient(&self, batch: &Tensor) -> PureResult<Tensor> {
        let activations = self.activations(batch)?;
        // d(sum of scores)/d(head preactivation) is all ones.
        let mut grad = Tensor::from_fn(batch.rows(), 1, |_, _| 1.0)?;
        for (idx, layer) in self.layers.iter().enumerate().rev() {
            if !self.is_head(idx) {
                // tanh'(pre) = 1 - tanh(pre)^2 and activations[idx] holds tanh(pre).
                let act = &activations[idx];
                let mut damped = grad.clone();
                for (g, &a) in damped.data_mut().iter_mut().zip(act.data().iter()) {
                    *g *= 1.0 - a * a;
                }
                grad = damped;
            }
            grad = grad.matmul(&layer.weight.transpose())?;
        }
        Ok(grad)
    }
}

/// Linear test-double generator mapping latents through a fixed matrix.
/// `inverse_transform` rescales from the normalized `[-1, 1]` range into
/// `[0, 1]` display range.
#[derive(Clone, Debug)]
pub struct LinearGenerator {
    weight: Tensor,
}

impl LinearGenerator {
    /// Wraps a `(latent_dim, sample_dim)` weight matrix.
    pub fn new(weight: Tensor) -> Self {
        Self { weight }
    }
}

impl Generator for LinearGenerator {
    fn latent_dim(&self) -> usize {
        self.weight.rows()
    }

    fn forward(&self, latent: &Tensor, _label: Option<&Tensor>) -> PureResult<Tensor> {
        latent.matmul(&self.weight)
    }

    fn inverse_transform(&self, samples: &Tensor) -> PureResult<Tensor> {
        Ok(samples.map(|v| v * 0.5 + 0.5))
    }
}

/// Frozen linear embedding head used where a pooled feature network is
/// expected.
#[derive(Clone, Debug)]
pub struct LinearEmbedding {
    weight: Tensor,
}

impl LinearEmbedding {
    /// Wraps a `(sample_dim, embed_dim)` projection matrix.
    pub fn new(weight: Tensor) -> Self {
        Self { weight }
    }
}

impl EmbeddingNet for LinearEmbedding {
    fn embed_dim(&self) -> usize {
        self.weight.cols()
    }

    fn embed(&self, batch: &Tensor) -> PureResult<Tensor> {
        batch.matmul(&self.weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_by_differences(dis: &MlpDiscriminator, batch: &Tensor) -> Tensor {
        let eps = 1e-3f32;
        let base: f32 = dis.forward(batch, None).unwrap().data().iter().sum();
        let mut grad = Tensor::zeros(batch.rows(), batch.cols()).unwrap();
        for i in 0..batch.data().len() {
            let mut bumped = batch.clone();
            bumped.data_mut()[i] += eps;
            let shifted: f32 = dis.forward(&bumped, None).unwrap().data().iter().sum();
            grad.data_mut()[i] = (shifted - base) / eps;
        }
        grad
    }

    #[test]
    fn forward_is_deterministic() {
        let dis = MlpDiscriminator::new(&[3, 4, 1]).unwrap();
        let batch = Tensor::from_vec(2, 3, vec![0.1, -0.4, 0.2, 0.7, 0.0, -0.3]).unwrap();
        let a = dis.forward(&batch, None).unwrap();
        let b = dis.forward(&batch, None).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.shape(), (2, 1));
    }

    #[test]
    fn captured_activation_matches_layer_width() {
        let dis = MlpDiscriminator::new(&[3, 5, 1]).unwrap();
        let batch = Tensor::from_vec(1, 3, vec![0.3, -0.2, 0.5]).unwrap();
        let (scores, act) = dis.forward_captured(&batch, 0).unwrap();
        assert_eq!(scores.shape(), (1, 1));
        assert_eq!(act.shape(), (1, 5));
        assert!(dis.forward_captured(&batch, 2).is_err());
    }

    #[test]
    fn analytic_gradient_matches_finite_differences() {
        let dis = MlpDiscriminator::new(&[2, 4, 1]).unwrap();
        let batch = Tensor::from_vec(2, 2, vec![0.4, -0.6, -0.1, 0.8]).unwrap();
        let analytic = dis.input_gradient(&batch).unwrap();
        let numeric = gradient_by_differences(&dis, &batch);
        for (a, n) in analytic.data().iter().zip(numeric.data().iter()) {
            assert!((a - n).abs() < 1e-2, "analytic {a} vs numeric {n}");
        }
    }

    #[test]
    fn default_probabilities_are_two_class() {
        let dis = MlpDiscriminator::new(&[2, 1]).unwrap();
        let batch = Tensor::from_vec(1, 2, vec![0.5, -0.5]).unwrap();
        let probs = dis.probabilities(&batch).unwrap();
        assert_eq!(probs.shape(), (1, 2));
        let row = probs.row(0).unwrap();
        assert!((row[0] + row[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn generator_roundtrip_shapes() {
        let weight = Tensor::from_vec(2, 3, vec![1.0, 0.0, 0.5, 0.0, 1.0, -0.5]).unwrap();
        let gen = LinearGenerator::new(weight);
        assert_eq!(gen.latent_dim(), 2);
        let latent = Tensor::from_vec(4, 2, vec![0.0; 8]).unwrap();
        let samples = gen.forward(&latent, None).unwrap();
        assert_eq!(samples.shape(), (4, 3));
        let display = gen.inverse_transform(&samples).unwrap();
        assert_eq!(display.data()[0], 0.5);
    }

    #[test]
    fn rejects_multi_column_head() {
        assert!(MlpDiscriminator::new(&[3, 2]).is_err());
        assert!(MlpDiscriminator::new(&[3]).is_err());
    }

    #[test]
    fn archive_weights_reproduce_the_network() {
        let mut archive = StatsArchive::new("weights");
        archive.insert(
            "layer0.weight",
            Tensor::from_vec(2, 3, vec![0.1, -0.2, 0.3, 0.0, 0.4, -0.1]).unwrap(),
        );
        archive.insert("layer0.bias", Tensor::from_row(&[0.0, 0.1, -0.1]).unwrap());
        archive.insert(
            "layer1.weight",
            Tensor::from_vec(3, 1, vec![0.5, -0.5, 0.25]).unwrap(),
        );
        archive.insert("layer1.bias", Tensor::from_row(&[0.05]).unwrap());

        let dis = MlpDiscriminator::from_archive(&archive).unwrap();
        assert_eq!(dis.input_dim(), 2);
        assert_eq!(dis.layer_widths(), vec![3, 1]);

        let batch = Tensor::from_vec(1, 2, vec![1.0, -1.0]).unwrap();
        let hidden: Vec<f32> = [0.1f32, -0.5, 0.3]
            .iter()
            .map(|v| v.tanh())
            .collect();
        let expected = 0.5 * hidden[0] - 0.5 * hidden[1] + 0.25 * hidden[2] + 0.05;
        let score = dis.forward(&batch, None).unwrap();
        assert!((score.data()[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn archive_without_layers_is_rejected() {
        let archive = StatsArchive::new("empty");
        assert!(matches!(
            MlpDiscriminator::from_archive(&archive).unwrap_err(),
            FeatureError::MissingEntry { .. }
        ));
    }
}
