// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Shared state and protocol of every feature extractor.
//!
//! Concrete extractors implement [`FeatureExtractor::raw_statistic`] and
//! delegate the rest (reference centering, streaming averages, callback
//! dispatch, the weight-update protocol) to the [`FeatureCore`] they own.

use crate::callback::Callback;
use crate::error::{FeatureError, FeatureResult};
use crate::snapshot::Snapshot;
use crate::update::{RuleState, UpdateRule};
use std::sync::Arc;
use tilt_tensor::{l2_norm, PureResult, RunningMean, Tensor, TensorError};
use tracing::debug;

/// Ordered sequence of per-group statistic tensors, one `(batch, width)`
/// tensor per feature group. Ephemeral, produced per batch.
pub type FeatureVector = Vec<Tensor>;

/// Maps normalized samples into displayable range for diagnostics.
pub type SampleTransform = Arc<dyn Fn(&Tensor) -> PureResult<Tensor> + Send + Sync>;

/// How the per-group deviation from the reference is formed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceMode {
    /// The raw statistic already encodes the deviation against an
    /// externally fixed mean; it is returned as-is.
    Raw,
    /// The per-group reference is subtracted on every extraction, so
    /// consumers always see a zero-centered deviation at the constraint
    /// optimum.
    Referenced,
}

/// State shared by every extractor: references, dual weights, update-rule
/// buffers, running averages, and callbacks. Exclusively owned by one
/// extractor instance and mutated only from the sampler's thread.
pub struct FeatureCore {
    name: String,
    mode: ReferenceMode,
    references: Vec<Tensor>,
    weights: Vec<Vec<f32>>,
    rule: UpdateRule,
    state: RuleState,
    avg_feature: RunningMean,
    avg_weight: RunningMean,
    callbacks: Vec<Box<dyn Callback>>,
    inverse: Option<SampleTransform>,
}

impl core::fmt::Debug for FeatureCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FeatureCore")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("groups", &self.group_widths())
            .field("rule", &self.rule)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl FeatureCore {
    /// Builds the shared state from per-group references. Every reference
    /// must be a single row; weights start at zero with matching widths.
    pub fn new(
        name: impl Into<String>,
        mode: ReferenceMode,
        references: Vec<Tensor>,
    ) -> FeatureResult<Self> {
        for reference in &references {
            if reference.rows() != 1 {
                return Err(FeatureError::Tensor(TensorError::ShapeMismatch {
                    left: reference.shape(),
                    right: (1, reference.cols()),
                }));
            }
        }
        let widths: Vec<usize> = references.iter().map(Tensor::cols).collect();
        let rule = UpdateRule::default();
        Ok(Self {
            name: name.into(),
            mode,
            weights: widths.iter().map(|&w| vec![0.0; w]).collect(),
            state: RuleState::new(&rule, &widths),
            rule,
            avg_feature: RunningMean::new(&widths),
            avg_weight: RunningMean::new(&widths),
            references,
            callbacks: Vec::new(),
            inverse: None,
        })
    }

    /// Extractor name used to prefix snapshot keys.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reference handling mode.
    pub fn mode(&self) -> ReferenceMode {
        self.mode
    }

    /// Number of feature groups.
    pub fn num_groups(&self) -> usize {
        self.references.len()
    }

    /// Width of every group, in order.
    pub fn group_widths(&self) -> Vec<usize> {
        self.references.iter().map(Tensor::cols).collect()
    }

    /// Per-group reference statistics.
    pub fn references(&self) -> &[Tensor] {
        &self.references
    }

    /// Per-group dual weights.
    pub fn weights(&self) -> &[Vec<f32>] {
        &self.weights
    }

    /// Euclidean norm over every weight coordinate of every group.
    pub fn weight_norm(&self) -> f32 {
        self.weights
            .iter()
            .map(|w| w.iter().map(|&v| v * v).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }

    /// Streaming mean of per-group feature deviations.
    pub fn avg_feature(&self) -> &RunningMean {
        &self.avg_feature
    }

    /// Streaming mean of the dual weights across updates.
    pub fn avg_weight(&self) -> &RunningMean {
        &self.avg_weight
    }

    /// Replaces the update rule. Resets the rule buffers, so this belongs
    /// in construction code, not between updates.
    pub fn set_rule(&mut self, rule: UpdateRule) -> FeatureResult<()> {
        rule.validate()?;
        let widths = self.group_widths();
        self.rule = rule;
        self.state = RuleState::new(&self.rule, &widths);
        Ok(())
    }

    /// Currently configured update rule.
    pub fn rule(&self) -> UpdateRule {
        self.rule
    }

    /// Registers a callback at the end of the dispatch order.
    pub fn push_callback(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    /// Number of registered callbacks.
    pub fn num_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// Installs the display-range transform used by diagnostics.
    pub fn set_inverse_transform(&mut self, transform: SampleTransform) {
        self.inverse = Some(transform);
    }

    /// Checks group count, widths, and a consistent batch size; returns the
    /// batch size.
    pub fn validate_features(&self, features: &[Tensor]) -> FeatureResult<usize> {
        if features.len() != self.references.len() {
            return Err(FeatureError::Tensor(TensorError::DataLength {
                expected: self.references.len(),
                got: features.len(),
            }));
        }
        let mut rows = None;
        for (feature, reference) in features.iter().zip(self.references.iter()) {
            if feature.cols() != reference.cols() {
                return Err(FeatureError::Tensor(TensorError::ShapeMismatch {
                    left: feature.shape(),
                    right: reference.shape(),
                }));
            }
            match rows {
                None => rows = Some(feature.rows()),
                Some(expected) if expected != feature.rows() => {
                    return Err(FeatureError::Tensor(TensorError::ShapeMismatch {
                        left: (expected, feature.cols()),
                        right: feature.shape(),
                    }));
                }
                _ => {}
            }
        }
        Ok(rows.unwrap_or(0))
    }

    /// Subtracts the per-group reference in `Referenced` mode.
    pub(crate) fn center(&self, features: &mut [Tensor]) -> FeatureResult<()> {
        if self.mode == ReferenceMode::Raw {
            return Ok(());
        }
        for (feature, reference) in features.iter_mut().zip(self.references.iter()) {
            *feature = feature.sub_row(reference.row(0)?)?;
        }
        Ok(())
    }

    /// Folds the per-group batch means into the feature running average.
    pub(crate) fn track_features(&mut self, features: &[Tensor]) -> FeatureResult<()> {
        let means: Vec<Vec<f32>> = features.iter().map(Tensor::mean_axis0).collect();
        self.avg_feature.push(&means)?;
        Ok(())
    }

    /// Hands the snapshot to every callback in registration order.
    pub(crate) fn dispatch(&mut self, snapshot: &Snapshot) {
        for callback in self.callbacks.iter_mut() {
            callback.invoke(snapshot);
        }
    }

    /// Standard diagnostic snapshot: per-group means and residual norms,
    /// the current weight norm, the mean tilting term, and (when the
    /// transforms are available) display-range samples and latent codes.
    pub fn default_snapshot(
        &self,
        batch: &Tensor,
        latent: Option<&Tensor>,
        features: &[Tensor],
    ) -> FeatureResult<Snapshot> {
        let name = &self.name;
        let mut snapshot = Snapshot::new();
        for (idx, feature) in features.iter().enumerate() {
            let mean = feature.mean_axis0();
            let flat = mean.iter().sum::<f32>() / mean.len().max(1) as f32;
            snapshot.insert_scalar(format!("{name}.group{idx}.mean"), flat);
            snapshot.insert_scalar(format!("{name}.group{idx}.residual"), l2_norm(&mean));
        }
        snapshot.insert_scalar(format!("{name}.weight_norm"), self.weight_norm());
        if !features.is_empty() {
            let tilt = self.log_density_term(batch.rows(), features)?;
            let mean_tilt = tilt.iter().sum::<f32>() / tilt.len().max(1) as f32;
            snapshot.insert_scalar(format!("{name}.tilt.mean"), mean_tilt);
        }
        if let Some(transform) = &self.inverse {
            snapshot.insert_matrix(format!("{name}.samples"), transform(batch)?);
        }
        if let Some(latent) = latent {
            snapshot.insert_matrix(format!("{name}.latents"), latent.clone());
        }
        Ok(snapshot)
    }

    /// Tilting contribution per sample: the negative inner product of
    /// weights and features, summed across groups.
    pub fn log_density_term(
        &self,
        batch_len: usize,
        features: &[Tensor],
    ) -> FeatureResult<Vec<f32>> {
        let rows = self.validate_features(features)?;
        if !features.is_empty() && rows != batch_len {
            return Err(FeatureError::Tensor(TensorError::DataLength {
                expected: batch_len,
                got: rows,
            }));
        }
        let mut out = vec![0.0f32; batch_len];
        for (feature, weight) in features.iter().zip(self.weights.iter()) {
            let dots = feature.matvec(weight)?;
            for (acc, dot) in out.iter_mut().zip(dots.iter()) {
                *acc -= dot;
            }
        }
        Ok(out)
    }

    /// One stochastic-approximation step on the dual weights.
    ///
    /// The per-group batch mean of the deviation is the gradient estimate;
    /// the caller-supplied step size contributes only its magnitude.
    /// Weights rise where the observed statistic exceeds the reference and
    /// fall where it is below, then every coordinate is clipped into the
    /// stability box.
    pub fn update_weights(
        &mut self,
        features: &[Tensor],
        step_size: f32,
    ) -> FeatureResult<()> {
        if !step_size.is_finite() {
            return Err(FeatureError::InvalidArgument {
                feature: "weight_update",
                name: "step_size",
                reason: format!("must be finite, got {step_size}"),
            });
        }
        self.validate_features(features)?;
        let gradients: Vec<Vec<f32>> = features.iter().map(Tensor::mean_axis0).collect();
        let learning_rate = step_size.abs();
        self.state
            .apply(&self.rule, &mut self.weights, &gradients, learning_rate);
        self.avg_weight.push(&self.weights)?;
        debug!(
            target: "tilt::update",
            feature = %self.name,
            learning_rate,
            weight_norm = self.weight_norm(),
            "weight step"
        );
        Ok(())
    }

    /// Clears weights, rule buffers, running statistics, and callback
    /// state. Observable state afterwards matches a freshly constructed
    /// core.
    pub fn reset(&mut self) {
        for group in self.weights.iter_mut() {
            group.iter_mut().for_each(|w| *w = 0.0);
        }
        self.state.reset();
        self.avg_feature.reset();
        self.avg_weight.reset();
        for callback in self.callbacks.iter_mut() {
            callback.reset();
        }
    }
}

/// One named statistic engine: computes per-sample feature deviations,
/// owns the dual weights enforcing its moment constraint, and reports
/// diagnostics on every call.
///
/// The provided methods define an ordering contract: on every call,
/// `extract` computes the raw statistic, centers it, updates the running
/// feature average, and only then builds the snapshot and dispatches
/// callbacks.
pub trait FeatureExtractor {
    /// Shared state owned by the extractor.
    fn core(&self) -> &FeatureCore;

    /// Mutable access to the shared state.
    fn core_mut(&mut self) -> &mut FeatureCore;

    /// Computes the raw per-sample statistic, one tensor per group.
    fn raw_statistic(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector>;

    /// Builds the diagnostic snapshot for one extraction call.
    fn describe(
        &self,
        batch: &Tensor,
        latent: Option<&Tensor>,
        features: &[Tensor],
    ) -> FeatureResult<Snapshot> {
        self.core().default_snapshot(batch, latent, features)
    }

    /// Extractor name.
    fn name(&self) -> String {
        self.core().name().to_string()
    }

    /// Number of feature groups produced per call.
    fn num_groups(&self) -> usize {
        self.core().num_groups()
    }

    /// Width of every group, in order.
    fn group_widths(&self) -> Vec<usize> {
        self.core().group_widths()
    }

    /// Current per-group dual weights.
    fn weights(&self) -> Vec<Vec<f32>> {
        self.core().weights().to_vec()
    }

    /// Computes the per-sample feature deviation for a batch, with full
    /// bookkeeping (running averages, snapshot, callbacks).
    fn extract(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector> {
        self.extract_with_latent(batch, None)
    }

    /// [`FeatureExtractor::extract`] with the driving latent codes made
    /// available to diagnostics.
    fn extract_with_latent(
        &mut self,
        batch: &Tensor,
        latent: Option<&Tensor>,
    ) -> FeatureResult<FeatureVector> {
        let mut features = self.raw_statistic(batch)?;
        self.core().validate_features(&features)?;
        self.core().center(&mut features)?;
        self.core_mut().track_features(&features)?;
        let snapshot = self.describe(batch, latent, &features)?;
        self.core_mut().dispatch(&snapshot);
        Ok(features)
    }

    /// Tilting contribution per sample for a previously extracted feature
    /// vector.
    fn log_density_term(
        &self,
        batch_len: usize,
        features: &[Tensor],
    ) -> FeatureResult<Vec<f32>> {
        self.core().log_density_term(batch_len, features)
    }

    /// One stochastic-approximation step on the dual weights.
    fn update_weights(&mut self, features: &[Tensor], step_size: f32) -> FeatureResult<()> {
        self.core_mut().update_weights(features, step_size)
    }

    /// Restores the extractor to its freshly constructed state.
    fn reset(&mut self) {
        self.core_mut().reset();
    }
}

impl std::fmt::Debug for dyn FeatureExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureExtractor")
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::WEIGHT_CLIP;

    struct Offset {
        core: FeatureCore,
        offset: f32,
    }

    impl Offset {
        fn new(offset: f32, reference: f32) -> Self {
            let core = FeatureCore::new(
                "offset",
                ReferenceMode::Referenced,
                vec![Tensor::from_row(&[reference]).unwrap()],
            )
            .unwrap();
            Self { core, offset }
        }
    }

    impl FeatureExtractor for Offset {
        fn core(&self) -> &FeatureCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut FeatureCore {
            &mut self.core
        }

        fn raw_statistic(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector> {
            Ok(vec![Tensor::from_fn(batch.rows(), 1, |_, _| self.offset)?])
        }
    }

    #[test]
    fn extract_centers_against_reference() {
        let mut feature = Offset::new(0.7, 0.5);
        let batch = Tensor::zeros(4, 2).unwrap();
        let out = feature.extract(&batch).unwrap();
        assert_eq!(out.len(), 1);
        for &v in out[0].data() {
            assert!((v - 0.2).abs() < 1e-6);
        }
        assert_eq!(feature.core().avg_feature().count(), 1);
        assert!((feature.core().avg_feature().value()[0][0] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn weights_move_toward_excess_statistic() {
        let mut feature = Offset::new(0.7, 0.5);
        let batch = Tensor::zeros(4, 2).unwrap();
        let out = feature.extract(&batch).unwrap();
        feature.update_weights(&out, 0.1).unwrap();
        // Observed statistic above reference: the weight must increase so
        // the tilt penalizes future excess.
        assert!(feature.core().weights()[0][0] > 0.0);
        let tilt = feature.log_density_term(4, &out).unwrap();
        assert!(tilt.iter().all(|&v| v < 0.0));
    }

    #[test]
    fn step_direction_comes_from_data_not_sign() {
        let mut a = Offset::new(0.7, 0.5);
        let mut b = Offset::new(0.7, 0.5);
        let batch = Tensor::zeros(2, 1).unwrap();
        let fa = a.extract(&batch).unwrap();
        let fb = b.extract(&batch).unwrap();
        a.update_weights(&fa, 0.1).unwrap();
        b.update_weights(&fb, -0.1).unwrap();
        assert_eq!(a.core().weights(), b.core().weights());
    }

    #[test]
    fn update_clips_into_stability_box() {
        let mut feature = Offset::new(1e9, 0.0);
        let batch = Tensor::zeros(2, 1).unwrap();
        let out = feature.extract(&batch).unwrap();
        feature.update_weights(&out, 1e3).unwrap();
        assert_eq!(feature.core().weights()[0][0], WEIGHT_CLIP);
    }

    #[test]
    fn reset_restores_fresh_state() {
        let mut feature = Offset::new(0.7, 0.5);
        let batch = Tensor::zeros(2, 1).unwrap();
        let out = feature.extract(&batch).unwrap();
        feature.update_weights(&out, 0.5).unwrap();
        feature.reset();

        let fresh = Offset::new(0.7, 0.5);
        assert_eq!(feature.core().weights(), fresh.core().weights());
        assert_eq!(feature.core().avg_feature(), fresh.core().avg_feature());
        assert_eq!(feature.core().avg_weight(), fresh.core().avg_weight());
    }

    #[test]
    fn snapshot_reports_weight_norm_to_late_callbacks() {
        use crate::callback::SnapshotSink;
        use std::cell::RefCell;
        use std::rc::Rc;

        struct Shared(Rc<RefCell<SnapshotSink>>);
        impl Callback for Shared {
            fn invoke(&mut self, snapshot: &Snapshot) {
                self.0.borrow_mut().invoke(snapshot);
            }
            fn reset(&mut self) {
                self.0.borrow_mut().reset();
            }
        }

        let sink = Rc::new(RefCell::new(SnapshotSink::new()));
        let mut feature = Offset::new(0.7, 0.5);
        feature
            .core_mut()
            .push_callback(Box::new(Shared(sink.clone())));

        let batch = Tensor::zeros(2, 1).unwrap();
        let out = feature.extract(&batch).unwrap();
        assert_eq!(
            sink.borrow().last().unwrap().scalar("offset.weight_norm"),
            Some(0.0)
        );

        feature.update_weights(&out, 0.1).unwrap();
        let _ = feature.extract(&batch).unwrap();
        let observed = sink
            .borrow()
            .last()
            .unwrap()
            .scalar("offset.weight_norm")
            .unwrap();
        assert!(observed > 0.0);
    }

    #[test]
    fn rejects_non_finite_step() {
        let mut feature = Offset::new(0.7, 0.5);
        let batch = Tensor::zeros(2, 1).unwrap();
        let out = feature.extract(&batch).unwrap();
        assert!(feature.update_weights(&out, f32::NAN).is_err());
    }

    #[test]
    fn shape_violations_fail_loudly() {
        let feature = Offset::new(0.7, 0.5);
        let wrong = vec![Tensor::zeros(2, 3).unwrap()];
        assert!(feature.core().validate_features(&wrong).is_err());
        assert!(feature.log_density_term(2, &wrong).is_err());
    }
}
