// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::FeatureResult;
use crate::extractor::{FeatureCore, FeatureExtractor, FeatureVector, ReferenceMode};
use crate::snapshot::Snapshot;
use tilt_tensor::{l2_norm, Tensor};

/// Ordered aggregation of sub-extractors behind the single-extractor
/// interface.
///
/// `extract` concatenates the sub outputs in registration order; the weight
/// vector is the concatenation of sub-weights; `update_weights` routes each
/// group's deviation back to its owning sub-extractor by slice; the
/// diagnostic snapshot is the union of sub-snapshots.
pub struct CompositeFeature {
    core: FeatureCore,
    subs: Vec<Box<dyn FeatureExtractor>>,
}

impl core::fmt::Debug for CompositeFeature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompositeFeature")
            .field("core", &self.core)
            .field("subs", &self.subs.len())
            .finish()
    }
}

impl CompositeFeature {
    /// Aggregates the given sub-extractors. The composite core mirrors the
    /// concatenated sub references so shape validation and the composite
    /// feature average see the full group list.
    pub fn new(subs: Vec<Box<dyn FeatureExtractor>>) -> FeatureResult<Self> {
        let mut references = Vec::new();
        for sub in &subs {
            references.extend(sub.core().references().iter().cloned());
        }
        let core = FeatureCore::new("composite", ReferenceMode::Raw, references)?;
        Ok(Self { core, subs })
    }

    /// Number of aggregated sub-extractors.
    pub fn num_subs(&self) -> usize {
        self.subs.len()
    }

    /// Shared access to a sub-extractor.
    pub fn sub(&self, index: usize) -> Option<&dyn FeatureExtractor> {
        self.subs.get(index).map(|sub| sub.as_ref())
    }

    fn slice_ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges = Vec::with_capacity(self.subs.len());
        let mut start = 0;
        for sub in &self.subs {
            let end = start + sub.num_groups();
            ranges.push((start, end));
            start = end;
        }
        ranges
    }
}

impl FeatureExtractor for CompositeFeature {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeatureCore {
        &mut self.core
    }

    /// Concatenated, already-centered sub deviations without any
    /// bookkeeping. The provided `extract` path below is the one that keeps
    /// sub-extractor state in sync.
    fn raw_statistic(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector> {
        let mut features = Vec::new();
        for sub in &mut self.subs {
            let mut out = sub.raw_statistic(batch)?;
            sub.core().center(&mut out)?;
            features.extend(out);
        }
        Ok(features)
    }

    fn weights(&self) -> Vec<Vec<f32>> {
        self.subs.iter().flat_map(|sub| sub.weights()).collect()
    }

    fn extract_with_latent(
        &mut self,
        batch: &Tensor,
        latent: Option<&Tensor>,
    ) -> FeatureResult<FeatureVector> {
        let mut features = Vec::new();
        for sub in &mut self.subs {
            features.extend(sub.extract_with_latent(batch, latent)?);
        }
        self.core.validate_features(&features)?;
        self.core.track_features(&features)?;
        let snapshot = self.describe(batch, latent, &features)?;
        self.core.dispatch(&snapshot);
        Ok(features)
    }

    fn describe(
        &self,
        batch: &Tensor,
        latent: Option<&Tensor>,
        features: &[Tensor],
    ) -> FeatureResult<Snapshot> {
        let mut snapshot = Snapshot::new();
        for (sub, (start, end)) in self.subs.iter().zip(self.slice_ranges()) {
            snapshot.merge(&sub.describe(batch, latent, &features[start..end])?);
        }
        let flat: Vec<f32> = self.weights().into_iter().flatten().collect();
        snapshot.insert_scalar("composite.weight_norm", l2_norm(&flat));
        Ok(snapshot)
    }

    fn log_density_term(
        &self,
        batch_len: usize,
        features: &[Tensor],
    ) -> FeatureResult<Vec<f32>> {
        self.core.validate_features(features)?;
        let mut out = vec![0.0f32; batch_len];
        for (sub, (start, end)) in self.subs.iter().zip(self.slice_ranges()) {
            let partial = sub.log_density_term(batch_len, &features[start..end])?;
            for (acc, v) in out.iter_mut().zip(partial.iter()) {
                *acc += v;
            }
        }
        Ok(out)
    }

    fn update_weights(&mut self, features: &[Tensor], step_size: f32) -> FeatureResult<()> {
        self.core.validate_features(features)?;
        let ranges = self.slice_ranges();
        for (sub, (start, end)) in self.subs.iter_mut().zip(ranges) {
            sub.update_weights(&features[start..end], step_size)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        for sub in &mut self.subs {
            sub.reset();
        }
        self.core.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{Callback, SnapshotSink};
    use crate::features::identity::IdentityFeature;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Two-group extractor: the batch and its doubling.
    struct TwoGroup {
        core: FeatureCore,
    }

    impl TwoGroup {
        fn new(dim: usize) -> Self {
            let core = FeatureCore::new(
                "two_group",
                ReferenceMode::Referenced,
                vec![
                    Tensor::zeros(1, dim).unwrap(),
                    Tensor::zeros(1, dim).unwrap(),
                ],
            )
            .unwrap();
            Self { core }
        }
    }

    impl FeatureExtractor for TwoGroup {
        fn core(&self) -> &FeatureCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut FeatureCore {
            &mut self.core
        }

        fn raw_statistic(&mut self, batch: &Tensor) -> FeatureResult<FeatureVector> {
            Ok(vec![batch.clone(), batch.scale(2.0)])
        }
    }

    fn sample_batch() -> Tensor {
        Tensor::from_vec(2, 2, vec![1.0, -1.0, 0.5, 2.0]).unwrap()
    }

    fn build_composite() -> CompositeFeature {
        CompositeFeature::new(vec![
            Box::new(TwoGroup::new(2)),
            Box::new(IdentityFeature::new(2, None).unwrap()),
        ])
        .unwrap()
    }

    #[test]
    fn extract_concatenates_sub_outputs() {
        let mut composite = build_composite();
        let batch = sample_batch();
        let out = composite.extract(&batch).unwrap();
        assert_eq!(out.len(), 3);

        let mut a = TwoGroup::new(2);
        let mut b = IdentityFeature::new(2, None).unwrap();
        let expected_a = a.extract(&batch).unwrap();
        let expected_b = b.extract(&batch).unwrap();
        assert_eq!(out[0], expected_a[0]);
        assert_eq!(out[1], expected_a[1]);
        assert_eq!(out[2], expected_b[0]);
    }

    #[test]
    fn update_routes_each_slice_to_its_owner() {
        let batch = sample_batch();

        let mut composite = build_composite();
        let out = composite.extract(&batch).unwrap();
        composite.update_weights(&out, 0.25).unwrap();

        let mut a = TwoGroup::new(2);
        let mut b = IdentityFeature::new(2, None).unwrap();
        let fa = a.extract(&batch).unwrap();
        let fb = b.extract(&batch).unwrap();
        a.update_weights(&fa, 0.25).unwrap();
        b.update_weights(&fb, 0.25).unwrap();

        let mut expected = a.weights();
        expected.extend(b.weights());
        assert_eq!(composite.weights(), expected);
    }

    #[test]
    fn tilt_is_the_sum_of_sub_terms() {
        let batch = sample_batch();
        let mut composite = build_composite();
        let out = composite.extract(&batch).unwrap();
        composite.update_weights(&out, 0.5).unwrap();
        let combined = composite.log_density_term(2, &out).unwrap();

        let mut a = TwoGroup::new(2);
        let mut b = IdentityFeature::new(2, None).unwrap();
        let fa = a.extract(&batch).unwrap();
        let fb = b.extract(&batch).unwrap();
        a.update_weights(&fa, 0.5).unwrap();
        b.update_weights(&fb, 0.5).unwrap();
        let ta = a.log_density_term(2, &fa).unwrap();
        let tb = b.log_density_term(2, &fb).unwrap();
        for i in 0..2 {
            assert!((combined[i] - (ta[i] + tb[i])).abs() < 1e-6);
        }
    }

    #[test]
    fn snapshot_is_the_union_of_sub_snapshots() {
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
        let mut composite = build_composite();
        composite
            .core_mut()
            .push_callback(Box::new(Shared(sink.clone())));
        let _ = composite.extract(&sample_batch()).unwrap();
        let borrowed = sink.borrow();
        let snapshot = borrowed.last().unwrap();
        assert!(snapshot.scalar("two_group.weight_norm").is_some());
        assert!(snapshot.scalar("identity.weight_norm").is_some());
        assert!(snapshot.scalar("composite.weight_norm").is_some());
    }

    #[test]
    fn reset_propagates_to_subs() {
        let batch = sample_batch();
        let mut composite = build_composite();
        let out = composite.extract(&batch).unwrap();
        composite.update_weights(&out, 1.0).unwrap();
        composite.reset();
        assert!(composite
            .weights()
            .iter()
            .all(|group| group.iter().all(|&w| w == 0.0)));
        assert_eq!(composite.sub(0).unwrap().core().avg_feature().count(), 0);
    }

    #[test]
    fn empty_composite_behaves_like_noop() {
        let mut composite = CompositeFeature::new(Vec::new()).unwrap();
        let out = composite.extract(&sample_batch()).unwrap();
        assert!(out.is_empty());
        assert_eq!(
            composite.log_density_term(2, &out).unwrap(),
            vec![0.0, 0.0]
        );
    }
}
