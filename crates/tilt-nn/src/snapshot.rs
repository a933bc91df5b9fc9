// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tilt_tensor::Tensor;

/// Concrete value carried by one snapshot entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SnapshotValue {
    /// Scalar summary.
    Scalar(f32),
    /// Flat vector, e.g. a latent code or a per-group mean.
    Vector(Vec<f32>),
    /// Full matrix payload, e.g. a batch of display-range samples.
    Matrix(Tensor),
}

/// Flat diagnostic mapping produced on every extraction call and handed to
/// every registered callback.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    entries: BTreeMap<String, SnapshotValue>,
}

impl Snapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a scalar entry.
    pub fn insert_scalar(&mut self, key: impl Into<String>, value: f32) {
        self.entries.insert(key.into(), SnapshotValue::Scalar(value));
    }

    /// Inserts a vector entry.
    pub fn insert_vector(&mut self, key: impl Into<String>, value: Vec<f32>) {
        self.entries.insert(key.into(), SnapshotValue::Vector(value));
    }

    /// Inserts a matrix entry.
    pub fn insert_matrix(&mut self, key: impl Into<String>, value: Tensor) {
        self.entries.insert(key.into(), SnapshotValue::Matrix(value));
    }

    /// Looks up an entry.
    pub fn get(&self, key: &str) -> Option<&SnapshotValue> {
        self.entries.get(key)
    }

    /// Looks up a scalar entry, ignoring other value kinds.
    pub fn scalar(&self, key: &str) -> Option<f32> {
        match self.entries.get(key) {
            Some(SnapshotValue::Scalar(v)) => Some(*v),
            _ => None,
        }
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &SnapshotValue)> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the snapshot carries no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folds every entry of `other` into `self`, overwriting on key
    /// collision. Sub-extractor snapshots are already name-prefixed, so the
    /// plain union is collision-free in practice.
    pub fn merge(&mut self, other: &Snapshot) {
        for (key, value) in other.entries.iter() {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    /// Folds every entry of `other` in under `prefix.key`.
    pub fn merge_prefixed(&mut self, prefix: &str, other: &Snapshot) {
        for (key, value) in other.entries.iter() {
            self.entries.insert(format!("{prefix}.{key}"), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_lookup_ignores_other_kinds() {
        let mut snap = Snapshot::new();
        snap.insert_scalar("a", 1.5);
        snap.insert_vector("b", vec![1.0, 2.0]);
        assert_eq!(snap.scalar("a"), Some(1.5));
        assert_eq!(snap.scalar("b"), None);
        assert_eq!(snap.scalar("missing"), None);
    }

    #[test]
    fn merge_prefixed_namespaces_keys() {
        let mut inner = Snapshot::new();
        inner.insert_scalar("weight_norm", 0.25);
        let mut outer = Snapshot::new();
        outer.merge_prefixed("score", &inner);
        assert_eq!(outer.scalar("score.weight_norm"), Some(0.25));
        assert_eq!(outer.len(), 1);
    }
}
