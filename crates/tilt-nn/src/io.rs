// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{FeatureError, FeatureResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tilt_tensor::Tensor;

/// Named numeric arrays loaded once at extractor construction: cluster
/// centroids, PCA components, reference means, discriminator weights.
///
/// Archives round-trip through JSON for inspection and bincode for compact
/// storage. The `label` travels into error messages so a missing entry
/// names the archive it was expected in.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsArchive {
    label: String,
    entries: BTreeMap<String, Tensor>,
}

impl StatsArchive {
    /// Creates an empty in-memory archive.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Human-readable origin of the archive.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of stored arrays.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no arrays are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores an array under `name`, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.entries.insert(name.into(), tensor);
    }

    /// Looks up an array.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.get(name)
    }

    /// Looks up an array, failing loudly when absent.
    pub fn require(&self, name: &str) -> FeatureResult<&Tensor> {
        self.entries
            .get(name)
            .ok_or_else(|| FeatureError::MissingEntry {
                archive: self.label.clone(),
                name: name.to_string(),
            })
    }

    /// Reads an entry that must be a single scalar.
    pub fn scalar(&self, name: &str) -> FeatureResult<f32> {
        let tensor = self.require(name)?;
        if tensor.shape() != (1, 1) {
            return Err(FeatureError::InvalidArgument {
                feature: "stats_archive",
                name: "entry",
                reason: format!(
                    "'{name}' must be a 1x1 scalar, got {:?}",
                    tensor.shape()
                ),
            });
        }
        Ok(tensor.data()[0])
    }

    /// Reads an entry that must be a single row or column, flattened.
    pub fn vector(&self, name: &str) -> FeatureResult<Vec<f32>> {
        let tensor = self.require(name)?;
        let (rows, cols) = tensor.shape();
        if rows != 1 && cols != 1 {
            return Err(FeatureError::InvalidArgument {
                feature: "stats_archive",
                name: "entry",
                reason: format!("'{name}' must be a vector, got {:?}", tensor.shape()),
            });
        }
        Ok(tensor.data().to_vec())
    }

    fn open(path: &Path) -> FeatureResult<File> {
        if !path.exists() {
            return Err(FeatureError::StatsNotFound {
                path: path.to_path_buf(),
            });
        }
        Ok(File::open(path)?)
    }

    /// Loads a JSON archive. A missing file is a `StatsNotFound` error, not
    /// an IO error, so construction sites can report it as a resource
    /// problem.
    pub fn load_json<P: AsRef<Path>>(path: P) -> FeatureResult<Self> {
        let file = Self::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let mut archive: StatsArchive =
            serde_json::from_reader(reader).map_err(FeatureError::serialization)?;
        archive.label = path.as_ref().display().to_string();
        Ok(archive)
    }

    /// Loads a bincode archive.
    pub fn load_bincode<P: AsRef<Path>>(path: P) -> FeatureResult<Self> {
        let file = Self::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let mut archive: StatsArchive =
            bincode::deserialize_from(reader).map_err(FeatureError::serialization)?;
        archive.label = path.as_ref().display().to_string();
        Ok(archive)
    }

    /// Loads an archive, choosing the codec from the file extension:
    /// `.json` is JSON, anything else bincode.
    pub fn load<P: AsRef<Path>>(path: P) -> FeatureResult<Self> {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("json") => Self::load_json(path),
            _ => Self::load_bincode(path),
        }
    }

    /// Writes the archive as pretty JSON.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> FeatureResult<()> {
        let file = File::create(path.as_ref())?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self).map_err(FeatureError::serialization)?;
        Ok(())
    }

    /// Writes the archive as bincode.
    pub fn save_bincode<P: AsRef<Path>>(&self, path: P) -> FeatureResult<()> {
        let file = File::create(path.as_ref())?;
        let writer = BufWriter::new(file);
        bincode::serialize_into(writer, self).map_err(FeatureError::serialization)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_archive() -> StatsArchive {
        let mut archive = StatsArchive::new("test");
        archive.insert(
            "centroids",
            Tensor::from_vec(2, 2, vec![0.0, 0.0, 10.0, 10.0]).unwrap(),
        );
        archive.insert("sigmas", Tensor::from_row(&[1.0, 1.0]).unwrap());
        archive.insert("gamma", Tensor::from_row(&[0.5]).unwrap());
        archive
    }

    #[test]
    fn json_roundtrip_preserves_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let archive = sample_archive();
        archive.save_json(&path).unwrap();
        let restored = StatsArchive::load_json(&path).unwrap();
        assert_eq!(restored.get("centroids"), archive.get("centroids"));
        assert_eq!(restored.vector("sigmas").unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn bincode_roundtrip_preserves_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.bin");
        let archive = sample_archive();
        archive.save_bincode(&path).unwrap();
        let restored = StatsArchive::load(&path).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.scalar("gamma").unwrap(), 0.5);
    }

    #[test]
    fn missing_file_is_a_resource_error() {
        let err = StatsArchive::load_json("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, FeatureError::StatsNotFound { .. }));
    }

    #[test]
    fn missing_entry_names_the_archive() {
        let archive = sample_archive();
        let err = archive.require("priors").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("test"));
        assert!(message.contains("priors"));
    }

    #[test]
    fn scalar_and_vector_guards() {
        let archive = sample_archive();
        assert!(archive.scalar("sigmas").is_err());
        assert!(archive.vector("centroids").is_err());
    }
}
