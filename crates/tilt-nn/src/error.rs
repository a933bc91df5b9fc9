// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::path::PathBuf;
use thiserror::Error;
use tilt_tensor::TensorError;

/// Result alias used throughout the feature engine.
pub type FeatureResult<T> = Result<T, FeatureError>;

/// Errors raised by feature construction, extraction, and statistics IO.
///
/// Configuration and resource problems surface at construction time; the
/// extraction path only propagates numeric shape violations.
#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("feature '{name}' is not present in the registry")]
    UnknownFeature { name: String },
    #[error("callback '{name}' is not present in the registry")]
    UnknownCallback { name: String },
    #[error("feature '{feature}' does not support version tag '{version}'")]
    UnsupportedVersion {
        feature: &'static str,
        version: String,
    },
    #[error("feature '{feature}' requires argument '{name}'")]
    MissingArgument {
        feature: &'static str,
        name: &'static str,
    },
    #[error("invalid argument '{name}' for feature '{feature}': {reason}")]
    InvalidArgument {
        feature: &'static str,
        name: &'static str,
        reason: String,
    },
    #[error("feature '{feature}' requires a {collaborator} in the assembly context")]
    MissingCollaborator {
        feature: &'static str,
        collaborator: &'static str,
    },
    #[error("statistics file not found: {path}")]
    StatsNotFound { path: PathBuf },
    #[error("archive '{archive}' is missing entry '{name}'")]
    MissingEntry { archive: String, name: String },
    #[error("layer index {layer} is out of range for a discriminator with {layers} layers")]
    LayerOutOfRange { layer: usize, layers: usize },
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("i/o failure while handling statistics: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failure while handling statistics: {message}")]
    Serialization { message: String },
}

impl FeatureError {
    /// Wraps an arbitrary serde error into the serialization variant.
    pub fn serialization(err: impl ToString) -> Self {
        FeatureError::Serialization {
            message: err.to_string(),
        }
    }
}
