// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Deterministic runtime configuration for components that draw random
/// numbers (the MMD batch pairing).
#[derive(Clone, Debug)]
pub struct DeterminismConfig {
    /// Whether deterministic execution is enabled globally.
    pub enabled: bool,
    /// Base seed used to derive per-component seeds.
    pub base_seed: u64,
}

impl DeterminismConfig {
    fn from_env() -> Self {
        let enabled = std::env::var("TILT_DETERMINISTIC")
            .ok()
            .map(|v| !matches!(v.as_str(), "0" | "false" | "False" | "off" | "OFF"))
            .unwrap_or(false);

        let base_seed = std::env::var("TILT_DETERMINISTIC_SEED")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(42);

        Self { enabled, base_seed }
    }

    /// Derives a deterministic seed for a given component label.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.base_seed.hash(&mut hasher);
        label.hash(&mut hasher);
        hasher.finish()
    }
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Returns the lazily initialised deterministic configuration.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

/// Overrides the deterministic configuration. First caller wins; intended
/// for tests and embedding hosts.
pub fn configure(cfg: DeterminismConfig) -> &'static DeterminismConfig {
    CONFIG.get_or_init(|| cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_seeds_are_stable_and_label_dependent() {
        let cfg = DeterminismConfig {
            enabled: true,
            base_seed: 42,
        };
        assert_eq!(cfg.seed_for("cluster"), cfg.seed_for("cluster"));
        assert_ne!(cfg.seed_for("cluster"), cfg.seed_for("pairing"));
    }

    #[test]
    fn base_seed_changes_derived_seeds() {
        let a = DeterminismConfig {
            enabled: true,
            base_seed: 1,
        };
        let b = DeterminismConfig {
            enabled: true,
            base_seed: 2,
        };
        assert_ne!(a.seed_for("cluster"), b.seed_for("cluster"));
    }
}
