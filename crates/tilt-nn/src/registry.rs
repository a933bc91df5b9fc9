// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Explicit name→constructor tables for features and callbacks.
//!
//! Both registries are plain values built at process start with
//! [`FeatureRegistry::builtin`] / [`CallbackRegistry::builtin`] and threaded
//! through whatever assembles the feature graph from configuration. There
//! is no import-time registration and no runtime reflection: the builtin
//! tables enumerate every concrete variant.

use crate::callback::{Callback, HistoryCallback, SnapshotSink, TraceCallback};
use crate::determinism;
use crate::error::{FeatureError, FeatureResult};
use crate::extractor::{FeatureExtractor, SampleTransform};
use crate::features::{
    ActivationFeature, ClusterFeature, ClusterVersion, CompositeFeature, EmbeddingMeanFeature,
    IdentityFeature, KernelPcaFeature, NoOpFeature, PcaFeature, ScoreFeature,
    ScoreGradientFeature, ScoreKlFeature,
};
use crate::io::StatsArchive;
use crate::models::{Discriminator, EmbeddingNet};
use crate::update::UpdateRule;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tilt_tensor::Tensor;
use tracing::debug;

/// Keyword arguments of one constructor call, straight out of the loaded
/// configuration.
pub type Params = serde_json::Map<String, Value>;

/// Shared collaborators threaded into every feature constructor.
#[derive(Clone, Default)]
pub struct FeatureContext {
    /// Pretrained critic consumed by the score/activation/cluster-v3
    /// variants.
    pub discriminator: Option<Arc<dyn Discriminator>>,
    /// Frozen embedding network for the distributional variants.
    pub embedding: Option<Arc<dyn EmbeddingNet>>,
    /// Display-range transform propagated into extractor diagnostics.
    pub inverse_transform: Option<SampleTransform>,
    /// Explicit RNG seed; falls back to the determinism config when unset.
    pub seed: Option<u64>,
}

impl FeatureContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the discriminator collaborator.
    pub fn with_discriminator(mut self, dis: Arc<dyn Discriminator>) -> Self {
        self.discriminator = Some(dis);
        self
    }

    /// Installs the embedding collaborator.
    pub fn with_embedding(mut self, embed: Arc<dyn EmbeddingNet>) -> Self {
        self.embedding = Some(embed);
        self
    }

    /// Installs the display-range transform.
    pub fn with_inverse_transform(mut self, transform: SampleTransform) -> Self {
        self.inverse_transform = Some(transform);
        self
    }

    /// Fixes the RNG seed for stochastic statistics.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn discriminator(&self, feature: &'static str) -> FeatureResult<Arc<dyn Discriminator>> {
        self.discriminator
            .clone()
            .ok_or(FeatureError::MissingCollaborator {
                feature,
                collaborator: "discriminator",
            })
    }

    fn embedding(&self, feature: &'static str) -> FeatureResult<Arc<dyn EmbeddingNet>> {
        self.embedding
            .clone()
            .ok_or(FeatureError::MissingCollaborator {
                feature,
                collaborator: "embedding network",
            })
    }

    fn resolve_seed(&self, label: &str) -> Option<u64> {
        if self.seed.is_some() {
            return self.seed;
        }
        let cfg = determinism::config();
        cfg.enabled.then(|| cfg.seed_for(label))
    }
}

fn invalid(feature: &'static str, name: &'static str, reason: impl ToString) -> FeatureError {
    FeatureError::InvalidArgument {
        feature,
        name,
        reason: reason.to_string(),
    }
}

fn opt_str<'p>(
    feature: &'static str,
    params: &'p Params,
    name: &'static str,
) -> FeatureResult<Option<&'p str>> {
    match params.get(name) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(invalid(feature, name, format!("expected a string, got {other}"))),
    }
}

fn opt_f32(feature: &'static str, params: &Params, name: &'static str) -> FeatureResult<Option<f32>> {
    match params.get(name) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(|v| Some(v as f32))
            .ok_or_else(|| invalid(feature, name, "expected a finite number")),
        Some(other) => Err(invalid(feature, name, format!("expected a number, got {other}"))),
    }
}

fn opt_u64(feature: &'static str, params: &Params, name: &'static str) -> FeatureResult<Option<u64>> {
    match params.get(name) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(feature, name, "expected a non-negative integer")),
        Some(other) => Err(invalid(feature, name, format!("expected an integer, got {other}"))),
    }
}

fn require_usize(feature: &'static str, params: &Params, name: &'static str) -> FeatureResult<usize> {
    opt_u64(feature, params, name)?
        .map(|v| v as usize)
        .ok_or(FeatureError::MissingArgument { feature, name })
}

fn opt_bool(feature: &'static str, params: &Params, name: &'static str) -> FeatureResult<bool> {
    match params.get(name) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(invalid(feature, name, format!("expected a boolean, got {other}"))),
    }
}

fn require_archive(
    feature: &'static str,
    params: &Params,
    name: &'static str,
) -> FeatureResult<StatsArchive> {
    let path = opt_str(feature, params, name)?
        .ok_or(FeatureError::MissingArgument { feature, name })?;
    StatsArchive::load(path)
}

/// Reads the optional reference: either `ref_path` pointing at an archive
/// with a `ref` row, or the scalar shorthand `ref_score` for width-one
/// groups.
fn optional_reference(
    feature: &'static str,
    params: &Params,
    width: usize,
) -> FeatureResult<Option<Tensor>> {
    if let Some(path) = opt_str(feature, params, "ref_path")? {
        let archive = StatsArchive::load(path)?;
        return Ok(Some(archive.require("ref")?.clone()));
    }
    if let Some(score) = opt_f32(feature, params, "ref_score")? {
        if width != 1 {
            return Err(invalid(
                feature,
                "ref_score",
                format!("scalar shorthand only fits width-1 groups, this one is {width}"),
            ));
        }
        return Ok(Some(Tensor::from_row(&[score])?));
    }
    Ok(None)
}

/// Constructor signature stored in the feature table. The registry itself
/// is passed through so composite configurations can recurse.
pub type FeatureCtor =
    fn(&FeatureRegistry, &FeatureContext, &Params) -> FeatureResult<Box<dyn FeatureExtractor>>;

/// Name→constructor table for feature extractors.
pub struct FeatureRegistry {
    table: BTreeMap<String, FeatureCtor>,
}

impl core::fmt::Debug for FeatureRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FeatureRegistry")
            .field("features", &self.names())
            .finish()
    }
}

impl FeatureRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            table: BTreeMap::new(),
        }
    }

    /// Builds the table holding every builtin extractor.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("identity", ctor_identity);
        registry.register("score", ctor_score);
        registry.register("score_gradient", ctor_score_gradient);
        registry.register("score_kl", ctor_score_kl);
        registry.register("activation", ctor_activation);
        registry.register("cluster", ctor_cluster);
        registry.register("pca", ctor_pca);
        registry.register("kernel_pca", ctor_kernel_pca);
        registry.register("embedding_mean", ctor_embedding_mean);
        registry.register("composite", ctor_composite);
        registry.register("noop", ctor_noop);
        registry
    }

    /// Registers (or replaces) a constructor under `name`.
    pub fn register(&mut self, name: impl Into<String>, ctor: FeatureCtor) {
        self.table.insert(name.into(), ctor);
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.table.keys().map(String::as_str).collect()
    }

    /// Returns `true` when `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    /// Instantiates a feature by name, then applies the shared keyword
    /// arguments: the `rule` update-rule object and the context's inverse
    /// transform.
    pub fn create(
        &self,
        name: &str,
        ctx: &FeatureContext,
        params: &Params,
    ) -> FeatureResult<Box<dyn FeatureExtractor>> {
        let ctor = self
            .table
            .get(name)
            .ok_or_else(|| FeatureError::UnknownFeature {
                name: name.to_string(),
            })?;
        let mut feature = ctor(self, ctx, params)?;
        if let Some(value) = params.get("rule") {
            let rule: UpdateRule = serde_json::from_value(value.clone())
                .map_err(|err| invalid("registry", "rule", err))?;
            feature.core_mut().set_rule(rule)?;
        }
        if let Some(transform) = &ctx.inverse_transform {
            feature.core_mut().set_inverse_transform(transform.clone());
        }
        debug!(target: "tilt::registry", feature = name, groups = feature.num_groups(), "created feature");
        Ok(feature)
    }
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn ctor_identity(
    _registry: &FeatureRegistry,
    _ctx: &FeatureContext,
    params: &Params,
) -> FeatureResult<Box<dyn FeatureExtractor>> {
    let dim = require_usize("identity", params, "dim")?;
    let reference = optional_reference("identity", params, dim)?;
    Ok(Box::new(IdentityFeature::new(dim, reference)?))
}

fn ctor_score(
    _registry: &FeatureRegistry,
    ctx: &FeatureContext,
    params: &Params,
) -> FeatureResult<Box<dyn FeatureExtractor>> {
    let dis = ctx.discriminator("score")?;
    let reference = optional_reference("score", params, 1)?;
    Ok(Box::new(ScoreFeature::new(dis, reference)?))
}

fn ctor_score_gradient(
    _registry: &FeatureRegistry,
    ctx: &FeatureContext,
    params: &Params,
) -> FeatureResult<Box<dyn FeatureExtractor>> {
    let dis = ctx.discriminator("score_gradient")?;
    let dim = require_usize("score_gradient", params, "dim")?;
    let reference = optional_reference("score_gradient", params, dim)?;
    Ok(Box::new(ScoreGradientFeature::new(dis, dim, reference)?))
}

fn ctor_score_kl(
    _registry: &FeatureRegistry,
    ctx: &FeatureContext,
    params: &Params,
) -> FeatureResult<Box<dyn FeatureExtractor>> {
    let dis = ctx.discriminator("score_kl")?;
    let ref_score = opt_f32("score_kl", params, "ref_score")?;
    Ok(Box::new(ScoreKlFeature::new(dis, ref_score)?))
}

fn ctor_activation(
    _registry: &FeatureRegistry,
    ctx: &FeatureContext,
    params: &Params,
) -> FeatureResult<Box<dyn FeatureExtractor>> {
    let dis = ctx.discriminator("activation")?;
    let layer = require_usize("activation", params, "layer")?;
    let widths = dis.layer_widths();
    let width = widths
        .get(layer)
        .copied()
        .ok_or(FeatureError::LayerOutOfRange {
            layer,
            layers: widths.len(),
        })?;
    let reference = optional_reference("activation", params, width)?;
    Ok(Box::new(ActivationFeature::new(dis, layer, reference)?))
}

fn ctor_cluster(
    _registry: &FeatureRegistry,
    ctx: &FeatureContext,
    params: &Params,
) -> FeatureResult<Box<dyn FeatureExtractor>> {
    let archive = require_archive("cluster", params, "stats_path")?;
    let version = ClusterVersion::parse(opt_str("cluster", params, "version")?.unwrap_or("0"))?;
    let clusters = archive.require("centroids")?.rows();
    let reference = optional_reference("cluster", params, clusters)?;
    let seed = opt_u64("cluster", params, "seed")?.or_else(|| ctx.resolve_seed("cluster"));
    let mut feature = if version == ClusterVersion::V3 {
        let dis = ctx.discriminator("cluster")?;
        let layer = require_usize("cluster", params, "layer")?;
        ClusterFeature::in_discriminator_space(&archive, dis, layer, reference, seed)?
    } else {
        ClusterFeature::new(&archive, version, reference, seed)?
    };
    if opt_bool("cluster", params, "use_embedding")? {
        feature.set_embedding(ctx.embedding("cluster")?);
    }
    Ok(Box::new(feature))
}

fn ctor_pca(
    _registry: &FeatureRegistry,
    _ctx: &FeatureContext,
    params: &Params,
) -> FeatureResult<Box<dyn FeatureExtractor>> {
    let archive = require_archive("pca", params, "stats_path")?;
    let width = archive.require("components")?.rows();
    let reference = optional_reference("pca", params, width)?;
    Ok(Box::new(PcaFeature::new(&archive, reference)?))
}

fn ctor_kernel_pca(
    _registry: &FeatureRegistry,
    _ctx: &FeatureContext,
    params: &Params,
) -> FeatureResult<Box<dyn FeatureExtractor>> {
    let archive = require_archive("kernel_pca", params, "stats_path")?;
    let width = archive.require("scaled_alphas")?.cols();
    let reference = optional_reference("kernel_pca", params, width)?;
    Ok(Box::new(KernelPcaFeature::new(&archive, reference)?))
}

fn ctor_embedding_mean(
    _registry: &FeatureRegistry,
    ctx: &FeatureContext,
    params: &Params,
) -> FeatureResult<Box<dyn FeatureExtractor>> {
    let embed = ctx.embedding("embedding_mean")?;
    let archive = require_archive("embedding_mean", params, "stats_path")?;
    Ok(Box::new(EmbeddingMeanFeature::new(embed, &archive)?))
}

fn ctor_composite(
    registry: &FeatureRegistry,
    ctx: &FeatureContext,
    params: &Params,
) -> FeatureResult<Box<dyn FeatureExtractor>> {
    let Some(Value::Array(entries)) = params.get("features") else {
        return Err(FeatureError::MissingArgument {
            feature: "composite",
            name: "features",
        });
    };
    let mut subs = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(config) = entry.as_object() else {
            return Err(invalid(
                "composite",
                "features",
                "every entry must be an object with 'name' and optional 'params'",
            ));
        };
        let name = config
            .get("name")
            .and_then(Value::as_str)
            .ok_or(FeatureError::MissingArgument {
                feature: "composite",
                name: "features[].name",
            })?;
        let empty = Params::new();
        let sub_params = match config.get("params") {
            None => &empty,
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(invalid(
                    "composite",
                    "features[].params",
                    format!("expected an object, got {other}"),
                ))
            }
        };
        subs.push(registry.create(name, ctx, sub_params)?);
    }
    Ok(Box::new(CompositeFeature::new(subs)?))
}

fn ctor_noop(
    _registry: &FeatureRegistry,
    _ctx: &FeatureContext,
    _params: &Params,
) -> FeatureResult<Box<dyn FeatureExtractor>> {
    Ok(Box::new(NoOpFeature::new()))
}

/// Constructor signature stored in the callback table.
pub type CallbackCtor = fn(&Params) -> FeatureResult<Box<dyn Callback>>;

/// Name→constructor table for callbacks.
pub struct CallbackRegistry {
    table: BTreeMap<String, CallbackCtor>,
}

impl core::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("callbacks", &self.names())
            .finish()
    }
}

impl CallbackRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            table: BTreeMap::new(),
        }
    }

    /// Builds the table holding every builtin callback.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("trace", ctor_trace);
        registry.register("history", ctor_history);
        registry.register("sink", ctor_sink);
        registry
    }

    /// Registers (or replaces) a constructor under `name`.
    pub fn register(&mut self, name: impl Into<String>, ctor: CallbackCtor) {
        self.table.insert(name.into(), ctor);
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.table.keys().map(String::as_str).collect()
    }

    /// Instantiates a callback by name.
    pub fn create(&self, name: &str, params: &Params) -> FeatureResult<Box<dyn Callback>> {
        let ctor = self
            .table
            .get(name)
            .ok_or_else(|| FeatureError::UnknownCallback {
                name: name.to_string(),
            })?;
        ctor(params)
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn ctor_trace(params: &Params) -> FeatureResult<Box<dyn Callback>> {
    let period = opt_u64("trace", params, "period")?.unwrap_or(1);
    Ok(Box::new(TraceCallback::new(period)))
}

fn ctor_history(params: &Params) -> FeatureResult<Box<dyn Callback>> {
    let Some(Value::Array(raw)) = params.get("keys") else {
        return Err(FeatureError::MissingArgument {
            feature: "history",
            name: "keys",
        });
    };
    let mut keys = Vec::with_capacity(raw.len());
    for value in raw {
        match value.as_str() {
            Some(key) => keys.push(key.to_string()),
            None => {
                return Err(invalid("history", "keys", "every key must be a string"));
            }
        }
    }
    Ok(Box::new(HistoryCallback::new(keys)))
}

fn ctor_sink(_params: &Params) -> FeatureResult<Box<dyn Callback>> {
    Ok(Box::new(SnapshotSink::new()))
}
