//! Adaptive moment-matching feature engine for tilted sampling.
//!
//! The crate supplies the exponential-tilting potential consumed by an
//! external Markov-chain sampler: feature extractors compute per-sample
//! deviations from reference statistics, dual weights adapt online through
//! a stochastic-approximation rule, and every extraction call reports a
//! diagnostic snapshot to registered callbacks. Extractors compose through
//! [`features::CompositeFeature`] and assemble from configuration through
//! [`registry::FeatureRegistry`].

pub mod callback;
pub mod determinism;
pub mod error;
pub mod extractor;
pub mod features;
pub mod io;
pub mod models;
pub mod registry;
pub mod snapshot;
pub mod telemetry;
pub mod update;

pub use callback::{Callback, HistoryCallback, SnapshotSink, TraceCallback};
pub use error::{FeatureError, FeatureResult};
pub use extractor::{
    FeatureCore, FeatureExtractor, FeatureVector, ReferenceMode, SampleTransform,
};
pub use features::{
    ActivationFeature, ClusterFeature, ClusterVersion, CompositeFeature, EmbeddingMeanFeature,
    IdentityFeature, KernelPcaFeature, NoOpFeature, PcaFeature, ScoreFeature,
    ScoreGradientFeature, ScoreKlFeature,
};
pub use io::StatsArchive;
pub use models::{
    Discriminator, EmbeddingNet, Generator, LinearEmbedding, LinearGenerator, MlpDiscriminator,
};
pub use registry::{CallbackRegistry, FeatureContext, FeatureRegistry, Params};
pub use snapshot::{Snapshot, SnapshotValue};
pub use update::{UpdateRule, WEIGHT_CLIP};

pub use tilt_tensor::{l2_norm, PureResult, RunningMean, Tensor, TensorError};
