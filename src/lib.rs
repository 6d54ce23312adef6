//! Behavioral-profile and anomaly-scoring engine.
//!
//! Scores financial transactions against a model personalized to each
//! account's own history rather than a single global threshold. Each
//! account carries an evolving statistical fingerprint; every incoming
//! transaction becomes a fixed 10-dimensional feature vector relative to
//! that fingerprint and is scored by a versioned isolation-forest-style
//! ensemble. Profiles live behind a tiered cache/persistence layer with
//! write-behind durability.

pub mod config;
pub mod context;
pub mod error;
pub mod features;
pub mod metrics;
pub mod models;
pub mod store;
pub mod types;
pub mod velocity;

pub use config::EngineConfig;
pub use context::{ProfileSummary, ScoreOutcome, ScoringContext};
pub use error::{EngineError, EngineResult, ModelError, StoreError};
pub use features::{FeatureExtractor, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
pub use metrics::EngineMetrics;
pub use models::{ForestParams, Prediction, ScoringModel, Verdict};
pub use store::ProfileStore;
pub use types::{BehaviorProfile, FeatureEnrichment};
pub use velocity::VelocityCounter;
