//! Outlier-scoring model: trainable ensemble, versioned holder, and the
//! scheduled retraining driver.

pub mod forest;
pub mod scoring;
pub mod trainer;

pub use forest::{ForestParams, IsolationForest};
pub use scoring::{FeatureContribution, Prediction, ScoringModel, TrainingReport, Verdict};
pub use trainer::{RetrainHandle, RetrainOutcome, RetrainWorker, TrainingDataSource};
