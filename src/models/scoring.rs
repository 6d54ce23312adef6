//! Versioned outlier-scoring model with a thread-safe swap protocol.
//!
//! One model version is active at a time behind a read/write lock:
//! `predict` takes the shared path, while `train`, `load`, and `save` take
//! the exclusive path, so no caller ever observes a half-swapped model.

use crate::error::ModelError;
use crate::features::{FEATURE_COUNT, FEATURE_NAMES};
use crate::models::forest::{ForestParams, IsolationForest};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Sigmoid slope for normalizing raw decision values into [0, 1].
const SCORE_SLOPE: f64 = 8.0;

/// Deviations below this threshold are not reported as contributors.
const CONTRIBUTION_CUTOFF: f64 = 0.3;

/// Contributors reported per verdict.
const TOP_CONTRIBUTORS: usize = 3;

/// Expected values of each feature for a normal transaction, in vector
/// order. Used only for explainability, not for scoring.
const EXPECTED_NORMAL: [f64; FEATURE_COUNT] =
    [4.0, 0.0, 0.5, 1.0, 0.15, 0.1, 0.15, 0.6, 0.0, 0.0];

/// Native classification from the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Prediction {
    Normal,
    Anomaly,
}

/// One feature's contribution to an anomalous verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureContribution {
    pub feature: String,
    pub value: f64,
    pub expected: f64,
    pub deviation: f64,
}

/// Scoring result for one feature vector.
///
/// `label` comes from the ensemble's native classification and `score`
/// from sigmoid-normalizing the raw decision value; the two are computed
/// independently and may disagree near the decision boundary. Callers
/// must treat them as separate facts.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    /// Normalized anomaly score: 0.0 (normal) to 1.0 (highly anomalous)
    pub score: f64,
    /// Native ensemble label
    pub label: Prediction,
    /// Raw decision value; positive = normal
    pub raw_score: f64,
    /// Version label of the model that produced this verdict
    pub model_version: String,
    /// Up to three features deviating most from expected-normal values
    pub top_contributors: Vec<FeatureContribution>,
}

/// Metadata returned by `train` for caller-side validation.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub n_samples: usize,
    pub n_features: usize,
    pub contamination: f64,
    pub n_estimators: usize,
    pub detected_outliers: usize,
    pub outlier_rate: f64,
}

struct ModelSlot {
    forest: Option<IsolationForest>,
    version: String,
}

/// Thread-safe holder of the active model version.
pub struct ScoringModel {
    slot: RwLock<ModelSlot>,
}

impl ScoringModel {
    /// Create an empty model holder; `predict` fails until a model is
    /// trained or loaded.
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(ModelSlot {
                forest: None,
                version: "none".to_string(),
            }),
        }
    }

    fn read_slot(&self) -> Result<RwLockReadGuard<'_, ModelSlot>, ModelError> {
        self.slot.read().map_err(|_| ModelError::LockPoisoned)
    }

    fn write_slot(&self) -> Result<RwLockWriteGuard<'_, ModelSlot>, ModelError> {
        self.slot.write().map_err(|_| ModelError::LockPoisoned)
    }

    /// Version label of the active model.
    pub fn version(&self) -> String {
        self.read_slot()
            .map(|slot| slot.version.clone())
            .unwrap_or_else(|_| "none".to_string())
    }

    /// Whether a model is currently active.
    pub fn is_loaded(&self) -> bool {
        self.read_slot().map(|slot| slot.forest.is_some()).unwrap_or(false)
    }

    /// Replace the active version label.
    pub fn set_version(&self, version: &str) -> Result<(), ModelError> {
        self.write_slot()?.version = version.to_string();
        Ok(())
    }

    /// Score one feature vector against the active model.
    ///
    /// Fails explicitly when no model is loaded or the vector length does
    /// not match the trained feature count; these are precondition errors,
    /// never degraded into a default score.
    pub fn predict(&self, features: &[f64]) -> Result<Verdict, ModelError> {
        let slot = self.read_slot()?;
        let forest = slot.forest.as_ref().ok_or(ModelError::NotLoaded)?;

        if features.len() != forest.n_features() {
            return Err(ModelError::FeatureCountMismatch {
                expected: forest.n_features(),
                actual: features.len(),
            });
        }

        let raw_score = forest.decision_function(features);
        let is_outlier = forest.is_outlier(features);

        // Negative raw score maps above 0.5; clip guards the exp tails.
        let score = (1.0 / (1.0 + (raw_score * SCORE_SLOPE).exp())).clamp(0.0, 1.0);

        let label = if is_outlier {
            Prediction::Anomaly
        } else {
            Prediction::Normal
        };

        // Contribution ranking only applies to the canonical vector shape.
        let top_contributors = if features.len() == FEATURE_COUNT {
            rank_contributions(features)
        } else {
            Vec::new()
        };

        let verdict = Verdict {
            score,
            label,
            raw_score,
            model_version: slot.version.clone(),
            top_contributors,
        };

        debug!(
            score = verdict.score,
            label = ?verdict.label,
            raw_score = verdict.raw_score,
            "prediction made"
        );

        Ok(verdict)
    }

    /// Train a new ensemble and atomically promote it to active.
    ///
    /// The forest is built outside the lock; a training failure leaves the
    /// previously active model untouched.
    pub fn train(
        &self,
        data: &[Vec<f64>],
        params: &ForestParams,
    ) -> Result<TrainingReport, ModelError> {
        if data.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        if data[0].len() != FEATURE_COUNT {
            return Err(ModelError::FeatureCountMismatch {
                expected: FEATURE_COUNT,
                actual: data[0].len(),
            });
        }

        info!(
            n_samples = data.len(),
            n_estimators = params.n_estimators,
            contamination = params.contamination,
            "training started"
        );

        let forest = IsolationForest::fit(data, params)?;

        let detected_outliers = data.iter().filter(|row| forest.is_outlier(row)).count();
        let outlier_rate = detected_outliers as f64 / data.len() as f64;

        self.write_slot()?.forest = Some(forest);

        info!(
            n_samples = data.len(),
            detected_outliers,
            outlier_rate = format!("{:.3}", outlier_rate),
            "training completed"
        );

        Ok(TrainingReport {
            n_samples: data.len(),
            n_features: FEATURE_COUNT,
            contamination: params.contamination,
            n_estimators: params.n_estimators,
            detected_outliers,
            outlier_rate,
        })
    }

    /// Serialize the active model to a path. The version label is tracked
    /// externally; the artifact is the opaque ensemble only.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelError> {
        let path = path.as_ref();
        let slot = self.write_slot()?;
        let forest = slot.forest.as_ref().ok_or(ModelError::NotLoaded)?;

        let data = serde_json::to_vec(forest)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, data)?;

        info!(path = %path.display(), version = %slot.version, "model saved");
        Ok(())
    }

    /// Load a model artifact, replacing the active model and version label.
    ///
    /// Any failure before the final swap leaves the previously active model
    /// untouched.
    pub fn load<P: AsRef<Path>>(&self, path: P, version: &str) -> Result<(), ModelError> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let forest: IsolationForest = serde_json::from_slice(&data)?;

        let mut slot = self.write_slot()?;
        slot.forest = Some(forest);
        slot.version = version.to_string();

        info!(path = %path.display(), version = %version, "model loaded");
        Ok(())
    }
}

impl Default for ScoringModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Directional deviation of each feature from its expected-normal value,
/// cut at 0.3, sorted descending, top three kept.
fn rank_contributions(features: &[f64]) -> Vec<FeatureContribution> {
    let mut contributions: Vec<FeatureContribution> = FEATURE_NAMES
        .iter()
        .enumerate()
        .filter_map(|(i, &name)| {
            let value = features[i];
            let expected = EXPECTED_NORMAL[i];
            let deviation = match name {
                // Only positive excess counts.
                "amount_zscore" | "velocity_ratio" => (value - expected).max(0.0),
                // Only deficits below expectation count.
                "merchant_familiarity" => (expected - value).max(0.0),
                _ => (value - expected).abs(),
            };
            if deviation > CONTRIBUTION_CUTOFF {
                Some(FeatureContribution {
                    feature: name.to_string(),
                    value: round3(value),
                    expected: round3(expected),
                    deviation: round3(deviation),
                })
            } else {
                None
            }
        })
        .collect();

    contributions.sort_by(|a, b| b.deviation.partial_cmp(&a.deviation).unwrap());
    contributions.truncate(TOP_CONTRIBUTORS);
    contributions
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Rows shaped like normal transactions in feature space.
    fn normal_rows(n: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                vec![
                    rng.gen_range(3.0..5.0),   // log_amount
                    rng.gen_range(-1.0..1.0),  // amount_zscore
                    rng.gen_range(0.1..0.9),   // amount_percentile
                    rng.gen_range(0.5..2.0),   // velocity_ratio
                    rng.gen_range(0.0..0.3),   // hour_deviation
                    rng.gen_range(0.0..0.2),   // day_deviation
                    rng.gen_range(0.0..0.3),   // time_since_last
                    rng.gen_range(0.3..1.0),   // merchant_familiarity
                    if rng.gen_bool(0.3) { 1.0 } else { 0.0 }, // is_new_identity
                    0.0,                       // global_amount_flag
                ]
            })
            .collect()
    }

    #[test]
    fn test_predict_requires_loaded_model() {
        let model = ScoringModel::new();
        let result = model.predict(&[0.0; FEATURE_COUNT]);
        assert!(matches!(result, Err(ModelError::NotLoaded)));
    }

    #[test]
    fn test_predict_rejects_wrong_shape() {
        let model = ScoringModel::new();
        model
            .train(&normal_rows(500, 1), &ForestParams::default())
            .unwrap();

        let result = model.predict(&[0.0; 7]);
        assert!(matches!(
            result,
            Err(ModelError::FeatureCountMismatch { expected: 10, actual: 7 })
        ));
    }

    #[test]
    fn test_train_rejects_wrong_column_count() {
        let model = ScoringModel::new();
        let bad: Vec<Vec<f64>> = vec![vec![0.0; 7]; 100];
        assert!(matches!(
            model.train(&bad, &ForestParams::default()),
            Err(ModelError::FeatureCountMismatch { expected: 10, actual: 7 })
        ));
        assert!(!model.is_loaded());
    }

    #[test]
    fn test_predict_deterministic() {
        let model = ScoringModel::new();
        model
            .train(&normal_rows(500, 2), &ForestParams::default())
            .unwrap();

        let features = [3.9, 0.2, 0.5, 1.0, 0.1, 0.1, 0.1, 0.7, 0.0, 0.0];
        let a = model.predict(&features).unwrap();
        let b = model.predict(&features).unwrap();
        assert_eq!(a.score, b.score);
        assert_eq!(a.label, b.label);
        assert_eq!(a.raw_score, b.raw_score);
    }

    #[test]
    fn test_score_in_unit_interval() {
        let model = ScoringModel::new();
        model
            .train(&normal_rows(500, 3), &ForestParams::default())
            .unwrap();

        let anomalous = [8.5, 7.0, 1.0, 9.0, 0.9, 0.8, 0.9, 0.0, 1.0, 1.0];
        let verdict = model.predict(&anomalous).unwrap();
        assert!((0.0..=1.0).contains(&verdict.score));
        assert!(verdict.score > 0.5, "clear outlier scores high");
        assert_eq!(verdict.label, Prediction::Anomaly);
    }

    #[test]
    fn test_contribution_ranking() {
        let features = [
            4.0, // log_amount at expectation
            6.0, // zscore: +6 excess
            0.5, // percentile at expectation
            0.9, // velocity below expectation: excess rule gives 0
            0.15, 0.1, 0.15, // time features at expectation
            0.0, // merchant_familiarity deficit 0.6
            0.0, 0.0,
        ];
        let contributions = rank_contributions(&features);

        assert_eq!(contributions.len(), 2);
        assert_eq!(contributions[0].feature, "amount_zscore");
        assert_eq!(contributions[0].deviation, 6.0);
        assert_eq!(contributions[1].feature, "merchant_familiarity");
        assert_eq!(contributions[1].deviation, 0.6);
    }

    #[test]
    fn test_contributions_capped_at_three() {
        let features = [9.0, 8.0, 1.0, 9.5, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0];
        let contributions = rank_contributions(&features);
        assert_eq!(contributions.len(), TOP_CONTRIBUTORS);
        // Sorted descending by deviation.
        assert!(contributions[0].deviation >= contributions[1].deviation);
        assert!(contributions[1].deviation >= contributions[2].deviation);
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let model = ScoringModel::new();
        model
            .train(&normal_rows(500, 4), &ForestParams::default())
            .unwrap();
        model.set_version("v_test").unwrap();
        model.save(&path).unwrap();

        let features = [3.9, 0.2, 0.5, 1.0, 0.1, 0.1, 0.1, 0.7, 0.0, 0.0];
        let before = model.predict(&features).unwrap();

        let restored = ScoringModel::new();
        restored.load(&path, "v_test").unwrap();
        let after = restored.predict(&features).unwrap();

        assert_eq!(before.score, after.score);
        assert_eq!(before.label, after.label);
        assert_eq!(after.model_version, "v_test");
    }

    #[test]
    fn test_failed_load_keeps_active_model() {
        let model = ScoringModel::new();
        model
            .train(&normal_rows(300, 5), &ForestParams::default())
            .unwrap();
        model.set_version("v_active").unwrap();

        let result = model.load("/nonexistent/model.json", "v_broken");
        assert!(result.is_err());
        assert!(model.is_loaded());
        assert_eq!(model.version(), "v_active");
    }
}
