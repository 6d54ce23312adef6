//! Scheduled retraining driver.
//!
//! Periodically rebuilds the ensemble from caller-supplied training data
//! and promotes it only after validation. Where the training data comes
//! from is the caller's concern, behind [`TrainingDataSource`]; the driver
//! owns the train -> validate -> promote protocol and guarantees a failed
//! cycle never replaces the active model.

use crate::config::RetrainConfig;
use crate::features::FEATURE_COUNT;
use crate::models::forest::ForestParams;
use crate::models::scoring::ScoringModel;
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Boxed future returned by [`TrainingDataSource::fetch_matrix`].
pub type MatrixFuture<'a> =
    Pin<Box<dyn Future<Output = anyhow::Result<Vec<Vec<f64>>>> + Send + 'a>>;

/// Supplier of training matrices, shaped (n, 10) in canonical feature
/// order. Data sourcing and any synthetic augmentation live behind this
/// trait, outside the engine.
pub trait TrainingDataSource: Send + Sync {
    fn fetch_matrix(&self) -> MatrixFuture<'_>;
}

/// Outcome of one retrain cycle.
#[derive(Debug)]
pub enum RetrainOutcome {
    /// New model validated, promoted, and saved
    Completed {
        version: String,
        n_samples: usize,
        outlier_rate: f64,
    },
    /// Not enough data to retrain; active model untouched
    SkippedInsufficientData { found: usize, required: usize },
    /// Candidate trained but failed validation; active model untouched
    ValidationFailed { outlier_rate: f64 },
    /// Fetch or training error; active model untouched
    Failed(String),
}

/// Periodic retrain worker over a shared scoring model.
pub struct RetrainWorker {
    model: Arc<ScoringModel>,
    source: Arc<dyn TrainingDataSource>,
    config: RetrainConfig,
    artifact_path: PathBuf,
}

impl RetrainWorker {
    pub fn new(
        model: Arc<ScoringModel>,
        source: Arc<dyn TrainingDataSource>,
        config: RetrainConfig,
        artifact_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            model,
            source,
            config,
            artifact_path: artifact_path.into(),
        }
    }

    /// Run one fetch -> train -> validate -> promote cycle.
    ///
    /// The candidate is trained on a detached model instance and only
    /// promoted into the live model through the saved artifact, so the
    /// active model is never observable in a half-trained state and
    /// survives every failure path untouched.
    pub async fn run_cycle(&self) -> RetrainOutcome {
        info!("starting scheduled retrain");

        let matrix = match self.source.fetch_matrix().await {
            Ok(matrix) => matrix,
            Err(e) => {
                error!(error = %e, "training data fetch failed");
                return RetrainOutcome::Failed(e.to_string());
            }
        };

        if matrix.len() < self.config.min_samples {
            info!(
                found = matrix.len(),
                required = self.config.min_samples,
                "retrain skipped, insufficient data"
            );
            return RetrainOutcome::SkippedInsufficientData {
                found: matrix.len(),
                required: self.config.min_samples,
            };
        }

        let params = ForestParams {
            contamination: self.config.contamination,
            n_estimators: self.config.n_estimators,
            ..ForestParams::default()
        };

        let candidate = ScoringModel::new();
        let report = match candidate.train(&matrix, &params) {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "candidate training failed");
                return RetrainOutcome::Failed(e.to_string());
            }
        };

        if !self.validate(&candidate, &matrix, report.outlier_rate) {
            warn!(
                outlier_rate = report.outlier_rate,
                "retrain validation failed, keeping active model"
            );
            return RetrainOutcome::ValidationFailed {
                outlier_rate: report.outlier_rate,
            };
        }

        let version = format!("v{}_auto", Utc::now().format("%Y%m%d_%H%M%S"));
        if let Err(e) = candidate.set_version(&version) {
            return RetrainOutcome::Failed(e.to_string());
        }
        if let Err(e) = candidate.save(&self.artifact_path) {
            error!(error = %e, "candidate save failed, keeping active model");
            return RetrainOutcome::Failed(e.to_string());
        }
        if let Err(e) = self.model.load(&self.artifact_path, &version) {
            error!(error = %e, "promotion failed, keeping active model");
            return RetrainOutcome::Failed(e.to_string());
        }

        info!(
            version = %version,
            n_samples = report.n_samples,
            outlier_rate = report.outlier_rate,
            "scheduled retrain completed"
        );

        RetrainOutcome::Completed {
            version,
            n_samples: report.n_samples,
            outlier_rate: report.outlier_rate,
        }
    }

    /// Smoke-predict plus an outlier-rate sanity window around the
    /// configured contamination.
    fn validate(&self, candidate: &ScoringModel, matrix: &[Vec<f64>], outlier_rate: f64) -> bool {
        let probe = match matrix.first() {
            Some(row) if row.len() == FEATURE_COUNT => row,
            _ => return false,
        };
        if candidate.predict(probe).is_err() {
            return false;
        }

        let lower = self.config.contamination * 0.5;
        let upper = self.config.contamination * 3.0;
        outlier_rate >= lower && outlier_rate <= upper
    }

    /// Spawn the periodic retrain loop. The stop signal cancels promptly;
    /// no cycle is started after it fires.
    pub fn start(self) -> RetrainHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = Duration::from_secs(self.config.interval_hours * 3600);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        self.run_cycle().await;
                    }
                    _ = stop_rx.changed() => {
                        info!("retrain worker stopped");
                        break;
                    }
                }
            }
        });

        RetrainHandle {
            handle,
            stop: stop_tx,
        }
    }
}

/// Handle to the background retrain worker.
pub struct RetrainHandle {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl RetrainHandle {
    /// Signal the worker to stop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct FixedSource {
        matrix: Vec<Vec<f64>>,
    }

    impl TrainingDataSource for FixedSource {
        fn fetch_matrix(&self) -> MatrixFuture<'_> {
            let matrix = self.matrix.clone();
            Box::pin(async move { Ok(matrix) })
        }
    }

    fn varied_rows(n: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..FEATURE_COUNT).map(|_| rng.gen_range(0.0..1.0)).collect())
            .collect()
    }

    fn retrain_config(min_samples: usize) -> RetrainConfig {
        RetrainConfig {
            interval_hours: 24,
            min_samples,
            contamination: 0.05,
            n_estimators: 50,
        }
    }

    #[tokio::test]
    async fn test_cycle_promotes_validated_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let model = Arc::new(ScoringModel::new());
        let source = Arc::new(FixedSource {
            matrix: varied_rows(400, 9),
        });

        let worker = RetrainWorker::new(model.clone(), source, retrain_config(100), &path);
        let outcome = worker.run_cycle().await;

        assert!(matches!(outcome, RetrainOutcome::Completed { .. }));
        assert!(model.is_loaded());
        assert!(model.version().starts_with('v'));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_cycle_skips_on_insufficient_data() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScoringModel::new());
        let source = Arc::new(FixedSource {
            matrix: varied_rows(10, 1),
        });

        let worker = RetrainWorker::new(
            model.clone(),
            source,
            retrain_config(1000),
            dir.path().join("model.json"),
        );
        let outcome = worker.run_cycle().await;

        assert!(matches!(
            outcome,
            RetrainOutcome::SkippedInsufficientData { found: 10, required: 1000 }
        ));
        assert!(!model.is_loaded());
    }

    #[tokio::test]
    async fn test_validation_failure_keeps_active_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        // Establish an active model first.
        let model = Arc::new(ScoringModel::new());
        model
            .train(&varied_rows(300, 2), &ForestParams::default())
            .unwrap();
        model.set_version("v_active").unwrap();

        // Constant rows isolate nothing: detected outlier rate is 0,
        // outside the validation window.
        let source = Arc::new(FixedSource {
            matrix: vec![vec![0.5; FEATURE_COUNT]; 300],
        });
        let worker = RetrainWorker::new(model.clone(), source, retrain_config(100), &path);
        let outcome = worker.run_cycle().await;

        assert!(matches!(outcome, RetrainOutcome::ValidationFailed { .. }));
        assert_eq!(model.version(), "v_active");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_worker_stop_signal() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScoringModel::new());
        let source = Arc::new(FixedSource { matrix: Vec::new() });
        let worker = RetrainWorker::new(
            model,
            source,
            retrain_config(100),
            dir.path().join("model.json"),
        );

        let handle = worker.start();
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("worker stops promptly");
    }
}
