//! Process-wide engine context.
//!
//! All components are constructed exactly once here and passed by
//! reference; there is no module-level mutable state. Dependency failures
//! at startup degrade the affected tier instead of failing construction,
//! so the scoring path stays available.

use crate::config::EngineConfig;
use crate::error::{EngineResult, StoreError};
use crate::features::{FeatureExtractor, FeatureVector};
use crate::metrics::EngineMetrics;
use crate::models::scoring::{ScoringModel, Verdict};
use crate::store::{FlushWorker, ProfileStore};
use crate::types::enrichment::FeatureEnrichment;
use crate::velocity::VelocityCounter;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Complete result of scoring one transaction.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreOutcome {
    pub verdict: Verdict,
    pub enrichment: FeatureEnrichment,
    pub features: FeatureVector,
}

/// Read-only profile snapshot for operators and debugging.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSummary {
    pub account_id: String,
    pub total_transactions: u64,
    pub is_mature: bool,
    pub avg_spend: f64,
    pub std_spend: f64,
    pub peak_hours: Vec<u32>,
    pub top_merchants: Vec<String>,
}

/// Owns every engine component for the lifetime of the process.
pub struct ScoringContext {
    store: Arc<ProfileStore>,
    velocity: Arc<VelocityCounter>,
    extractor: FeatureExtractor,
    model: Arc<ScoringModel>,
    metrics: Arc<EngineMetrics>,
    flush_worker: Mutex<Option<FlushWorker>>,
}

impl ScoringContext {
    /// Build the full engine: shared redis connection, durable pool,
    /// store, velocity counter, extractor, and model, then start the
    /// write-behind flush worker. Loads the model artifact if one exists
    /// at the configured path.
    pub async fn connect(config: EngineConfig) -> EngineResult<Self> {
        let op_timeout = Duration::from_millis(config.store.op_timeout_ms);
        let metrics = Arc::new(EngineMetrics::new());

        let redis = match redis::Client::open(config.store.redis_url.as_str()) {
            Ok(client) => {
                match tokio::time::timeout(op_timeout, ConnectionManager::new(client)).await {
                    Ok(Ok(manager)) => {
                        info!(url = %config.store.redis_url, "connected to fast cache tier");
                        Some(manager)
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "fast cache tier unreachable, degrading");
                        None
                    }
                    Err(_) => {
                        warn!("fast cache tier connection timed out, degrading");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "invalid redis url, fast cache tier disabled");
                None
            }
        };

        let store = Arc::new(
            ProfileStore::connect(
                &config.store,
                config.profile.maturity_threshold,
                redis.clone(),
                metrics.clone(),
            )
            .await,
        );

        Self::assemble(config, store, redis, metrics)
    }

    /// Build the engine without touching any external tier. Profiles live
    /// in the local cache only; velocity reads degrade to zero.
    pub fn detached(config: EngineConfig) -> EngineResult<Self> {
        let metrics = Arc::new(EngineMetrics::new());
        let store = Arc::new(ProfileStore::with_connections(
            &config.store,
            config.profile.maturity_threshold,
            None,
            None,
            metrics.clone(),
        ));
        Self::assemble(config, store, None, metrics)
    }

    fn assemble(
        config: EngineConfig,
        store: Arc<ProfileStore>,
        redis: Option<ConnectionManager>,
        metrics: Arc<EngineMetrics>,
    ) -> EngineResult<Self> {
        let op_timeout = Duration::from_millis(config.store.op_timeout_ms);

        let velocity = Arc::new(VelocityCounter::new(redis, &config.velocity, op_timeout));
        let extractor = FeatureExtractor::new(store.clone(), velocity.clone(), metrics.clone());

        let model = Arc::new(ScoringModel::new());
        let artifact = Path::new(&config.model.artifact_path);
        if artifact.exists() {
            match model.load(artifact, &config.model.version) {
                Ok(()) => {}
                Err(e) => warn!(error = %e, "model artifact unreadable, starting unloaded"),
            }
        } else {
            info!(path = %artifact.display(), "no model artifact found, starting unloaded");
        }

        let flush_worker =
            store.start_flush_worker(Duration::from_secs(config.store.flush_interval_secs));

        Ok(Self {
            store,
            velocity,
            extractor,
            model,
            metrics,
            flush_worker: Mutex::new(Some(flush_worker)),
        })
    }

    pub fn model(&self) -> &Arc<ScoringModel> {
        &self.model
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        &self.store
    }

    pub fn velocity(&self) -> &Arc<VelocityCounter> {
        &self.velocity
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Score one transaction: extract features against the account's
    /// profile (with its side effects), then run the active model.
    ///
    /// Fails only on precondition errors from the model (nothing loaded,
    /// shape mismatch); dependency failures have already degraded inside
    /// extraction.
    pub async fn score(
        &self,
        identity: &str,
        amount: f64,
        timestamp: DateTime<Utc>,
        merchant: Option<&str>,
        category: Option<&str>,
    ) -> EngineResult<ScoreOutcome> {
        let (features, enrichment, _profile) = self
            .extractor
            .extract(identity, amount, timestamp, merchant, category)
            .await;

        let verdict = self.model.predict(features.as_slice())?;
        self.metrics.record_score(verdict.score);

        Ok(ScoreOutcome {
            verdict,
            enrichment,
            features,
        })
    }

    /// Current profile snapshot for one account.
    pub async fn profile_summary(&self, identity: &str) -> ProfileSummary {
        let profile = self.store.get_profile(identity).await;

        let mut merchants: Vec<(String, u64)> = profile
            .merchants
            .merchant_counts
            .iter()
            .map(|(name, &count)| (name.clone(), count))
            .collect();
        merchants.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        ProfileSummary {
            account_id: profile.account_id.clone(),
            total_transactions: profile.total_transactions,
            is_mature: profile.is_mature,
            avg_spend: (profile.spending.avg_amount * 100.0).round() / 100.0,
            std_spend: (profile.spending.std_amount * 100.0).round() / 100.0,
            peak_hours: profile.time_patterns.peak_hours.clone(),
            top_merchants: merchants.into_iter().take(5).map(|(name, _)| name).collect(),
        }
    }

    /// Operator reset: drop the account's profile from every tier and the
    /// write buffer.
    pub async fn reset_profile(&self, identity: &str) -> Result<(), StoreError> {
        self.store.reset(identity).await
    }

    /// Ordered teardown: stop the flush worker (which performs a final
    /// drain), then release the durable connection.
    pub async fn shutdown(&self) {
        if let Some(worker) = self.flush_worker.lock().await.take() {
            worker.shutdown().await;
        }
        self.store.close().await;
        self.metrics.log_summary();
        info!("scoring context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::{EngineError, ModelError};
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 6, 14, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_score_without_model_is_precondition_error() {
        let context = ScoringContext::detached(EngineConfig::default()).unwrap();
        let result = context.score("acct_1", 50.0, ts(), None, None).await;

        assert!(matches!(
            result,
            Err(EngineError::Model(ModelError::NotLoaded))
        ));
        context.shutdown().await;
    }

    #[tokio::test]
    async fn test_profile_summary_orders_merchants() {
        let context = ScoringContext::detached(EngineConfig::default()).unwrap();
        for (merchant, times) in [("grocer", 3i64), ("cafe", 5), ("garage", 1)] {
            for i in 0..times {
                context
                    .extractor
                    .extract(
                        "acct_1",
                        20.0,
                        ts() + chrono::Duration::minutes(i),
                        Some(merchant),
                        None,
                    )
                    .await;
            }
        }

        let summary = context.profile_summary("acct_1").await;
        assert_eq!(summary.total_transactions, 9);
        assert_eq!(summary.top_merchants[0], "cafe");
        assert_eq!(summary.top_merchants[1], "grocer");
        context.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_forgets_account() {
        let context = ScoringContext::detached(EngineConfig::default()).unwrap();
        context.extractor.extract("acct_1", 20.0, ts(), None, None).await;
        assert_eq!(context.profile_summary("acct_1").await.total_transactions, 1);

        context.reset_profile("acct_1").await.unwrap();
        assert_eq!(context.profile_summary("acct_1").await.total_transactions, 0);
        context.shutdown().await;
    }
}
