//! Feature extraction against per-account behavioral profiles.
//!
//! Each transaction becomes a fixed 10-dimensional vector describing how
//! far it deviates from the account's own history. Accounts without enough
//! history fall back to global heuristics until their profile matures.
//!
//! The vector order in [`FEATURE_NAMES`] is part of the training and
//! storage contract: any change requires a model version bump.

use crate::metrics::EngineMetrics;
use crate::store::ProfileStore;
use crate::types::enrichment::FeatureEnrichment;
use crate::types::profile::BehaviorProfile;
use crate::velocity::VelocityCounter;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

/// Width of the feature vector.
pub const FEATURE_COUNT: usize = 10;

/// Canonical feature order. Models are trained and scored against vectors
/// in exactly this order.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "log_amount",
    "amount_zscore",
    "amount_percentile",
    "velocity_ratio",
    "hour_deviation",
    "day_deviation",
    "time_since_last",
    "merchant_familiarity",
    "is_new_identity",
    "global_amount_flag",
];

/// Fallback spending statistics for immature profiles.
const GLOBAL_AVG_AMOUNT: f64 = 50.0;
const GLOBAL_STD_AMOUNT: f64 = 30.0;

/// Clip bounds for the z-score feature.
const ZSCORE_MIN: f64 = -5.0;
const ZSCORE_MAX: f64 = 10.0;

/// Velocity ratio cap.
const VELOCITY_RATIO_CAP: f64 = 10.0;

/// Fixed-width feature vector in canonical order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector([f64; FEATURE_COUNT]);

impl FeatureVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Value by canonical feature name.
    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|&n| n == name)
            .map(|i| self.0[i])
    }
}

impl From<[f64; FEATURE_COUNT]> for FeatureVector {
    fn from(values: [f64; FEATURE_COUNT]) -> Self {
        Self(values)
    }
}

/// Turns transactions into feature vectors relative to the account's
/// behavioral profile.
pub struct FeatureExtractor {
    store: Arc<ProfileStore>,
    velocity: Arc<VelocityCounter>,
    metrics: Arc<EngineMetrics>,
}

impl FeatureExtractor {
    pub fn new(
        store: Arc<ProfileStore>,
        velocity: Arc<VelocityCounter>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            velocity,
            metrics,
        }
    }

    pub fn feature_count(&self) -> usize {
        FEATURE_COUNT
    }

    pub fn feature_names(&self) -> &'static [&'static str; FEATURE_COUNT] {
        &FEATURE_NAMES
    }

    /// Extract the feature vector for one transaction.
    ///
    /// Not a pure function: the account's profile is updated and persisted
    /// and the velocity marker recorded as a side effect, in that order.
    /// Dependency failures never block the computation; the affected
    /// features degrade to their immature-path defaults instead.
    ///
    /// No per-identity lock is held across the read-modify-persist
    /// sequence: two concurrent extractions for the same identity race,
    /// and the last write wins. Accepted by design.
    pub async fn extract(
        &self,
        identity: &str,
        amount: f64,
        timestamp: DateTime<Utc>,
        merchant: Option<&str>,
        category: Option<&str>,
    ) -> (FeatureVector, FeatureEnrichment, BehaviorProfile) {
        let mut profile = self.store.get_profile(identity).await;

        let window_count = match self.velocity.count(identity, timestamp).await {
            Ok(count) => count,
            Err(e) => {
                warn!(identity = %identity, error = %e, "velocity read failed, defaulting to 0");
                self.metrics.degraded_extractions.fetch_add(1, Ordering::Relaxed);
                0
            }
        };

        // Feature 0: log-transformed amount on the global scale.
        let log_amount = (1.0 + amount).ln();

        // Feature 1: z-score, personalized once the profile matures.
        let raw_zscore = if profile.is_mature {
            profile.amount_zscore(amount)
        } else {
            (amount - GLOBAL_AVG_AMOUNT) / GLOBAL_STD_AMOUNT
        };
        let amount_zscore = raw_zscore.clamp(ZSCORE_MIN, ZSCORE_MAX);

        // Feature 2: percentile of the amount in the account's history.
        let raw_percentile;
        let amount_percentile = if profile.is_mature {
            raw_percentile = profile.amount_percentile(amount);
            raw_percentile / 100.0
        } else {
            // Step function over the absolute amount for unknown accounts.
            let step = if amount < 25.0 {
                0.25
            } else if amount < 75.0 {
                0.5
            } else if amount < 200.0 {
                0.75
            } else {
                0.95
            };
            raw_percentile = step * 100.0;
            step
        };

        // Feature 3: current window count vs the account's typical rate.
        let raw_ratio = if profile.is_mature && profile.velocity.avg_10min_count > 0.0 {
            window_count as f64 / profile.velocity.avg_10min_count.max(0.1)
        } else {
            // New accounts compare against a one-per-window baseline.
            window_count as f64
        };
        let velocity_ratio = raw_ratio.min(VELOCITY_RATIO_CAP);

        // Feature 4: how unusual this hour is for the account.
        let hour = timestamp.hour();
        let hour_deviation = if profile.is_mature {
            1.0 - (profile.hour_probability(hour) * 24.0).min(1.0)
        } else {
            match hour {
                2..=5 => 0.9,
                6..=8 | 21..=23 => 0.3,
                _ => 0.1,
            }
        };

        // Feature 5: how unusual this day is for the account.
        let day = timestamp.weekday().num_days_from_monday();
        let day_deviation = if profile.is_mature {
            1.0 - (profile.day_probability(day) * 7.0).min(1.0)
        } else if day >= 5 {
            0.3
        } else {
            0.1
        };

        // Feature 6: logistic recency score; very short gaps approach 1.
        let time_since_last = match profile.last_transaction_at {
            Some(last) => {
                let gap_seconds = (timestamp - last).num_milliseconds() as f64 / 1000.0;
                1.0 / (1.0 + ((gap_seconds - 300.0) / 100.0).exp())
            }
            None => 0.0,
        };

        // Feature 7: merchant familiarity; neutral until mature.
        let merchant_familiarity = match merchant {
            Some(m) if profile.is_mature => {
                if profile.is_known_merchant(m) {
                    (profile.merchant_frequency(m) * 10.0).min(1.0)
                } else {
                    0.0
                }
            }
            _ => 0.5,
        };

        // Feature 8: maturity as a model input.
        let is_new_identity = if profile.is_mature { 0.0 } else { 1.0 };

        // Feature 9: globally unusual amounts regardless of the account.
        let global_amount_flag = if amount > 1000.0 {
            ((1.0 + amount - 1000.0).ln() / 5.0).min(1.0)
        } else {
            0.0
        };

        let vector = FeatureVector([
            log_amount,
            amount_zscore,
            amount_percentile,
            velocity_ratio,
            hour_deviation,
            day_deviation,
            time_since_last,
            merchant_familiarity,
            is_new_identity,
            global_amount_flag,
        ]);

        // Side effects, in contract order: profile statistics, velocity
        // marker, persistence.
        let was_mature = profile.is_mature;
        profile.update(amount, timestamp, merchant, category);

        if let Err(e) = self.velocity.record(identity, timestamp).await {
            warn!(identity = %identity, error = %e, "velocity record failed");
            self.metrics.degraded_extractions.fetch_add(1, Ordering::Relaxed);
        }

        let crossed_maturity = !was_mature && profile.is_mature;
        self.store.save_profile(&profile, crossed_maturity).await;

        let enrichment = FeatureEnrichment::new(
            profile.spending.avg_amount,
            profile.spending.std_amount,
            raw_zscore,
            raw_percentile,
            window_count,
            velocity_ratio,
            hour_deviation,
            profile.is_mature,
            profile.total_transactions,
        );

        self.metrics.extractions.fetch_add(1, Ordering::Relaxed);
        debug!(
            identity = %identity,
            amount = amount,
            mature = profile.is_mature,
            zscore = format!("{:.2}", amount_zscore),
            "features extracted"
        );

        (vector, enrichment, profile)
    }
}
