//! Enrichment payload emitted alongside each feature vector.
//!
//! A defined record type rather than a free-form map, so the producer and
//! any downstream consumer cannot drift apart silently. Bump
//! `ENRICHMENT_SCHEMA_VERSION` when a field is added, removed, or changes
//! meaning.

use serde::{Deserialize, Serialize};

/// Current schema version for [`FeatureEnrichment`].
pub const ENRICHMENT_SCHEMA_VERSION: u32 = 1;

/// Human-readable context describing how a transaction compared to the
/// account's behavioral profile at extraction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureEnrichment {
    /// Schema version of this record
    pub schema_version: u32,

    /// Account average spend, rounded to cents
    pub account_avg_spend: f64,
    /// Account spend standard deviation, rounded to cents
    pub account_std_spend: f64,
    /// Raw (unclipped feature input) z-score of the amount
    pub amount_zscore: f64,
    /// Raw percentile of the amount in the account's recent history, 0-100
    pub amount_percentile: f64,
    /// Transactions observed in the current velocity window
    pub window_count: u64,
    /// Current velocity relative to the account's typical rate
    pub velocity_ratio: f64,
    /// How unusual this hour is for the account, 0-1
    pub hour_deviation: f64,
    /// Whether the profile had enough history for personalized statistics
    pub mature_profile: bool,
    /// Total transactions folded into the profile, including this one
    pub total_transactions: u64,
}

fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

impl FeatureEnrichment {
    /// Round the monetary and ratio fields the way the record is published.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_avg_spend: f64,
        account_std_spend: f64,
        amount_zscore: f64,
        amount_percentile: f64,
        window_count: u64,
        velocity_ratio: f64,
        hour_deviation: f64,
        mature_profile: bool,
        total_transactions: u64,
    ) -> Self {
        Self {
            schema_version: ENRICHMENT_SCHEMA_VERSION,
            account_avg_spend: round_to(account_avg_spend, 2),
            account_std_spend: round_to(account_std_spend, 2),
            amount_zscore: round_to(amount_zscore, 2),
            amount_percentile: round_to(amount_percentile, 1),
            window_count,
            velocity_ratio: round_to(velocity_ratio, 2),
            hour_deviation: round_to(hour_deviation, 2),
            mature_profile,
            total_transactions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_and_version() {
        let enrichment = FeatureEnrichment::new(
            50.123456, 30.987654, 1.23456, 87.6543, 3, 2.34567, 0.98765, true, 42,
        );
        assert_eq!(enrichment.schema_version, ENRICHMENT_SCHEMA_VERSION);
        assert_eq!(enrichment.account_avg_spend, 50.12);
        assert_eq!(enrichment.account_std_spend, 30.99);
        assert_eq!(enrichment.amount_percentile, 87.7);
        assert_eq!(enrichment.velocity_ratio, 2.35);
        assert_eq!(enrichment.hour_deviation, 0.99);
    }

    #[test]
    fn test_serialization_stable() {
        let enrichment =
            FeatureEnrichment::new(50.0, 30.0, 0.0, 50.0, 0, 0.0, 0.1, false, 1);
        let json = serde_json::to_value(&enrichment).unwrap();
        assert_eq!(json["schema_version"], 1);
        assert_eq!(json["mature_profile"], false);
    }
}
