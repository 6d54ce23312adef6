//! Per-account behavioral profile.
//!
//! A `BehaviorProfile` is the evolving statistical fingerprint of one
//! account, built incrementally with online algorithms so the full
//! transaction history never has to be stored. What is normal for one
//! account may be anomalous for another: a $500 purchase is routine for an
//! account averaging $500 and a strong signal for one averaging $25.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Capacity of the recency buffer used for order statistics.
pub const RECENT_AMOUNTS_CAP: usize = 100;

/// Samples required before order statistics are reported.
const ORDER_STATS_MIN: usize = 10;

/// Smoothing factor for hour/day distributions.
const TIME_SMOOTHING: f64 = 0.05;

/// Smoothing factor for the inter-transaction gap average.
const GAP_SMOOTHING: f64 = 0.1;

/// A bucket counts as "peak" when its probability exceeds this multiple of
/// the uniform baseline.
const PEAK_RATIO: f64 = 0.8;

/// Statistical summary of an account's spending behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendingStats {
    /// Running mean transaction amount
    pub avg_amount: f64,
    /// Running standard deviation, floored at 1.0 once history exists
    pub std_amount: f64,
    pub min_amount: f64,
    pub max_amount: f64,
    /// Order statistics derived from the recency buffer
    pub median_amount: f64,
    pub p25_amount: f64,
    pub p75_amount: f64,
    pub p95_amount: f64,
}

impl Default for SpendingStats {
    fn default() -> Self {
        Self {
            avg_amount: 0.0,
            std_amount: 1.0,
            min_amount: 0.0,
            max_amount: 0.0,
            median_amount: 0.0,
            p25_amount: 0.0,
            p75_amount: 0.0,
            p95_amount: 0.0,
        }
    }
}

/// Typical transaction time patterns for an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimePatterns {
    /// Probability distribution over hours 0-23, sums to 1
    pub hour_distribution: Vec<f64>,
    /// Probability distribution over days 0 (Mon) - 6 (Sun), sums to 1
    pub day_distribution: Vec<f64>,
    /// Hours whose smoothed probability exceeds 0.8x uniform
    pub peak_hours: Vec<u32>,
    /// Days whose smoothed probability exceeds 0.8x uniform
    pub active_days: Vec<u32>,
}

impl Default for TimePatterns {
    fn default() -> Self {
        Self {
            hour_distribution: vec![1.0 / 24.0; 24],
            day_distribution: vec![1.0 / 7.0; 7],
            peak_hours: (9..21).collect(),
            active_days: (0..5).collect(),
        }
    }
}

/// Transaction velocity patterns for an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityPatterns {
    pub avg_daily_count: f64,
    pub avg_hourly_count: f64,
    /// Historic average count per 10-minute window, used as the
    /// denominator of the velocity-ratio feature
    pub avg_10min_count: f64,
    pub max_10min_count: u64,
    /// Exponentially smoothed gap between consecutive transactions
    pub avg_gap_seconds: f64,
}

impl Default for VelocityPatterns {
    fn default() -> Self {
        Self {
            avg_daily_count: 1.0,
            avg_hourly_count: 0.1,
            avg_10min_count: 0.02,
            max_10min_count: 3,
            avg_gap_seconds: 86400.0,
        }
    }
}

/// Merchant and category preferences.
///
/// The frequency tables grow unboundedly per account; no eviction policy is
/// applied, which is a capacity-planning concern for very long-lived
/// accounts. Capping them would change the observable frequency queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MerchantPatterns {
    /// Merchant name -> transaction count
    pub merchant_counts: HashMap<String, u64>,
    /// Category name -> transaction count
    pub category_counts: HashMap<String, u64>,
    pub unique_merchants: usize,
}

/// Comprehensive behavioral profile for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorProfile {
    pub account_id: String,

    pub spending: SpendingStats,
    pub time_patterns: TimePatterns,
    pub velocity: VelocityPatterns,
    pub merchants: MerchantPatterns,

    /// Monotonic count of transactions processed
    pub total_transactions: u64,
    /// One-way latch: set when `total_transactions` first reaches the
    /// threshold, never reverts
    pub is_mature: bool,
    pub maturity_threshold: u64,

    pub first_transaction_at: Option<DateTime<Utc>>,
    pub last_transaction_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Most recent amounts, oldest first, capped at 100
    pub recent_amounts: Vec<f64>,
}

impl BehaviorProfile {
    /// Create a default profile for an account with no recorded history.
    ///
    /// Spending defaults are conservative priors; the first observed
    /// transaction overwrites them.
    pub fn new(account_id: impl Into<String>, maturity_threshold: u64) -> Self {
        let now = Utc::now();
        Self {
            account_id: account_id.into(),
            spending: SpendingStats {
                avg_amount: 50.0,
                std_amount: 30.0,
                ..SpendingStats::default()
            },
            time_patterns: TimePatterns::default(),
            velocity: VelocityPatterns::default(),
            merchants: MerchantPatterns::default(),
            total_transactions: 0,
            is_mature: false,
            maturity_threshold,
            first_transaction_at: None,
            last_transaction_at: None,
            created_at: now,
            updated_at: now,
            recent_amounts: Vec::new(),
        }
    }

    /// Fold one transaction into the profile.
    ///
    /// Must be called at most once per transaction, in timestamp order per
    /// account; out-of-order updates are not corrected.
    pub fn update(
        &mut self,
        amount: f64,
        timestamp: DateTime<Utc>,
        merchant: Option<&str>,
        category: Option<&str>,
    ) {
        self.total_transactions += 1;

        if self.first_transaction_at.is_none() {
            self.first_transaction_at = Some(timestamp);
        }

        // Gap EMA uses the previous transaction time, before it moves.
        if let Some(last) = self.last_transaction_at {
            let gap = (timestamp - last).num_milliseconds() as f64 / 1000.0;
            self.velocity.avg_gap_seconds =
                GAP_SMOOTHING * gap + (1.0 - GAP_SMOOTHING) * self.velocity.avg_gap_seconds;
        }
        self.last_transaction_at = Some(timestamp);

        self.update_spending_stats(amount);
        self.update_time_patterns(timestamp);

        if let Some(merchant) = merchant {
            *self
                .merchants
                .merchant_counts
                .entry(merchant.to_string())
                .or_insert(0) += 1;
            self.merchants.unique_merchants = self.merchants.merchant_counts.len();
        }
        if let Some(category) = category {
            *self
                .merchants
                .category_counts
                .entry(category.to_string())
                .or_insert(0) += 1;
        }

        // One-way latch.
        self.is_mature = self.is_mature || self.total_transactions >= self.maturity_threshold;
        self.updated_at = Utc::now();
    }

    /// Update spending statistics with Welford's online algorithm.
    fn update_spending_stats(&mut self, amount: f64) {
        let n = self.total_transactions;

        self.recent_amounts.push(amount);
        if self.recent_amounts.len() > RECENT_AMOUNTS_CAP {
            self.recent_amounts.remove(0);
        }

        if n == 1 {
            self.spending.min_amount = amount;
            self.spending.max_amount = amount;
            self.spending.avg_amount = amount;
            self.spending.std_amount = 0.0;
        } else {
            self.spending.min_amount = self.spending.min_amount.min(amount);
            self.spending.max_amount = self.spending.max_amount.max(amount);

            let n_f = n as f64;
            let old_mean = self.spending.avg_amount;
            self.spending.avg_amount = old_mean + (amount - old_mean) / n_f;

            let old_std = self.spending.std_amount;
            let new_variance = (n_f - 2.0) / (n_f - 1.0) * old_std.powi(2)
                + (amount - old_mean).powi(2) / n_f;
            self.spending.std_amount = new_variance.sqrt().max(1.0);
        }

        if self.recent_amounts.len() >= ORDER_STATS_MIN {
            let mut sorted = self.recent_amounts.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            self.spending.median_amount = percentile(&sorted, 50.0);
            self.spending.p25_amount = percentile(&sorted, 25.0);
            self.spending.p75_amount = percentile(&sorted, 75.0);
            self.spending.p95_amount = percentile(&sorted, 95.0);
        }
    }

    /// Smooth the matching hour/day bucket up, decay the rest, renormalize,
    /// then re-derive peak hours and active days.
    fn update_time_patterns(&mut self, timestamp: DateTime<Utc>) {
        let hour = timestamp.hour() as usize;
        let day = timestamp.weekday().num_days_from_monday() as usize;

        smooth_bucket(&mut self.time_patterns.hour_distribution, hour);
        self.time_patterns.peak_hours = peak_buckets(&self.time_patterns.hour_distribution);

        smooth_bucket(&mut self.time_patterns.day_distribution, day);
        self.time_patterns.active_days = peak_buckets(&self.time_patterns.day_distribution);
    }

    /// Z-score of an amount relative to this account's history.
    ///
    /// Returns 0.0 while the standard deviation is degenerate (unset, or
    /// still pinned at the 1.0 floor).
    pub fn amount_zscore(&self, amount: f64) -> f64 {
        if self.spending.std_amount == 0.0 || self.spending.std_amount == 1.0 {
            return 0.0;
        }
        (amount - self.spending.avg_amount) / self.spending.std_amount
    }

    /// Percentile of an amount against the recency buffer, 0-100.
    pub fn amount_percentile(&self, amount: f64) -> f64 {
        if self.recent_amounts.is_empty() {
            return 50.0;
        }
        let below = self.recent_amounts.iter().filter(|&&a| a < amount).count();
        below as f64 / self.recent_amounts.len() as f64 * 100.0
    }

    /// Probability of this account transacting at the given hour.
    pub fn hour_probability(&self, hour: u32) -> f64 {
        self.time_patterns
            .hour_distribution
            .get(hour as usize)
            .copied()
            .unwrap_or(1.0 / 24.0)
    }

    /// Probability of this account transacting on the given day (0 = Mon).
    pub fn day_probability(&self, day: u32) -> f64 {
        self.time_patterns
            .day_distribution
            .get(day as usize)
            .copied()
            .unwrap_or(1.0 / 7.0)
    }

    /// Whether the account has transacted with this merchant before.
    pub fn is_known_merchant(&self, merchant: &str) -> bool {
        self.merchants.merchant_counts.contains_key(merchant)
    }

    /// How often the account transacts with this merchant, 0-1.
    pub fn merchant_frequency(&self, merchant: &str) -> f64 {
        let total: u64 = self.merchants.merchant_counts.values().sum();
        if total == 0 {
            return 0.0;
        }
        let count = self.merchants.merchant_counts.get(merchant).copied().unwrap_or(0);
        count as f64 / total as f64
    }
}

/// Exponential smoothing step over one distribution: the observed bucket
/// gains `a*1 + (1-a)*old`, every other bucket decays by `(1-a)`, and the
/// whole distribution is renormalized to sum to 1.
fn smooth_bucket(distribution: &mut [f64], observed: usize) {
    for (i, p) in distribution.iter_mut().enumerate() {
        if i == observed {
            *p = TIME_SMOOTHING + (1.0 - TIME_SMOOTHING) * *p;
        } else {
            *p *= 1.0 - TIME_SMOOTHING;
        }
    }
    let total: f64 = distribution.iter().sum();
    if total > 0.0 {
        for p in distribution.iter_mut() {
            *p /= total;
        }
    }
}

/// Buckets whose probability exceeds 0.8x the uniform baseline.
fn peak_buckets(distribution: &[f64]) -> Vec<u32> {
    let uniform = 1.0 / distribution.len() as f64;
    distribution
        .iter()
        .enumerate()
        .filter(|(_, &p)| p > uniform * PEAK_RATIO)
        .map(|(i, _)| i as u32)
        .collect()
}

/// Percentile with linear interpolation over a pre-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        // 2024-03-04 is a Monday
        Utc.with_ymd_and_hms(2024, 3, 4, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_first_transaction_sets_stats() {
        let mut profile = BehaviorProfile::new("acct_1", 20);
        profile.update(42.0, ts(10, 0), None, None);

        assert_eq!(profile.total_transactions, 1);
        assert_eq!(profile.spending.avg_amount, 42.0);
        assert_eq!(profile.spending.min_amount, 42.0);
        assert_eq!(profile.spending.max_amount, 42.0);
        assert_eq!(profile.spending.std_amount, 0.0);
        assert_eq!(profile.first_transaction_at, Some(ts(10, 0)));
    }

    #[test]
    fn test_recency_buffer_capped_fifo() {
        let mut profile = BehaviorProfile::new("acct_1", 20);
        for i in 0..150 {
            profile.update(i as f64, ts(10, 0) + chrono::Duration::minutes(i), None, None);
        }
        assert_eq!(profile.recent_amounts.len(), RECENT_AMOUNTS_CAP);
        // Oldest evicted first: buffer holds 50..150
        assert_eq!(profile.recent_amounts[0], 50.0);
        assert_eq!(*profile.recent_amounts.last().unwrap(), 149.0);
    }

    #[test]
    fn test_maturity_latch_transitions_once() {
        let mut profile = BehaviorProfile::new("acct_1", 10);
        for i in 0..9 {
            profile.update(50.0, ts(10, 0) + chrono::Duration::minutes(i), None, None);
            assert!(!profile.is_mature, "immature through update {}", i + 1);
        }
        profile.update(50.0, ts(12, 0), None, None);
        assert!(profile.is_mature, "mature at threshold");

        profile.update(50.0, ts(12, 30), None, None);
        assert!(profile.is_mature, "latch never reverts");
    }

    #[test]
    fn test_welford_zscore() {
        let mut profile = BehaviorProfile::new("acct_1", 5);
        let amounts = [40.0, 45.0, 50.0, 55.0, 60.0, 48.0, 52.0, 47.0, 53.0, 50.0];
        for (i, &a) in amounts.iter().enumerate() {
            profile.update(a, ts(10, 0) + chrono::Duration::minutes(i as i64), None, None);
        }
        assert!((profile.spending.avg_amount - 50.0).abs() < 1e-9);
        assert!(profile.amount_zscore(55.0).abs() < 1.0);
        assert!(profile.amount_zscore(200.0) > 2.0);
    }

    #[test]
    fn test_zscore_degenerate_std() {
        let profile = BehaviorProfile::new("acct_1", 20);
        // std floored at 1.0 never produces a z-score
        let mut flat = profile.clone();
        for i in 0..5 {
            flat.update(50.0, ts(10, 0) + chrono::Duration::minutes(i), None, None);
        }
        assert_eq!(flat.spending.std_amount, 1.0);
        assert_eq!(flat.amount_zscore(500.0), 0.0);
    }

    #[test]
    fn test_percentile_bounds_and_empty_buffer() {
        let mut profile = BehaviorProfile::new("acct_1", 20);
        assert_eq!(profile.amount_percentile(10.0), 50.0);

        for i in 1..=20 {
            profile.update(i as f64, ts(10, 0) + chrono::Duration::minutes(i), None, None);
        }
        let low = profile.amount_percentile(0.5);
        let high = profile.amount_percentile(100.0);
        assert_eq!(low, 0.0);
        assert_eq!(high, 100.0);
        assert_eq!(profile.amount_percentile(10.5), 50.0);
    }

    #[test]
    fn test_distributions_stay_normalized() {
        let mut profile = BehaviorProfile::new("acct_1", 20);
        for i in 0..50 {
            profile.update(25.0, ts(14, 0) + chrono::Duration::hours(i), None, None);
        }
        let hour_sum: f64 = profile.time_patterns.hour_distribution.iter().sum();
        let day_sum: f64 = profile.time_patterns.day_distribution.iter().sum();
        assert!((hour_sum - 1.0).abs() < 1e-9);
        assert!((day_sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_peak_hours_follow_activity() {
        let mut profile = BehaviorProfile::new("acct_1", 20);
        // Hammer Monday 14:00 for long enough that other buckets decay
        // below the 0.8x uniform cutoff.
        for i in 0..100 {
            profile.update(25.0, ts(14, 0) + chrono::Duration::weeks(i), None, None);
        }
        assert!(profile.time_patterns.peak_hours.contains(&14));
        assert!(!profile.time_patterns.peak_hours.contains(&3));
        assert!(profile.time_patterns.active_days.contains(&0));
        assert!(profile.time_patterns.active_days.len() < 7);
    }

    #[test]
    fn test_merchant_tracking() {
        let mut profile = BehaviorProfile::new("acct_1", 20);
        profile.update(10.0, ts(10, 0), Some("coffee_shop"), Some("food"));
        profile.update(12.0, ts(11, 0), Some("coffee_shop"), Some("food"));
        profile.update(90.0, ts(12, 0), Some("electronics"), Some("retail"));

        assert!(profile.is_known_merchant("coffee_shop"));
        assert!(!profile.is_known_merchant("casino"));
        assert_eq!(profile.merchants.unique_merchants, 2);
        assert!((profile.merchant_frequency("coffee_shop") - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(profile.merchant_frequency("casino"), 0.0);
        assert_eq!(profile.merchants.category_counts["food"], 2);
    }

    #[test]
    fn test_gap_ema() {
        let mut profile = BehaviorProfile::new("acct_1", 20);
        profile.update(10.0, ts(10, 0), None, None);
        let before = profile.velocity.avg_gap_seconds;
        profile.update(10.0, ts(10, 1), None, None);
        // 0.1 * 60 + 0.9 * 86400
        assert!((profile.velocity.avg_gap_seconds - (0.1 * 60.0 + 0.9 * before)).abs() < 1e-6);
    }

    #[test]
    fn test_order_stats_need_ten_samples() {
        let mut profile = BehaviorProfile::new("acct_1", 20);
        for i in 1..=9 {
            profile.update(i as f64 * 10.0, ts(10, 0) + chrono::Duration::minutes(i), None, None);
        }
        assert_eq!(profile.spending.median_amount, 0.0);

        profile.update(100.0, ts(12, 0), None, None);
        assert!((profile.spending.median_amount - 55.0).abs() < 1e-9);
        assert!(profile.spending.p25_amount < profile.spending.p75_amount);
        assert!(profile.spending.p75_amount <= profile.spending.p95_amount);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut profile = BehaviorProfile::new("acct_1", 20);
        profile.update(42.0, ts(10, 0), Some("grocer"), Some("food"));

        let json = serde_json::to_string(&profile).unwrap();
        let back: BehaviorProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.account_id, profile.account_id);
        assert_eq!(back.total_transactions, 1);
        assert_eq!(back.recent_amounts, profile.recent_amounts);
    }
}
