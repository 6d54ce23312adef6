//! Tiered cache and persistence for behavioral profiles.
//!
//! Reads walk a cache-through path: process-local map, then a TTL-bounded
//! redis tier (TTL refreshed on every hit), then postgres; a full miss
//! synthesizes a fresh default profile. Writes update the local and fast
//! tiers synchronously and defer durable persistence through a
//! last-write-wins buffer flushed by a periodic worker. Consistency across
//! tiers is best-effort: every external call has a bounded timeout and a
//! failure degrades the read or drops the write for the cycle rather than
//! stalling the scoring path.

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::metrics::{EngineMetrics, ReadTier};
use crate::types::profile::BehaviorProfile;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const PROFILE_KEY_PREFIX: &str = "profile:";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS behavior_profiles (
    account_id TEXT PRIMARY KEY,
    avg_amount DOUBLE PRECISION NOT NULL,
    std_amount DOUBLE PRECISION NOT NULL,
    min_amount DOUBLE PRECISION NOT NULL,
    max_amount DOUBLE PRECISION NOT NULL,
    median_amount DOUBLE PRECISION NOT NULL,
    p25_amount DOUBLE PRECISION NOT NULL,
    p75_amount DOUBLE PRECISION NOT NULL,
    p95_amount DOUBLE PRECISION NOT NULL,
    hour_distribution JSONB NOT NULL,
    day_distribution JSONB NOT NULL,
    peak_hours JSONB NOT NULL,
    active_days JSONB NOT NULL,
    avg_daily_count DOUBLE PRECISION NOT NULL,
    avg_hourly_count DOUBLE PRECISION NOT NULL,
    avg_10min_count DOUBLE PRECISION NOT NULL,
    max_10min_count BIGINT NOT NULL,
    avg_gap_seconds DOUBLE PRECISION NOT NULL,
    merchant_counts JSONB NOT NULL,
    category_counts JSONB NOT NULL,
    unique_merchants BIGINT NOT NULL,
    total_transactions BIGINT NOT NULL,
    is_mature BOOLEAN NOT NULL,
    maturity_threshold BIGINT NOT NULL,
    recent_amounts JSONB NOT NULL,
    first_transaction_at TIMESTAMPTZ,
    last_transaction_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
"#;

const UPSERT_PROFILE: &str = r#"
INSERT INTO behavior_profiles (
    account_id,
    avg_amount, std_amount, min_amount, max_amount,
    median_amount, p25_amount, p75_amount, p95_amount,
    hour_distribution, day_distribution, peak_hours, active_days,
    avg_daily_count, avg_hourly_count, avg_10min_count, max_10min_count, avg_gap_seconds,
    merchant_counts, category_counts, unique_merchants,
    total_transactions, is_mature, maturity_threshold,
    recent_amounts,
    first_transaction_at, last_transaction_at, created_at, updated_at
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
    $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29
)
ON CONFLICT (account_id) DO UPDATE SET
    avg_amount = EXCLUDED.avg_amount,
    std_amount = EXCLUDED.std_amount,
    min_amount = EXCLUDED.min_amount,
    max_amount = EXCLUDED.max_amount,
    median_amount = EXCLUDED.median_amount,
    p25_amount = EXCLUDED.p25_amount,
    p75_amount = EXCLUDED.p75_amount,
    p95_amount = EXCLUDED.p95_amount,
    hour_distribution = EXCLUDED.hour_distribution,
    day_distribution = EXCLUDED.day_distribution,
    peak_hours = EXCLUDED.peak_hours,
    active_days = EXCLUDED.active_days,
    avg_daily_count = EXCLUDED.avg_daily_count,
    avg_hourly_count = EXCLUDED.avg_hourly_count,
    avg_10min_count = EXCLUDED.avg_10min_count,
    max_10min_count = EXCLUDED.max_10min_count,
    avg_gap_seconds = EXCLUDED.avg_gap_seconds,
    merchant_counts = EXCLUDED.merchant_counts,
    category_counts = EXCLUDED.category_counts,
    unique_merchants = EXCLUDED.unique_merchants,
    total_transactions = EXCLUDED.total_transactions,
    is_mature = EXCLUDED.is_mature,
    recent_amounts = EXCLUDED.recent_amounts,
    first_transaction_at = EXCLUDED.first_transaction_at,
    last_transaction_at = EXCLUDED.last_transaction_at,
    updated_at = EXCLUDED.updated_at
"#;

/// Tiered profile store with write-behind durable persistence.
pub struct ProfileStore {
    local: RwLock<HashMap<String, BehaviorProfile>>,
    redis: Option<ConnectionManager>,
    pool: Option<PgPool>,
    /// Pending durable writes, last write wins per identity
    write_buffer: Mutex<HashMap<String, BehaviorProfile>>,
    cache_ttl_secs: u64,
    write_cache_ttl_secs: u64,
    op_timeout: Duration,
    maturity_threshold: u64,
    metrics: Arc<EngineMetrics>,
}

impl ProfileStore {
    /// Connect the durable tier and assemble the store. A failed postgres
    /// connection logs and disables durable persistence rather than
    /// failing startup.
    pub async fn connect(
        config: &StoreConfig,
        maturity_threshold: u64,
        redis: Option<ConnectionManager>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let pool = match &config.database_url {
            Some(url) => {
                let connect = PgPoolOptions::new()
                    .min_connections(2)
                    .max_connections(10)
                    .acquire_timeout(Duration::from_millis(config.op_timeout_ms))
                    .connect(url);
                match connect.await {
                    Ok(pool) => match sqlx::query(CREATE_TABLE).execute(&pool).await {
                        Ok(_) => {
                            info!("profile store connected to durable tier");
                            Some(pool)
                        }
                        Err(e) => {
                            warn!(error = %e, "profile table setup failed, durable tier disabled");
                            None
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "durable tier unreachable, persistence disabled");
                        None
                    }
                }
            }
            None => {
                info!("no database configured, durable persistence disabled");
                None
            }
        };

        Self::with_connections(config, maturity_threshold, redis, pool, metrics)
    }

    /// Assemble a store over already-established (or absent) connections.
    pub fn with_connections(
        config: &StoreConfig,
        maturity_threshold: u64,
        redis: Option<ConnectionManager>,
        pool: Option<PgPool>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            redis,
            pool,
            write_buffer: Mutex::new(HashMap::new()),
            cache_ttl_secs: config.cache_ttl_secs,
            write_cache_ttl_secs: config.write_cache_ttl_secs,
            op_timeout: Duration::from_millis(config.op_timeout_ms),
            maturity_threshold,
            metrics,
        }
    }

    /// Cache-through read: local map, redis, postgres, then a synthesized
    /// default profile for an unknown identity. Never fails; tier errors
    /// degrade to the next tier.
    pub async fn get_profile(&self, identity: &str) -> BehaviorProfile {
        if let Some(profile) = self.local.read().await.get(identity) {
            self.metrics.record_read(ReadTier::Local);
            return profile.clone();
        }

        if let Some(profile) = self.get_from_redis(identity).await {
            self.metrics.record_read(ReadTier::Fast);
            self.local
                .write()
                .await
                .insert(identity.to_string(), profile.clone());
            return profile;
        }

        if let Some(profile) = self.get_from_postgres(identity).await {
            self.metrics.record_read(ReadTier::Durable);
            // Repopulate the faster tiers on the way out.
            self.save_to_redis(&profile, self.cache_ttl_secs).await;
            self.local
                .write()
                .await
                .insert(identity.to_string(), profile.clone());
            return profile;
        }

        self.metrics.record_read(ReadTier::Synthesized);
        let profile = BehaviorProfile::new(identity, self.maturity_threshold);
        self.local
            .write()
            .await
            .insert(identity.to_string(), profile.clone());
        profile
    }

    /// Write-behind save: local and redis update synchronously, the
    /// durable write is buffered for the next flush cycle. `immediate`
    /// additionally persists this identity synchronously (used when a
    /// profile crosses a significant threshold).
    pub async fn save_profile(&self, profile: &BehaviorProfile, immediate: bool) {
        self.local
            .write()
            .await
            .insert(profile.account_id.clone(), profile.clone());

        // Profile writes carry the longer feature-engineering TTL.
        self.save_to_redis(profile, self.write_cache_ttl_secs).await;

        self.write_buffer
            .lock()
            .await
            .insert(profile.account_id.clone(), profile.clone());

        if immediate {
            if let Some(pool) = self.pool.clone() {
                if let Err(e) = self.persist_profile(&pool, profile).await {
                    warn!(
                        account = %profile.account_id,
                        error = %e,
                        "immediate persist failed, update stays buffered"
                    );
                } else {
                    debug!(account = %profile.account_id, "profile persisted immediately");
                }
            }
        }
    }

    /// Drain the write buffer and persist every entry once.
    ///
    /// The buffer is taken atomically, so each drained entry is observed by
    /// exactly one flush and entries added during the flush survive to the
    /// next cycle. Persist failures are logged and dropped for this cycle.
    /// Returns the number of profiles persisted.
    pub async fn flush_pending(&self) -> usize {
        let Some(pool) = self.pool.clone() else {
            return 0;
        };

        let drained = {
            let mut buffer = self.write_buffer.lock().await;
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return 0;
        }

        let mut flushed = 0u64;
        let mut dropped = 0u64;
        for profile in drained.values() {
            match self.persist_profile(&pool, profile).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    dropped += 1;
                    warn!(account = %profile.account_id, error = %e, "profile persist failed");
                }
            }
        }

        self.metrics.record_flush(flushed, dropped);
        info!(flushed, dropped, "write buffer flushed");
        flushed as usize
    }

    /// Entries currently awaiting durable persistence.
    pub async fn buffered_count(&self) -> usize {
        self.write_buffer.lock().await.len()
    }

    /// Operator-triggered reset: drop the identity from the local cache,
    /// the write buffer, the fast tier, and the durable tier.
    pub async fn reset(&self, identity: &str) -> Result<(), StoreError> {
        self.local.write().await.remove(identity);
        self.write_buffer.lock().await.remove(identity);

        let mut first_error = None;

        if let Some(mut conn) = self.redis.clone() {
            let key = format!("{}{}", PROFILE_KEY_PREFIX, identity);
            let mut del = redis::cmd("DEL");
            del.arg(&key);
            if let Err(e) = self
                .bounded("redis del", del.query_async::<_, ()>(&mut conn))
                .await
            {
                warn!(identity = %identity, error = %e, "fast tier delete failed");
                first_error.get_or_insert(e);
            }
        }

        if let Some(pool) = self.pool.clone() {
            let delete = sqlx::query("DELETE FROM behavior_profiles WHERE account_id = $1")
                .bind(identity)
                .execute(&pool);
            if let Err(e) = self.bounded("profile delete", delete).await {
                warn!(identity = %identity, error = %e, "durable tier delete failed");
                first_error.get_or_insert(e);
            }
        }

        info!(identity = %identity, "profile reset");
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Spawn the periodic write-behind flush worker. Cancellation performs
    /// one final drain before the task terminates.
    pub fn start_flush_worker(self: &Arc<Self>, interval: Duration) -> FlushWorker {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let store = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.flush_pending().await;
                    }
                    _ = stop_rx.changed() => {
                        store.flush_pending().await;
                        debug!("flush worker drained and stopped");
                        break;
                    }
                }
            }
        });

        FlushWorker {
            handle,
            stop: stop_tx,
        }
    }

    /// Release the durable connection. Call only after the flush worker
    /// has been shut down.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        info!("profile store closed");
    }

    async fn get_from_redis(&self, identity: &str) -> Option<BehaviorProfile> {
        let mut conn = self.redis.clone()?;
        let key = format!("{}{}", PROFILE_KEY_PREFIX, identity);

        let mut get = redis::cmd("GET");
        get.arg(&key);
        let data: Option<String> = match self
            .bounded("redis get", get.query_async(&mut conn))
            .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!(identity = %identity, error = %e, "fast tier read failed");
                return None;
            }
        };
        let data = data?;

        match serde_json::from_str::<BehaviorProfile>(&data) {
            Ok(profile) => {
                // Refresh the TTL on every hit.
                let mut expire = redis::cmd("EXPIRE");
                expire.arg(&key).arg(self.cache_ttl_secs);
                if let Err(e) = self
                    .bounded("redis expire", expire.query_async::<_, i64>(&mut conn))
                    .await
                {
                    debug!(identity = %identity, error = %e, "ttl refresh failed");
                }
                Some(profile)
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "cached profile unreadable");
                None
            }
        }
    }

    async fn save_to_redis(&self, profile: &BehaviorProfile, ttl_secs: u64) {
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let key = format!("{}{}", PROFILE_KEY_PREFIX, profile.account_id);

        let data = match serde_json::to_string(profile) {
            Ok(data) => data,
            Err(e) => {
                warn!(account = %profile.account_id, error = %e, "profile serialization failed");
                return;
            }
        };

        let mut set = redis::cmd("SET");
        set.arg(&key).arg(data).arg("EX").arg(ttl_secs);
        if let Err(e) = self
            .bounded("redis set", set.query_async::<_, ()>(&mut conn))
            .await
        {
            warn!(account = %profile.account_id, error = %e, "fast tier write failed");
        }
    }

    async fn get_from_postgres(&self, identity: &str) -> Option<BehaviorProfile> {
        let pool = self.pool.clone()?;

        let query = sqlx::query("SELECT * FROM behavior_profiles WHERE account_id = $1")
            .bind(identity)
            .fetch_optional(&pool);
        match self.bounded("profile select", query).await {
            Ok(Some(row)) => match row_to_profile(&row) {
                Ok(profile) => Some(profile),
                Err(e) => {
                    warn!(identity = %identity, error = %e, "stored profile unreadable");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(identity = %identity, error = %e, "durable tier read failed");
                None
            }
        }
    }

    async fn persist_profile(
        &self,
        pool: &PgPool,
        profile: &BehaviorProfile,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(UPSERT_PROFILE)
            .bind(&profile.account_id)
            .bind(profile.spending.avg_amount)
            .bind(profile.spending.std_amount)
            .bind(profile.spending.min_amount)
            .bind(profile.spending.max_amount)
            .bind(profile.spending.median_amount)
            .bind(profile.spending.p25_amount)
            .bind(profile.spending.p75_amount)
            .bind(profile.spending.p95_amount)
            .bind(Json(&profile.time_patterns.hour_distribution))
            .bind(Json(&profile.time_patterns.day_distribution))
            .bind(Json(&profile.time_patterns.peak_hours))
            .bind(Json(&profile.time_patterns.active_days))
            .bind(profile.velocity.avg_daily_count)
            .bind(profile.velocity.avg_hourly_count)
            .bind(profile.velocity.avg_10min_count)
            .bind(profile.velocity.max_10min_count as i64)
            .bind(profile.velocity.avg_gap_seconds)
            .bind(Json(&profile.merchants.merchant_counts))
            .bind(Json(&profile.merchants.category_counts))
            .bind(profile.merchants.unique_merchants as i64)
            .bind(profile.total_transactions as i64)
            .bind(profile.is_mature)
            .bind(profile.maturity_threshold as i64)
            .bind(Json(&profile.recent_amounts))
            .bind(profile.first_transaction_at)
            .bind(profile.last_transaction_at)
            .bind(profile.created_at)
            .bind(profile.updated_at)
            .execute(pool);

        self.bounded("profile upsert", query).await?;
        Ok(())
    }

    async fn bounded<T, E>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, StoreError>
    where
        StoreError: From<E>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout {
                operation,
                timeout_ms: self.op_timeout.as_millis() as u64,
            }),
        }
    }
}

/// Handle to the background flush worker.
pub struct FlushWorker {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl FlushWorker {
    /// Signal the worker to stop and wait for its final drain.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

fn row_to_profile(row: &sqlx::postgres::PgRow) -> Result<BehaviorProfile, StoreError> {
    use crate::types::profile::{MerchantPatterns, SpendingStats, TimePatterns, VelocityPatterns};

    Ok(BehaviorProfile {
        account_id: row.try_get("account_id")?,
        spending: SpendingStats {
            avg_amount: row.try_get("avg_amount")?,
            std_amount: row.try_get("std_amount")?,
            min_amount: row.try_get("min_amount")?,
            max_amount: row.try_get("max_amount")?,
            median_amount: row.try_get("median_amount")?,
            p25_amount: row.try_get("p25_amount")?,
            p75_amount: row.try_get("p75_amount")?,
            p95_amount: row.try_get("p95_amount")?,
        },
        time_patterns: TimePatterns {
            hour_distribution: row.try_get::<Json<Vec<f64>>, _>("hour_distribution")?.0,
            day_distribution: row.try_get::<Json<Vec<f64>>, _>("day_distribution")?.0,
            peak_hours: row.try_get::<Json<Vec<u32>>, _>("peak_hours")?.0,
            active_days: row.try_get::<Json<Vec<u32>>, _>("active_days")?.0,
        },
        velocity: VelocityPatterns {
            avg_daily_count: row.try_get("avg_daily_count")?,
            avg_hourly_count: row.try_get("avg_hourly_count")?,
            avg_10min_count: row.try_get("avg_10min_count")?,
            max_10min_count: row.try_get::<i64, _>("max_10min_count")? as u64,
            avg_gap_seconds: row.try_get("avg_gap_seconds")?,
        },
        merchants: MerchantPatterns {
            merchant_counts: row
                .try_get::<Json<HashMap<String, u64>>, _>("merchant_counts")?
                .0,
            category_counts: row
                .try_get::<Json<HashMap<String, u64>>, _>("category_counts")?
                .0,
            unique_merchants: row.try_get::<i64, _>("unique_merchants")? as usize,
        },
        total_transactions: row.try_get::<i64, _>("total_transactions")? as u64,
        is_mature: row.try_get("is_mature")?,
        maturity_threshold: row.try_get::<i64, _>("maturity_threshold")? as u64,
        recent_amounts: row.try_get::<Json<Vec<f64>>, _>("recent_amounts")?.0,
        first_transaction_at: row.try_get::<Option<DateTime<Utc>>, _>("first_transaction_at")?,
        last_transaction_at: row.try_get::<Option<DateTime<Utc>>, _>("last_transaction_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use chrono::TimeZone;

    fn detached_store() -> ProfileStore {
        let config = EngineConfig::default();
        ProfileStore::with_connections(
            &config.store,
            config.profile.maturity_threshold,
            None,
            None,
            Arc::new(EngineMetrics::new()),
        )
    }

    fn sample_profile(identity: &str) -> BehaviorProfile {
        let mut profile = BehaviorProfile::new(identity, 20);
        let ts = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        profile.update(42.0, ts, Some("grocer"), Some("food"));
        profile
    }

    #[tokio::test]
    async fn test_unknown_identity_synthesizes_default() {
        let store = detached_store();
        let profile = store.get_profile("acct_new").await;

        assert_eq!(profile.account_id, "acct_new");
        assert_eq!(profile.total_transactions, 0);
        assert!(!profile.is_mature);
        assert_eq!(profile.maturity_threshold, 20);
        assert_eq!(profile.spending.avg_amount, 50.0);
        assert_eq!(profile.spending.std_amount, 30.0);
    }

    #[tokio::test]
    async fn test_write_then_read_hits_local_cache() {
        let store = detached_store();
        let profile = sample_profile("acct_1");
        store.save_profile(&profile, false).await;

        let loaded = store.get_profile("acct_1").await;
        assert_eq!(loaded.total_transactions, 1);
        assert_eq!(loaded.recent_amounts, vec![42.0]);
    }

    #[tokio::test]
    async fn test_write_buffer_last_write_wins() {
        let store = detached_store();
        let mut profile = sample_profile("acct_1");
        store.save_profile(&profile, false).await;

        let ts = Utc.with_ymd_and_hms(2024, 3, 4, 11, 0, 0).unwrap();
        profile.update(100.0, ts, None, None);
        store.save_profile(&profile, false).await;

        assert_eq!(store.buffered_count().await, 1);
        let buffered = store.write_buffer.lock().await;
        assert_eq!(buffered["acct_1"].total_transactions, 2);
    }

    #[tokio::test]
    async fn test_buffer_retained_without_durable_tier() {
        let store = detached_store();
        store.save_profile(&sample_profile("acct_1"), false).await;
        store.save_profile(&sample_profile("acct_2"), false).await;

        // No durable tier: nothing to flush to, nothing lost.
        assert_eq!(store.flush_pending().await, 0);
        assert_eq!(store.buffered_count().await, 2);
    }

    #[tokio::test]
    async fn test_reset_clears_local_and_buffer() {
        let store = detached_store();
        store.save_profile(&sample_profile("acct_1"), false).await;

        store.reset("acct_1").await.unwrap();
        assert_eq!(store.buffered_count().await, 0);

        // A fresh read synthesizes a default again.
        let profile = store.get_profile("acct_1").await;
        assert_eq!(profile.total_transactions, 0);
    }

    #[tokio::test]
    async fn test_flush_worker_shutdown_completes() {
        let store = Arc::new(detached_store());
        store.save_profile(&sample_profile("acct_1"), false).await;

        let worker = store.start_flush_worker(Duration::from_secs(3600));
        // Shutdown must not wait for the next tick.
        tokio::time::timeout(Duration::from_secs(5), worker.shutdown())
            .await
            .expect("worker drained promptly");
    }
}
