//! Sliding-window transaction velocity counter.
//!
//! One redis sorted set per identity, keyed by event time. The insert,
//! prune, and expiry refresh are pipelined but not atomic: a crash or race
//! between them can transiently over- or under-count, which is an accepted
//! approximation of burst detection, not a correctness requirement.

use crate::config::VelocityConfig;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;

/// Per-identity sliding-window counter backed by redis sorted sets.
pub struct VelocityCounter {
    redis: Option<ConnectionManager>,
    window_secs: u64,
    op_timeout: Duration,
}

impl VelocityCounter {
    /// Create a counter over an already-established connection; `None`
    /// leaves every call degrading to a not-connected error the caller
    /// absorbs.
    pub fn new(redis: Option<ConnectionManager>, config: &VelocityConfig, op_timeout: Duration) -> Self {
        Self {
            redis,
            window_secs: config.window_secs,
            op_timeout,
        }
    }

    fn key(identity: &str) -> String {
        format!("velocity:{}", identity)
    }

    fn epoch_secs(timestamp: DateTime<Utc>) -> f64 {
        timestamp.timestamp_millis() as f64 / 1000.0
    }

    /// Record one transaction marker, prune markers older than the window,
    /// and push the structure's expiry out to twice the window so idle
    /// identities are reclaimed.
    pub async fn record(&self, identity: &str, timestamp: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self
            .redis
            .clone()
            .ok_or(StoreError::NotConnected("redis"))?;

        let key = Self::key(identity);
        let ts = Self::epoch_secs(timestamp);
        let cutoff = ts - self.window_secs as f64;

        let mut pipe = redis::pipe();
        pipe.cmd("ZADD").arg(&key).arg(ts).arg(ts.to_string()).ignore();
        pipe.cmd("ZREMRANGEBYSCORE").arg(&key).arg("-inf").arg(cutoff).ignore();
        pipe.cmd("EXPIRE").arg(&key).arg(self.window_secs * 2).ignore();

        self.bounded("velocity record", pipe.query_async::<_, ()>(&mut conn))
            .await?;

        debug!(identity = %identity, "velocity recorded");
        Ok(())
    }

    /// Number of markers inside the trailing window ending at `now`.
    pub async fn count(&self, identity: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self
            .redis
            .clone()
            .ok_or(StoreError::NotConnected("redis"))?;

        let key = Self::key(identity);
        let cutoff = Self::epoch_secs(now) - self.window_secs as f64;

        let mut zcount = redis::cmd("ZCOUNT");
        zcount.arg(&key).arg(cutoff).arg("+inf");
        let count: u64 = self
            .bounded("velocity count", zcount.query_async(&mut conn))
            .await?;

        Ok(count)
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout {
                operation,
                timeout_ms: self.op_timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_scheme() {
        assert_eq!(VelocityCounter::key("acct_42"), "velocity:acct_42");
    }

    #[test]
    fn test_epoch_conversion_keeps_subseconds() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_250).unwrap();
        assert!((VelocityCounter::epoch_secs(ts) - 1_700_000_000.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_disconnected_counter_errors() {
        let counter = VelocityCounter::new(
            None,
            &VelocityConfig { window_secs: 600 },
            Duration::from_millis(100),
        );
        let now = Utc::now();
        assert!(matches!(
            counter.count("acct_1", now).await,
            Err(StoreError::NotConnected(_))
        ));
        assert!(counter.record("acct_1", now).await.is_err());
    }
}
