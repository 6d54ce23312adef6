//! In-process counters and statistics for the scoring engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;
use tracing::info;

/// Which tier satisfied a profile read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTier {
    Local,
    Fast,
    Durable,
    Synthesized,
}

/// Metrics collector for the scoring engine.
pub struct EngineMetrics {
    /// Feature extractions performed
    pub extractions: AtomicU64,
    /// Extractions that fell back to degraded defaults
    pub degraded_extractions: AtomicU64,
    /// Predictions served
    pub predictions: AtomicU64,

    local_hits: AtomicU64,
    fast_hits: AtomicU64,
    durable_hits: AtomicU64,
    synthesized: AtomicU64,

    flush_cycles: AtomicU64,
    flushed_profiles: AtomicU64,
    dropped_writes: AtomicU64,

    /// Normalized score distribution buckets
    score_buckets: RwLock<[u64; 10]>,
    start_time: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            extractions: AtomicU64::new(0),
            degraded_extractions: AtomicU64::new(0),
            predictions: AtomicU64::new(0),
            local_hits: AtomicU64::new(0),
            fast_hits: AtomicU64::new(0),
            durable_hits: AtomicU64::new(0),
            synthesized: AtomicU64::new(0),
            flush_cycles: AtomicU64::new(0),
            flushed_profiles: AtomicU64::new(0),
            dropped_writes: AtomicU64::new(0),
            score_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
        }
    }

    /// Record which tier satisfied a profile read.
    pub fn record_read(&self, tier: ReadTier) {
        let counter = match tier {
            ReadTier::Local => &self.local_hits,
            ReadTier::Fast => &self.fast_hits,
            ReadTier::Durable => &self.durable_hits,
            ReadTier::Synthesized => &self.synthesized,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a served prediction and its normalized score.
    pub fn record_score(&self, score: f64) {
        self.predictions.fetch_add(1, Ordering::Relaxed);
        let bucket = ((score * 10.0) as usize).min(9);
        if let Ok(mut buckets) = self.score_buckets.write() {
            buckets[bucket] += 1;
        }
    }

    /// Record one write-behind flush cycle.
    pub fn record_flush(&self, flushed: u64, dropped: u64) {
        self.flush_cycles.fetch_add(1, Ordering::Relaxed);
        self.flushed_profiles.fetch_add(flushed, Ordering::Relaxed);
        self.dropped_writes.fetch_add(dropped, Ordering::Relaxed);
    }

    /// Throughput since startup (scores per second).
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.predictions.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn score_distribution(&self) -> [u64; 10] {
        *self.score_buckets.read().unwrap()
    }

    /// Log a one-line summary of engine activity.
    pub fn log_summary(&self) {
        info!(
            extractions = self.extractions.load(Ordering::Relaxed),
            degraded = self.degraded_extractions.load(Ordering::Relaxed),
            predictions = self.predictions.load(Ordering::Relaxed),
            throughput = format!("{:.1}/s", self.throughput()),
            local_hits = self.local_hits.load(Ordering::Relaxed),
            fast_hits = self.fast_hits.load(Ordering::Relaxed),
            durable_hits = self.durable_hits.load(Ordering::Relaxed),
            synthesized = self.synthesized.load(Ordering::Relaxed),
            flush_cycles = self.flush_cycles.load(Ordering::Relaxed),
            flushed_profiles = self.flushed_profiles.load(Ordering::Relaxed),
            dropped_writes = self.dropped_writes.load(Ordering::Relaxed),
            "engine metrics"
        );
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
