//! Configuration management for the anomaly scoring engine

use anyhow::{Context, Result};
use config::{Config, File};
use serde::Deserialize;
use std::path::Path;

/// Main engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub velocity: VelocityConfig,
    pub model: ModelConfig,
    pub profile: ProfileConfig,
    pub retrain: RetrainConfig,
}

/// Cache and persistence tier configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Redis URL for the fast cache tier and velocity counters
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Postgres URL for the durable tier; `None` disables durable persistence
    #[serde(default)]
    pub database_url: Option<String>,
    /// TTL applied when a profile read repopulates the fast cache (seconds)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// TTL applied when feature extraction writes a profile through the
    /// fast cache (seconds)
    #[serde(default = "default_write_cache_ttl")]
    pub write_cache_ttl_secs: u64,
    /// Interval between write-behind flushes to the durable tier (seconds)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    /// Upper bound on any single cache or durable-store call (milliseconds)
    #[serde(default = "default_op_timeout")]
    pub op_timeout_ms: u64,
}

/// Sliding-window velocity counter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VelocityConfig {
    /// Rolling window span in seconds
    #[serde(default = "default_velocity_window")]
    pub window_secs: u64,
}

/// Scoring model configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Path for the serialized model artifact
    #[serde(default = "default_model_path")]
    pub artifact_path: String,
    /// Version label applied when loading the artifact at startup
    #[serde(default = "default_model_version")]
    pub version: String,
}

/// Behavioral profile tunables
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileConfig {
    /// Transactions required before personalized statistics are trusted
    #[serde(default = "default_maturity_threshold")]
    pub maturity_threshold: u64,
}

/// Scheduled retraining configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrainConfig {
    /// Hours between retrain cycles
    #[serde(default = "default_retrain_interval")]
    pub interval_hours: u64,
    /// Minimum training samples required to run a cycle
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Expected proportion of outliers in the training data
    #[serde(default = "default_contamination")]
    pub contamination: f64,
    /// Trees in the ensemble
    #[serde(default = "default_n_estimators")]
    pub n_estimators: usize,
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_write_cache_ttl() -> u64 {
    86400
}

fn default_flush_interval() -> u64 {
    60
}

fn default_op_timeout() -> u64 {
    2000
}

fn default_velocity_window() -> u64 {
    600
}

fn default_model_path() -> String {
    "models/current_model.json".to_string()
}

fn default_model_version() -> String {
    "v1.0.0".to_string()
}

fn default_maturity_threshold() -> u64 {
    20
}

fn default_retrain_interval() -> u64 {
    24
}

fn default_min_samples() -> usize {
    1000
}

fn default_contamination() -> f64 {
    0.05
}

fn default_n_estimators() -> usize {
    150
}

impl EngineConfig {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/engine.toml")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                redis_url: default_redis_url(),
                database_url: None,
                cache_ttl_secs: default_cache_ttl(),
                write_cache_ttl_secs: default_write_cache_ttl(),
                flush_interval_secs: default_flush_interval(),
                op_timeout_ms: default_op_timeout(),
            },
            velocity: VelocityConfig {
                window_secs: default_velocity_window(),
            },
            model: ModelConfig {
                artifact_path: default_model_path(),
                version: default_model_version(),
            },
            profile: ProfileConfig {
                maturity_threshold: default_maturity_threshold(),
            },
            retrain: RetrainConfig {
                interval_hours: default_retrain_interval(),
                min_samples: default_min_samples(),
                contamination: default_contamination(),
                n_estimators: default_n_estimators(),
            },
        }
    }
}
