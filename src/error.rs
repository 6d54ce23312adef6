//! Error taxonomy for the scoring engine.
//!
//! Two classes matter to callers: precondition errors (`ModelError`) are
//! always surfaced, while external dependency failures (`StoreError`) are
//! absorbed by the scoring path with degraded defaults.

use thiserror::Error;

/// Errors from the scoring model lifecycle and predict path.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("no model loaded; call train() or load() first")]
    NotLoaded,

    #[error("feature count mismatch: model expects {expected}, got {actual}")]
    FeatureCountMismatch { expected: usize, actual: usize },

    #[error("training set is empty")]
    EmptyTrainingSet,

    #[error("model lock poisoned")]
    LockPoisoned,

    #[error("model artifact I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("model artifact serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the cache and persistence tiers.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cache tier error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("durable tier error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("profile serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    #[error("tier not connected: {0}")]
    NotConnected(&'static str),
}

/// Top-level engine error.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
