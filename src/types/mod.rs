//! Core data types for the scoring engine

pub mod enrichment;
pub mod profile;

pub use enrichment::{FeatureEnrichment, ENRICHMENT_SCHEMA_VERSION};
pub use profile::{
    BehaviorProfile, MerchantPatterns, SpendingStats, TimePatterns, VelocityPatterns,
};
