//! Kalman estimation configuration loading and validation.
//!
//! This crate provides:
//! - Typed Rust structs for the engine configuration and per-metric profiles
//! - Config resolution (CLI → env → XDG → defaults)
//! - Semantic validation
//! - Config snapshots with a content hash for audit trails

pub mod engine;
pub mod resolve;
pub mod snapshot;
pub mod validate;

pub use engine::{
    AnomalyConfig, CalibrationConfig, EngineConfig, ForecastConfig, FusionConfig, MetricProfile,
    MetricProfiles, NumericsConfig, StoreConfig,
};
pub use resolve::{resolve_config, ConfigError, ConfigPaths, ConfigSource, ResolvedConfig};
pub use snapshot::ConfigSnapshot;
pub use validate::{ValidationError, ValidationResult};

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";
