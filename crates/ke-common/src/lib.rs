//! Kalman estimation common types, IDs, and errors.
//!
//! This crate provides foundational types shared across the engine crates:
//! - Tenant, source, and metric identity types
//! - The per-metric data model (state, observations, innovations, anomalies, forecasts)
//! - Schema versioning
//! - The unified error type
//! - Output formats

pub mod error;
pub mod id;
pub mod model;
pub mod output;
pub mod schema;

pub use error::{Error, Result};
pub use id::{MetricKey, MetricKind, SourceId, TenantId};
pub use model::{
    Anomaly, AnomalyStatus, CalibrationResult, CalibrationVerdict, DownweightReview,
    EvaluationWindow, FilterPhase, Forecast, FusedMeasurement, Innovation, MetricState,
    Observation, PredictionAnchor, RegistrySnapshot, Severity, SourceDescriptor, SourceWeight,
};
pub use output::OutputFormat;
pub use schema::SCHEMA_VERSION;
