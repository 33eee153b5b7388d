//! Error types for the Kalman estimation engine.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::id::{MetricKind, SourceId, TenantId};

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the engine.
///
/// Cycle-level failures carry tenant, metric, and the cycle timestamp so a
/// caller can retry; no state has been committed when any of these surface.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    // Input errors (20-29)
    #[error("no usable observations for {metric}")]
    NoObservations { metric: MetricKind },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("source {source_id} is not registered for {metric}")]
    SourceNotFound {
        source_id: SourceId,
        metric: MetricKind,
    },

    #[error("invalid forecast horizon {horizon} (must be within 1..={max})")]
    InvalidHorizon { horizon: i64, max: u32 },

    // Numerical errors (30-39)
    #[error("numerical instability for {tenant}/{metric} at {at}: {detail}")]
    NumericalInstability {
        tenant: TenantId,
        metric: MetricKind,
        at: DateTime<Utc>,
        detail: String,
    },

    // Lifecycle errors (40-49)
    #[error("{tenant}/{metric} has no filter state; initialize it first")]
    NotInitialized { tenant: TenantId, metric: MetricKind },

    #[error("{tenant}/{metric} is already initialized")]
    AlreadyInitialized { tenant: TenantId, metric: MetricKind },

    #[error("calibration was computed against model version {expected}, state is at {actual}")]
    StaleCalibration { expected: u64, actual: u64 },

    #[error("anomaly {0} not found")]
    AnomalyNotFound(String),

    // Persistence errors (50-59)
    #[error("persistence failure for {tenant}/{metric}{}: {reason}", fmt_at(.at))]
    PersistenceFailure {
        tenant: TenantId,
        metric: MetricKind,
        at: Option<DateTime<Utc>>,
        reason: String,
    },

    #[error("source registry persistence failure: {0}")]
    RegistryPersistence(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

fn fmt_at(at: &Option<DateTime<Utc>>) -> String {
    match at {
        Some(ts) => format!(" at {}", ts.to_rfc3339()),
        None => String::new(),
    }
}

impl Error {
    /// Returns the error code for this error type.
    /// Used for detailed error reporting in JSON output.
    pub fn code(&self) -> u32 {
        match self {
            Error::InvalidConfiguration(_) => 10,
            Error::NoObservations { .. } => 20,
            Error::InvalidInput(_) => 21,
            Error::SourceNotFound { .. } => 22,
            Error::InvalidHorizon { .. } => 23,
            Error::NumericalInstability { .. } => 30,
            Error::NotInitialized { .. } => 40,
            Error::AlreadyInitialized { .. } => 41,
            Error::StaleCalibration { .. } => 42,
            Error::AnomalyNotFound(_) => 43,
            Error::PersistenceFailure { .. } => 50,
            Error::RegistryPersistence(_) => 51,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }

    /// Stable snake_case name, used in JSON error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "invalid_configuration",
            Error::NoObservations { .. } => "no_observations",
            Error::InvalidInput(_) => "invalid_input",
            Error::SourceNotFound { .. } => "source_not_found",
            Error::InvalidHorizon { .. } => "invalid_horizon",
            Error::NumericalInstability { .. } => "numerical_instability",
            Error::NotInitialized { .. } => "not_initialized",
            Error::AlreadyInitialized { .. } => "already_initialized",
            Error::StaleCalibration { .. } => "stale_calibration",
            Error::AnomalyNotFound(_) => "anomaly_not_found",
            Error::PersistenceFailure { .. } => "persistence_failure",
            Error::RegistryPersistence(_) => "registry_persistence",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }

    /// Whether retrying the same request can succeed without caller changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PersistenceFailure { .. } | Error::RegistryPersistence(_) | Error::Io(_)
        )
    }
}
