//! Kalman filter estimation engine for multi-source business metrics.
//!
//! Pipeline per cycle, leaf-first:
//! - [`registry`]: declared trust and latency per source
//! - [`normalize`]: observation normalization and inverse-variance fusion
//! - [`filter`]: the Kalman core (predict, update, gain)
//! - [`anomaly`]: innovation thresholding
//! - [`forecast`]: forward projection with confidence bands
//! - [`calibrate`]: noise re-estimation from innovation history
//!
//! [`engine::Engine`] ties these to a [`ke_store::StateStore`] and exposes
//! the `estimate` / `get_state` / `calibrate` invocation surface.

pub mod anomaly;
pub mod api;
pub mod calibrate;
pub mod cli;
pub mod engine;
pub mod exit_codes;
pub mod filter;
pub mod forecast;
pub mod logging;
pub mod normalize;
pub mod registry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use anomaly::{AnomalyDetector, Detection};
pub use api::{
    ConfidenceInterval, EstimateRequest, EstimateResponse, InsightPayload, ObservationInput,
    StateView,
};
pub use calibrate::Calibrator;
pub use engine::Engine;
pub use exit_codes::ExitCode;
pub use filter::KalmanCore;
pub use forecast::Forecaster;
pub use normalize::{fuse_inverse_variance, FusionReport, Normalizer, WeightedReading};
pub use registry::SourceRegistry;
