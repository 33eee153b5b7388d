//! Forecaster: projects a filtered state forward with widening bands.
//!
//! For each step `k = 1..=horizon`:
//!
//! ```text
//! x_k = Fᵏ·x
//! P_k = Fᵏ·P·(Fᵏ)ᵗ + Σ_{j=1..k} Fʲ·Q·(Fʲ)ᵗ
//! ```
//!
//! Bands come from the value variance of `P_k`: 68% is ±1σ, 95% is ±1.96σ.

use ke_common::{Error, Forecast, MetricState, Result};
use ke_config::ForecastConfig;
use ke_math::Mat2;

/// Two-sided 95% normal quantile.
pub const Z_95: f64 = 1.96;

pub struct Forecaster<'a> {
    config: &'a ForecastConfig,
}

impl<'a> Forecaster<'a> {
    pub fn new(config: &'a ForecastConfig) -> Self {
        Self { config }
    }

    /// Validate a requested horizon against `1..=max_horizon`.
    pub fn check_horizon(&self, horizon: i64) -> Result<u32> {
        if horizon < 1 || horizon > i64::from(self.config.max_horizon) {
            return Err(Error::InvalidHorizon {
                horizon,
                max: self.config.max_horizon,
            });
        }
        Ok(horizon as u32)
    }

    /// Forecast `horizon` periods ahead of `state`.
    ///
    /// `model_confidence` starts at `1 / (1 + σ₁/|x₁|)` and then decays by
    /// `exp(-confidence_decay)` per step, further reduced as σ grows, so it
    /// strictly decreases with the horizon.
    pub fn forecast(&self, state: &MetricState, horizon: i64) -> Result<Vec<Forecast>> {
        let horizon = self.check_horizon(horizon)?;
        let ratio = state.metric.is_ratio();
        let step_decay = (-self.config.confidence_decay).exp();

        let mut forecasts = Vec::with_capacity(horizon as usize);
        let mut noise = Mat2::zero();
        let mut prev: Option<(f64, f64)> = None;

        for k in 1..=horizon {
            let f = Mat2::transition(f64::from(k));
            noise = noise.add(&state.process_noise.congruence(&f));
            let x = f.mul_vec(state.state_vector);
            let p = state.covariance_matrix.congruence(&f).add(&noise);
            let sigma = p.get(0, 0).max(0.0).sqrt();

            if !(x[0].is_finite() && sigma.is_finite()) {
                return Err(Error::NumericalInstability {
                    tenant: state.tenant.clone(),
                    metric: state.metric,
                    at: state.last_updated,
                    detail: format!("non-finite forecast at step {k}"),
                });
            }

            let confidence = match prev {
                None => 1.0 / (1.0 + sigma / x[0].abs().max(f64::EPSILON)),
                Some((prev_conf, prev_sigma)) => {
                    let widening = if sigma > 0.0 {
                        (prev_sigma / sigma).min(1.0)
                    } else {
                        1.0
                    };
                    prev_conf * step_decay * widening
                }
            };
            prev = Some((confidence, sigma));

            let bound = |v: f64| if ratio { v.clamp(0.0, 1.0) } else { v };
            forecasts.push(Forecast {
                metric: state.metric,
                horizon_day: k,
                predicted_value: bound(x[0]),
                ci68_lower: bound(x[0] - sigma),
                ci68_upper: bound(x[0] + sigma),
                ci95_lower: bound(x[0] - Z_95 * sigma),
                ci95_upper: bound(x[0] + Z_95 * sigma),
                model_confidence: confidence,
            });
        }
        Ok(forecasts)
    }
}
