//! Calibrator: re-estimates noise from retained innovation history.
//!
//! A well-tuned filter produces normalized residuals with unit variance.
//! Variance above the tolerance band means the filter is overconfident (Q or
//! R too small); below means it is underconfident. The result is only a
//! recommendation; [`apply`] is a separate, explicit step.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info};

use ke_common::{
    CalibrationResult, CalibrationVerdict, Error, EvaluationWindow, Innovation, MetricState, Result,
    SourceId,
};
use ke_config::CalibrationConfig;
use ke_math::{clamp_finite, sample_stats};

/// Evaluates innovation history against the calibration policy.
pub struct Calibrator<'a> {
    config: &'a CalibrationConfig,
    config_hash: &'a str,
}

impl<'a> Calibrator<'a> {
    pub fn new(config: &'a CalibrationConfig, config_hash: &'a str) -> Self {
        Self {
            config,
            config_hash,
        }
    }

    fn verdict_for(&self, variance: f64) -> CalibrationVerdict {
        if variance > self.config.tolerance_high {
            CalibrationVerdict::Overconfident
        } else if variance < self.config.tolerance_low {
            CalibrationVerdict::Underconfident
        } else {
            CalibrationVerdict::Calibrated
        }
    }

    /// Scale factor `observed / 1.0`, clipped to the configured range.
    fn scale_for(&self, variance: f64) -> f64 {
        clamp_finite(variance, self.config.min_scale, self.config.max_scale)
    }

    /// Compute a [`CalibrationResult`] from the most recent innovations.
    pub fn evaluate(
        &self,
        state: &MetricState,
        innovations: &[Innovation],
        now: DateTime<Utc>,
    ) -> CalibrationResult {
        let start = innovations.len().saturating_sub(self.config.window);
        let window = &innovations[start..];
        let residuals: Vec<f64> = window.iter().map(|i| i.normalized_residual).collect();
        let stats = sample_stats(&residuals);
        let samples = stats.map_or(0, |s| s.count);

        let mut by_source: BTreeMap<SourceId, Vec<f64>> = BTreeMap::new();
        for innovation in window {
            if let Some(source) = &innovation.source_id {
                by_source
                    .entry(source.clone())
                    .or_default()
                    .push(innovation.normalized_residual);
            }
        }
        let source_variances: BTreeMap<SourceId, f64> = by_source
            .iter()
            .filter_map(|(source, values)| {
                sample_stats(values)
                    .filter(|s| s.count >= 2)
                    .map(|s| (source.clone(), s.variance))
            })
            .collect();

        let evaluation_window = EvaluationWindow {
            start: window.first().map(|i| i.timestamp),
            end: window.last().map(|i| i.timestamp),
            samples,
            requested: self.config.window,
        };

        let mut result = CalibrationResult {
            tenant: state.tenant.clone(),
            metric: state.metric,
            verdict: CalibrationVerdict::InsufficientData,
            observed_variance: stats.map(|s| s.variance),
            residual_mean: stats.map(|s| s.mean),
            q_scale: 1.0,
            current_q: state.process_noise,
            recommended_q: state.process_noise,
            source_variances,
            recommended_r_per_source: BTreeMap::new(),
            evaluation_window,
            based_on_version: state.model_version,
            config_hash: self.config_hash.to_string(),
            generated_at: now,
        };

        let Some(stats) = stats.filter(|s| s.count >= self.config.min_samples) else {
            debug!(
                tenant = %state.tenant,
                metric = %state.metric,
                samples,
                required = self.config.min_samples,
                "not enough innovations to calibrate"
            );
            return result;
        };

        result.verdict = self.verdict_for(stats.variance);
        if result.verdict != CalibrationVerdict::Calibrated {
            result.q_scale = self.scale_for(stats.variance);
            result.recommended_q = state.process_noise.scale(result.q_scale);
        }

        for (source, values) in &by_source {
            let Some(source_stats) = sample_stats(values) else {
                continue;
            };
            if source_stats.count < self.config.min_samples {
                continue;
            }
            if self.verdict_for(source_stats.variance) != CalibrationVerdict::Calibrated {
                let factor = self.scale_for(source_stats.variance);
                result
                    .recommended_r_per_source
                    .insert(source.clone(), state.noise_scale_for(source) * factor);
            }
        }

        info!(
            tenant = %state.tenant,
            metric = %state.metric,
            verdict = ?result.verdict,
            observed_variance = stats.variance,
            q_scale = result.q_scale,
            sources_adjusted = result.recommended_r_per_source.len(),
            "calibration evaluated"
        );
        result
    }
}

/// Apply a reviewed calibration to `state`, bumping `model_version`.
///
/// Fails with [`Error::StaleCalibration`] if the state moved to another model
/// version since the result was computed. A result that recommends nothing
/// returns the state unchanged.
pub fn apply(result: &CalibrationResult, state: &MetricState) -> Result<MetricState> {
    if result.tenant != state.tenant || result.metric != state.metric {
        return Err(Error::InvalidInput(format!(
            "calibration for {}/{} cannot apply to {}/{}",
            result.tenant, result.metric, state.tenant, state.metric
        )));
    }
    if result.based_on_version != state.model_version {
        return Err(Error::StaleCalibration {
            expected: result.based_on_version,
            actual: state.model_version,
        });
    }
    if !result.recommends_change() {
        return Ok(state.clone());
    }
    if !(result.recommended_q.is_finite() && result.recommended_q.is_psd(1e-12)) {
        return Err(Error::InvalidInput(
            "recommended process noise is not a finite PSD matrix".to_string(),
        ));
    }
    if let Some((source, scale)) = result
        .recommended_r_per_source
        .iter()
        .find(|(_, s)| !(s.is_finite() && **s > 0.0))
    {
        return Err(Error::InvalidInput(format!(
            "recommended R multiplier for {source} must be positive, got {scale}"
        )));
    }

    let mut next = state.clone();
    next.process_noise = result.recommended_q;
    for (source, scale) in &result.recommended_r_per_source {
        next.source_noise_scale.insert(source.clone(), *scale);
    }
    next.model_version += 1;
    info!(
        tenant = %state.tenant,
        metric = %state.metric,
        model_version = next.model_version,
        q_scale = result.q_scale,
        "calibration applied"
    );
    Ok(next)
}
