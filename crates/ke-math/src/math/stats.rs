//! Sample statistics over residual sequences.

use serde::{Deserialize, Serialize};

/// Summary of a finite sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub count: usize,
    pub mean: f64,
    /// Unbiased sample variance (n - 1 denominator). Zero for a single sample.
    pub variance: f64,
}

impl SampleStats {
    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    /// Mean of squared values, `variance * (n-1)/n + mean²`.
    pub fn second_moment(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        self.variance * (n - 1.0).max(0.0) / n + self.mean * self.mean
    }
}

/// Compute count, mean, and unbiased variance using Welford's method.
///
/// Non-finite values are skipped. Returns `None` when no finite values remain.
pub fn sample_stats(values: &[f64]) -> Option<SampleStats> {
    let mut count = 0usize;
    let mut mean = 0.0;
    let mut m2 = 0.0;
    for &v in values.iter().filter(|v| v.is_finite()) {
        count += 1;
        let delta = v - mean;
        mean += delta / count as f64;
        m2 += delta * (v - mean);
    }
    if count == 0 {
        return None;
    }
    let variance = if count > 1 {
        m2 / (count - 1) as f64
    } else {
        0.0
    };
    Some(SampleStats {
        count,
        mean,
        variance,
    })
}

/// Clamp `value` into `[lo, hi]`, mapping NaN to `lo`.
pub fn clamp_finite(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_nan() {
        lo
    } else {
        value.clamp(lo, hi)
    }
}
