use serde::{Deserialize, Serialize};

use crate::series::Sample;

/// Degenerate-denominator threshold for the OLS fit. Below this the input
/// has no usable spread in time and the fit collapses to a flat line.
const DENOM_EPSILON: f64 = 1e-10;

/// Linear trend `value = slope * time + intercept` over absolute unix
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub slope: f64,
    pub intercept: f64,
}

impl Trend {
    pub const ZERO: Trend = Trend {
        slope: 0.0,
        intercept: 0.0,
    };

    pub fn evaluate(&self, time: i64) -> f64 {
        self.slope * time as f64 + self.intercept
    }
}

/// Ordinary least squares over `(time, value)` pairs.
///
/// Fallbacks: fewer than two points returns `{0, v0}` (or `{0, 0}` when
/// empty); a degenerate time spread returns `{0, mean(v)}`. The fit is
/// computed in mean-centred time to keep the normal equations well
/// conditioned at unix-epoch magnitudes; the result is identical to the
/// uncentred formula.
pub fn fit(points: &[Sample]) -> Trend {
    let n = points.len();
    if n < 2 {
        return Trend {
            slope: 0.0,
            intercept: points.first().map(|p| p.value).unwrap_or(0.0),
        };
    }

    let nf = n as f64;
    let mean_t = points.iter().map(|p| p.time as f64).sum::<f64>() / nf;
    let mean_v = points.iter().map(|p| p.value).sum::<f64>() / nf;

    let mut denom = 0.0;
    let mut numer = 0.0;
    for p in points {
        let dt = p.time as f64 - mean_t;
        denom += dt * dt;
        numer += dt * (p.value - mean_v);
    }

    if denom < DENOM_EPSILON {
        tracing::info!(n = n, "degenerate time spread in trend fit, using flat mean");
        return Trend {
            slope: 0.0,
            intercept: mean_v,
        };
    }

    let slope = numer / denom;
    Trend {
        slope,
        intercept: mean_v - slope * mean_t,
    }
}

/// Fit a trend on `(time, value)` pairs given as parallel slices.
pub fn fit_xy(times: &[i64], values: &[f64]) -> Trend {
    let points: Vec<Sample> = times
        .iter()
        .zip(values.iter())
        .map(|(&time, &value)| Sample { time, value })
        .collect();
    fit(&points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(pairs: &[(i64, f64)]) -> Vec<Sample> {
        pairs
            .iter()
            .map(|&(time, value)| Sample { time, value })
            .collect()
    }

    #[test]
    fn empty_input_is_flat_zero() {
        let t = fit(&[]);
        assert_eq!(t, Trend::ZERO);
    }

    #[test]
    fn single_point_returns_its_value() {
        let t = fit(&samples(&[(100, 42.0)]));
        assert_eq!(t.slope, 0.0);
        assert_eq!(t.intercept, 42.0);
    }

    #[test]
    fn exact_line_is_recovered() {
        // v = 2t + 5
        let t = fit(&samples(&[(0, 5.0), (1, 7.0), (2, 9.0), (3, 11.0)]));
        assert!((t.slope - 2.0).abs() < 1e-12);
        assert!((t.intercept - 5.0).abs() < 1e-12);
    }

    #[test]
    fn identical_timestamps_fall_back_to_mean() {
        let t = fit(&samples(&[(50, 1.0), (50, 3.0), (50, 5.0)]));
        assert_eq!(t.slope, 0.0);
        assert!((t.intercept - 3.0).abs() < 1e-12);
    }

    #[test]
    fn unix_epoch_magnitudes_stay_finite_and_accurate() {
        // v = 0.001*(t - t0) + 10 at realistic unix times, 1-minute spacing.
        let t0 = 1_700_000_000_i64;
        let pts: Vec<Sample> = (0..1000)
            .map(|i| Sample {
                time: t0 + i * 60,
                value: 0.001 * (i * 60) as f64 + 10.0,
            })
            .collect();
        let t = fit(&pts);
        assert!(t.slope.is_finite() && t.intercept.is_finite());
        assert!((t.slope - 0.001).abs() < 1e-9);
        // Evaluating at t0 must give the original offset back.
        assert!((t.evaluate(t0) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn noisy_flat_series_has_near_zero_slope() {
        let pts: Vec<Sample> = (0..100)
            .map(|i| Sample {
                time: 1_700_000_000 + i * 300,
                value: 50.0 + if i % 2 == 0 { 0.5 } else { -0.5 },
            })
            .collect();
        let t = fit(&pts);
        assert!(t.slope.abs() < 1e-4);
        assert!((t.evaluate(1_700_000_000 + 50 * 300) - 50.0).abs() < 1.0);
    }
}
