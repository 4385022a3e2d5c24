use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_2_PI, PI};

use crate::series::Sample;
use crate::trend::Trend;

/// Relative contribution floor. Harmonics whose L1 energy over the window
/// falls below `T * (2/pi) * CONTRIBUTION_EPSILON` carry no visible signal
/// and are dropped before ranking.
const CONTRIBUTION_EPSILON: f64 = 1e-6;

/// One spectral line. `k = 0` encodes the DC offset (amplitude only);
/// `phase` is normalised to `(-pi, pi]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DftCoefficient {
    pub k: u32,
    pub amplitude: f64,
    pub phase: f64,
}

/// A detrended spectral model of one corridor bound: the retained
/// coefficients plus the trend that was removed before the transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DftModel {
    pub coefficients: Vec<DftCoefficient>,
    pub trend: Trend,
}

impl DftModel {
    /// DC amplitude of the model, 0 when no DC line was stored.
    pub fn dc_amplitude(&self) -> f64 {
        self.coefficients
            .iter()
            .find(|c| c.k == 0)
            .map(|c| c.amplitude)
            .unwrap_or(0.0)
    }

    /// Evaluate the model at absolute time `t` for a window anchored at
    /// `data_start` spanning `total_duration` seconds: the reconstructed
    /// wave plus the stored trend.
    pub fn evaluate(&self, t: i64, data_start: i64, total_duration: f64) -> f64 {
        let tau = if total_duration > 0.0 {
            (t - data_start) as f64 / total_duration
        } else {
            0.0
        };
        reconstruct(&self.coefficients, tau) + self.trend.evaluate(t)
    }
}

fn normalize_phase(phase: f64) -> f64 {
    // atan2 yields [-pi, pi]; fold the closed lower end onto pi.
    if phase <= -PI {
        phase + 2.0 * PI
    } else {
        phase
    }
}

fn coefficient(k: u32, re: f64, im: f64, norm: f64) -> DftCoefficient {
    let amplitude = (re * re + im * im).sqrt() / norm;
    let phase = if re == 0.0 && im == 0.0 {
        0.0
    } else {
        normalize_phase(im.atan2(re))
    };
    DftCoefficient { k, amplitude, phase }
}

/// Forward DFT over equispaced samples, `k in [0, N/2]`.
///
/// `amplitude = |S|/N` for the DC line and `|S|/(N/2)` otherwise, so a pure
/// cosine of amplitude A comes back with amplitude A at its harmonic.
pub fn transform_uniform(values: &[f64]) -> Vec<DftCoefficient> {
    let n = values.len();
    if n == 0 {
        return vec![DftCoefficient {
            k: 0,
            amplitude: 0.0,
            phase: 0.0,
        }];
    }

    let nf = n as f64;
    let mut out = Vec::with_capacity(n / 2 + 1);
    for k in 0..=(n / 2) as u32 {
        let mut re = 0.0;
        let mut im = 0.0;
        for (idx, &v) in values.iter().enumerate() {
            let angle = 2.0 * PI * k as f64 * idx as f64 / nf;
            re += v * angle.cos();
            im -= v * angle.sin();
        }
        let norm = if k == 0 { nf } else { nf / 2.0 };
        out.push(coefficient(k, re, im, norm));
    }
    out
}

/// Forward DFT over arbitrarily spaced samples.
///
/// Timestamps are normalised against the first sample and `total_duration`
/// declares the window length `T`. Each sample is weighted by its spacing
/// to the next sample (the last spacing is extended), which reduces to the
/// uniform transform on an equispaced grid.
pub fn transform_nonuniform(samples: &[Sample], total_duration: f64) -> Vec<DftCoefficient> {
    let n = samples.len();
    if n == 0 || total_duration <= 0.0 {
        return vec![DftCoefficient {
            k: 0,
            amplitude: 0.0,
            phase: 0.0,
        }];
    }

    let t0 = samples[0].time;
    let mut dts = Vec::with_capacity(n);
    for i in 0..n {
        let dt = if i + 1 < n {
            (samples[i + 1].time - samples[i].time) as f64
        } else if n >= 2 {
            (samples[n - 1].time - samples[n - 2].time) as f64
        } else {
            total_duration
        };
        dts.push(dt.max(0.0));
    }

    let mut out = Vec::with_capacity(n / 2 + 1);
    for k in 0..=(n / 2) as u32 {
        let mut re = 0.0;
        let mut im = 0.0;
        for (sample, &dt) in samples.iter().zip(dts.iter()) {
            let angle = 2.0 * PI * k as f64 * (sample.time - t0) as f64 / total_duration;
            re += sample.value * angle.cos() * dt;
            im -= sample.value * angle.sin() * dt;
        }
        let norm = if k == 0 {
            total_duration
        } else {
            total_duration / 2.0
        };
        out.push(coefficient(k, re, im, norm));
    }
    out
}

/// Per-harmonic contribution: the L1 energy of the reconstructed wave over
/// the window. For whole cycles this integrates to `amplitude * T * 2/pi`;
/// the DC line contributes `amplitude * T`.
fn contribution(coeff: &DftCoefficient, total_duration: f64) -> f64 {
    if coeff.k == 0 {
        coeff.amplitude * total_duration
    } else {
        coeff.amplitude * total_duration * FRAC_2_PI
    }
}

/// Rank harmonics by contribution and keep the strongest.
///
/// The DC line is always retained; the remainder is filtered against the
/// contribution floor, sorted by descending contribution (ties broken by
/// lower `k`), and capped at `max_harmonics` total coefficients.
/// Contribution-based ranking is used instead of raw amplitude because the
/// DC term dominates amplitude orderings.
pub fn select_harmonics(
    coefficients: Vec<DftCoefficient>,
    total_duration: f64,
    max_harmonics: usize,
) -> Vec<DftCoefficient> {
    let floor = total_duration * FRAC_2_PI * CONTRIBUTION_EPSILON;

    let dc = coefficients
        .iter()
        .find(|c| c.k == 0)
        .copied()
        .unwrap_or(DftCoefficient {
            k: 0,
            amplitude: 0.0,
            phase: 0.0,
        });

    let mut rest: Vec<DftCoefficient> = coefficients
        .into_iter()
        .filter(|c| c.k != 0 && contribution(c, total_duration) >= floor)
        .collect();
    rest.sort_by(|a, b| {
        contribution(b, total_duration)
            .partial_cmp(&contribution(a, total_duration))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.k.cmp(&b.k))
    });
    rest.truncate(max_harmonics.saturating_sub(1));

    let mut out = Vec::with_capacity(rest.len() + 1);
    out.push(dc);
    out.extend(rest);
    out
}

/// Evaluate the retained coefficients at normalised time
/// `tau = (t - data_start) / T`. The DC line contributes its amplitude;
/// every other line contributes `amplitude * cos(2*pi*k*tau + phase)`.
pub fn reconstruct(coefficients: &[DftCoefficient], tau: f64) -> f64 {
    coefficients
        .iter()
        .map(|c| {
            if c.k == 0 {
                c.amplitude
            } else {
                c.amplitude * (2.0 * PI * c.k as f64 * tau + c.phase).cos()
            }
        })
        .sum()
}
