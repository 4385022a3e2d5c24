use std::f64::consts::PI;

use crate::config::AutotuneParams;
use crate::series::Sample;
use crate::trend;

/// Minimum resampled length for spectral sweeping; shorter inputs fall
/// back to the raw window length.
const MIN_POINTS: usize = 8;

/// Variance floor below which a slice carries no signal worth scoring.
const VARIANCE_EPSILON: f64 = 1e-10;

/// Window weights below this cannot be meaningfully undone.
const WINDOW_EPSILON: f64 = 1e-3;

/// Number of spectral peaks used for the goodness-of-fit reconstruction.
const PEAK_COUNT: usize = 5;

/// Outcome of one auto-tune run, memoised in the permanent cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutotuneResult {
    /// Historical window length that spans a whole number of the dominant
    /// cycle, in days.
    pub optimal_period_days: f64,
    /// Winning harmonic index within the winning slice.
    pub harmonic: u32,
    /// Winning score `(peak_power / median_power) * R^2`.
    pub factor: f64,
}

/// Choose `historical_period_days` so the fitted corridor spans an integer
/// number of the dominant cycle.
///
/// The input is trimmed of its leading all-zero prefix, resampled onto a
/// uniform `step_hours` grid, then swept: progressively shorter prefixes
/// are detrended, optionally Hann-windowed, and scored by how well their
/// five strongest spectral peaks reconstruct the slice. The winning
/// `(cut, k)` determines the dominant period; the returned window is the
/// largest whole multiple of that period that fits the data.
pub fn optimal_period(points: &[Sample], params: &AutotuneParams) -> AutotuneResult {
    let step_secs = (params.step_hours * 3600.0).max(1.0);

    let trimmed = trim_leading_zeros(points);
    let values = resample(trimmed, step_secs);
    let n = values.len();
    let total_hours = n as f64 * params.step_hours;

    if n < MIN_POINTS {
        return AutotuneResult {
            optimal_period_days: total_hours / 24.0,
            harmonic: 0,
            factor: 0.0,
        };
    }

    let mut best: Option<(f64, usize, u32)> = None; // (score, slice_len, k)

    for cut in 0..=(n - MIN_POINTS) {
        let m = n - cut;
        let slice = &values[..m];
        if let Some((score, k)) = score_slice(slice, step_secs, params.hann_window) {
            let better = match best {
                Some((best_score, _, _)) => score > best_score,
                None => true,
            };
            if better {
                best = Some((score, m, k));
            }
        }
    }

    let Some((factor, m, k)) = best else {
        return AutotuneResult {
            optimal_period_days: total_hours / 24.0,
            harmonic: 0,
            factor: 0.0,
        };
    };

    let period_hours = m as f64 / k as f64 * params.step_hours;
    let whole_periods = (total_hours / period_hours).floor().max(1.0);
    AutotuneResult {
        optimal_period_days: whole_periods * period_hours / 24.0,
        harmonic: k,
        factor,
    }
}

fn trim_leading_zeros(points: &[Sample]) -> &[Sample] {
    let skip = points.iter().take_while(|p| p.value == 0.0).count();
    &points[skip..]
}

/// Linear interpolation of the input onto a uniform grid. Grid points
/// outside the sampled range would be NaN and are simply not produced.
fn resample(points: &[Sample], step_secs: f64) -> Vec<f64> {
    if points.len() < 2 {
        return points.iter().map(|p| p.value).collect();
    }

    let t0 = points[0].time as f64;
    let t_end = points[points.len() - 1].time as f64;
    let n = ((t_end - t0) / step_secs).floor() as usize + 1;

    let mut out = Vec::with_capacity(n);
    let mut cursor = 0usize;
    for i in 0..n {
        let t = t0 + i as f64 * step_secs;
        while cursor + 1 < points.len() && (points[cursor + 1].time as f64) < t {
            cursor += 1;
        }
        let a = &points[cursor];
        let b = &points[(cursor + 1).min(points.len() - 1)];
        let value = if b.time == a.time {
            a.value
        } else {
            let frac = (t - a.time as f64) / (b.time - a.time) as f64;
            a.value + (b.value - a.value) * frac.clamp(0.0, 1.0)
        };
        if value.is_finite() {
            out.push(value);
        }
    }
    out
}

/// Score one slice: detrend, window, spectrum, top-five reconstruction,
/// `(peak/median) * R^2`. Returns the score and the dominant harmonic, or
/// `None` when the slice is spectrally empty or degenerate.
fn score_slice(slice: &[f64], step_secs: f64, hann: bool) -> Option<(f64, u32)> {
    let m = slice.len();
    let k_max = m / 4;
    if k_max < 2 {
        return None;
    }

    let times: Vec<i64> = (0..m).map(|i| (i as f64 * step_secs) as i64).collect();
    let fitted = trend::fit_xy(&times, slice);
    let detrended: Vec<f64> = slice
        .iter()
        .zip(times.iter())
        .map(|(&v, &t)| v - fitted.evaluate(t))
        .collect();

    let window: Vec<f64> = (0..m)
        .map(|j| {
            if hann {
                0.5 * (1.0 - (2.0 * PI * j as f64 / (m - 1) as f64).cos())
            } else {
                1.0
            }
        })
        .collect();
    let windowed: Vec<f64> = detrended.iter().zip(window.iter()).map(|(v, w)| v * w).collect();

    // Direct power spectrum for k in [1, m/4 - 1].
    let mut spectrum: Vec<(u32, f64, f64, f64)> = Vec::with_capacity(k_max - 1); // (k, re, im, power)
    for k in 1..k_max {
        let mut re = 0.0;
        let mut im = 0.0;
        for (j, &x) in windowed.iter().enumerate() {
            let angle = 2.0 * PI * k as f64 * j as f64 / m as f64;
            re += x * angle.cos();
            im -= x * angle.sin();
        }
        spectrum.push((k as u32, re, im, re * re + im * im));
    }
    if spectrum.is_empty() {
        return None;
    }

    let mut powers: Vec<f64> = spectrum.iter().map(|s| s.3).collect();
    powers.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = powers[powers.len() / 2];
    let peak = *powers.last().unwrap();
    if peak <= 0.0 {
        return None;
    }

    let mut ranked = spectrum.clone();
    ranked.sort_by(|a, b| b.3.partial_cmp(&a.3).unwrap_or(std::cmp::Ordering::Equal));
    let peaks = &ranked[..ranked.len().min(PEAK_COUNT)];
    let dominant_k = ranked[0].0;

    // Reconstruct from the peak pairs, undo the window, restore the trend,
    // and measure the error against the original slice. Points where the
    // window vanishes cannot be un-windowed and are left out of the error.
    let mut sq_err = 0.0;
    let mut counted = 0usize;
    for j in 0..m {
        if window[j] < WINDOW_EPSILON {
            continue;
        }
        let mut recon = 0.0;
        for &(k, re, im, _) in peaks {
            let angle = 2.0 * PI * k as f64 * j as f64 / m as f64;
            recon += 2.0 / m as f64 * (re * angle.cos() - im * angle.sin());
        }
        let restored = recon / window[j] + fitted.evaluate(times[j]);
        let err = restored - slice[j];
        sq_err += err * err;
        counted += 1;
    }
    if counted == 0 {
        return None;
    }

    let mean = slice.iter().sum::<f64>() / m as f64;
    let variance = slice.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / m as f64;
    if variance < VARIANCE_EPSILON {
        return None;
    }

    let r2 = 1.0 - (sq_err / counted as f64) / variance;
    let flatness = if median > 0.0 { peak / median } else { peak / VARIANCE_EPSILON };
    Some((flatness * r2, dominant_k))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(step_hours: f64, hann: bool) -> AutotuneParams {
        AutotuneParams {
            step_hours,
            hann_window: hann,
        }
    }

    fn daily_sine(days: i64, step_secs: i64) -> Vec<Sample> {
        let n = days * 86_400 / step_secs;
        (0..n)
            .map(|i| {
                let t = i * step_secs;
                Sample {
                    time: t,
                    value: 100.0 + 20.0 * (2.0 * PI * t as f64 / 86_400.0).sin(),
                }
            })
            .collect()
    }

    #[test]
    fn short_input_falls_back_to_window_length() {
        let points: Vec<Sample> = (0..5)
            .map(|i| Sample {
                time: i * 14_400,
                value: 1.0,
            })
            .collect();
        let result = optimal_period(&points, &params(4.0, true));
        assert_eq!(result.harmonic, 0);
        // 5 points at 4h resample to 5 grid slots: 20h = 0.833 days.
        assert!((result.optimal_period_days - 5.0 * 4.0 / 24.0).abs() < 1e-9);
    }

    #[test]
    fn empty_input_yields_zero_days() {
        let result = optimal_period(&[], &params(4.0, true));
        assert_eq!(result.optimal_period_days, 0.0);
    }

    #[test]
    fn leading_zero_prefix_is_trimmed() {
        let mut points: Vec<Sample> = (0..10)
            .map(|i| Sample {
                time: i * 14_400,
                value: 0.0,
            })
            .collect();
        points.extend((10..15).map(|i| Sample {
            time: i * 14_400,
            value: 2.0,
        }));
        let result = optimal_period(&points, &params(4.0, true));
        // Only the 5 non-zero points remain: short-input fallback.
        assert_eq!(result.harmonic, 0);
        assert!((result.optimal_period_days - 5.0 * 4.0 / 24.0).abs() < 1e-9);
    }

    #[test]
    fn daily_cycle_is_recovered() {
        let points = daily_sine(7, 3600);
        let result = optimal_period(&points, &params(4.0, true));
        // The dominant period is 24h; the window should be a whole number
        // of days close to the full week.
        assert!(result.harmonic >= 1);
        assert!(
            result.optimal_period_days >= 5.5 && result.optimal_period_days <= 7.5,
            "period {} days",
            result.optimal_period_days
        );
        assert!(result.factor > 0.0);
    }

    #[test]
    fn daily_cycle_without_hann_window() {
        let points = daily_sine(7, 3600);
        let result = optimal_period(&points, &params(4.0, false));
        assert!(
            result.optimal_period_days >= 5.5 && result.optimal_period_days <= 7.5,
            "period {} days",
            result.optimal_period_days
        );
    }

    #[test]
    fn flat_series_scores_nothing_and_falls_back() {
        let points: Vec<Sample> = (0..50)
            .map(|i| Sample {
                time: i * 14_400,
                value: 10.0,
            })
            .collect();
        let result = optimal_period(&points, &params(4.0, true));
        // Zero variance everywhere: no slice scores, window-length fallback.
        assert_eq!(result.harmonic, 0);
        assert!(result.optimal_period_days > 0.0);
    }

    #[test]
    fn resampling_interpolates_gaps() {
        let points = vec![
            Sample { time: 0, value: 0.0 },
            Sample {
                time: 28_800,
                value: 8.0,
            },
        ];
        let values = resample(&points, 14_400.0);
        assert_eq!(values, vec![0.0, 4.0, 8.0]);
    }
}
