use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::anomaly::CompressedStats;
use crate::config::CorridorParams;
use crate::fourier::{self, DftModel};
use crate::series::Sample;
use crate::trend::{self, Trend};

/// Corridor metadata persisted alongside the two spectral models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorridorMeta {
    pub data_start: i64,
    pub step: i64,
    pub total_duration: i64,
    pub config_hash: String,
    pub rebuild_count: u64,
    pub labels: Map<String, Value>,
    pub created_at: i64,
    pub anomaly_stats: CompressedStats,
}

/// The full cache value for one `(query, series)` fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorridorPayload {
    pub meta: CorridorMeta,
    pub dft_upper: DftModel,
    pub dft_lower: DftModel,
}

/// Per-grid-point envelope of the history window: the bounding rule that
/// feeds the corridor constructor. Buckets the history onto the grid and
/// takes the per-bucket extrema; empty buckets are filled by linear
/// interpolation between occupied neighbours (endpoints carried).
#[derive(Debug, Clone)]
pub struct Bounds {
    pub times: Vec<i64>,
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
    pub step: i64,
}

pub fn bounds_from_history(points: &[Sample], start: i64, end: i64, step: i64) -> Option<Bounds> {
    if step <= 0 || end <= start || points.is_empty() {
        return None;
    }
    let n = ((end - start) / step) as usize;
    if n == 0 {
        return None;
    }

    let mut upper: Vec<Option<f64>> = vec![None; n];
    let mut lower: Vec<Option<f64>> = vec![None; n];
    for p in points {
        if p.time < start || p.time >= end {
            continue;
        }
        let idx = ((p.time - start) / step) as usize;
        if idx >= n {
            continue;
        }
        upper[idx] = Some(upper[idx].map_or(p.value, |u: f64| u.max(p.value)));
        lower[idx] = Some(lower[idx].map_or(p.value, |l: f64| l.min(p.value)));
    }

    if !upper.iter().any(Option::is_some) {
        return None;
    }

    Some(Bounds {
        times: (0..n).map(|i| start + i as i64 * step).collect(),
        upper: fill_gaps(&upper),
        lower: fill_gaps(&lower),
        step,
    })
}

/// Fill unoccupied buckets by linear interpolation between the nearest
/// occupied neighbours; runs before the first (after the last) occupied
/// bucket carry its value.
fn fill_gaps(values: &[Option<f64>]) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![0.0; n];
    let occupied: Vec<usize> = (0..n).filter(|&i| values[i].is_some()).collect();

    let first = occupied[0];
    let last = occupied[occupied.len() - 1];
    for i in 0..n {
        out[i] = if i <= first {
            values[first].unwrap()
        } else if i >= last {
            values[last].unwrap()
        } else {
            match values[i] {
                Some(v) => v,
                None => {
                    let prev = *occupied.iter().rev().find(|&&j| j < i).unwrap();
                    let next = *occupied.iter().find(|&&j| j > i).unwrap();
                    let frac = (i - prev) as f64 / (next - prev) as f64;
                    let a = values[prev].unwrap();
                    let b = values[next].unwrap();
                    a + (b - a) * frac
                }
            }
        };
    }
    out
}

/// Fit both bound trends, optionally forcing a shared slope.
///
/// With `use_common_trend` the two slopes are replaced by their mean and
/// each intercept is recomputed so the bound's own mean is preserved —
/// keeping the corridor parallel over long restore windows without
/// discarding asymmetric offsets.
fn bound_trends(bounds: &Bounds, use_common_trend: bool) -> (Trend, Trend) {
    let trend_upper = trend::fit_xy(&bounds.times, &bounds.upper);
    let trend_lower = trend::fit_xy(&bounds.times, &bounds.lower);
    if !use_common_trend {
        return (trend_upper, trend_lower);
    }

    let slope = (trend_upper.slope + trend_lower.slope) / 2.0;
    let nf = bounds.times.len() as f64;
    let mean_t = bounds.times.iter().map(|&t| t as f64).sum::<f64>() / nf;
    let mean_u = bounds.upper.iter().sum::<f64>() / nf;
    let mean_l = bounds.lower.iter().sum::<f64>() / nf;
    (
        Trend {
            slope,
            intercept: mean_u - slope * mean_t,
        },
        Trend {
            slope,
            intercept: mean_l - slope * mean_t,
        },
    )
}

/// Build a corridor payload from history bounds: fit trends, detrend each
/// bound, transform, keep the strongest harmonics.
pub fn build(
    bounds: &Bounds,
    params: &CorridorParams,
    config_hash: String,
    labels: Map<String, Value>,
    rebuild_count: u64,
    anomaly_stats: CompressedStats,
    created_at: i64,
) -> CorridorPayload {
    let n = bounds.times.len();
    let total_duration = n as i64 * bounds.step;
    let (trend_upper, trend_lower) = bound_trends(bounds, params.use_common_trend);

    let model = |values: &[f64], trend: Trend| {
        let detrended: Vec<f64> = values
            .iter()
            .zip(bounds.times.iter())
            .map(|(&v, &t)| v - trend.evaluate(t))
            .collect();
        let coefficients = fourier::select_harmonics(
            fourier::transform_uniform(&detrended),
            total_duration as f64,
            params.max_harmonics,
        );
        DftModel {
            coefficients,
            trend,
        }
    };

    CorridorPayload {
        meta: CorridorMeta {
            data_start: bounds.times.first().copied().unwrap_or(0),
            step: bounds.step,
            total_duration,
            config_hash,
            rebuild_count,
            labels,
            created_at,
            anomaly_stats,
        },
        dft_upper: model(&bounds.upper, trend_upper),
        dft_lower: model(&bounds.lower, trend_lower),
    }
}

/// A corridor evaluated on a request grid, width-repaired.
#[derive(Debug, Clone)]
pub struct RestoredCorridor {
    pub times: Vec<i64>,
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
    /// The minimum-width bound enforced by the repair pass.
    pub min_width: f64,
}

/// Restore a stored corridor over `[qs, qe]` with step `qstep`.
///
/// Each grid point evaluates both spectral models at the time normalised
/// against the stored window. When `scale_corridor` is set and the request
/// step differs from the history step, every corridor value is multiplied
/// by `qstep/hstep`; the repair threshold is evaluated against the scaled
/// DC amplitudes so the enforced width tracks the emitted scale.
pub fn restore(
    payload: &CorridorPayload,
    qs: i64,
    qe: i64,
    qstep: i64,
    params: &CorridorParams,
) -> RestoredCorridor {
    let mut times = Vec::new();
    let mut t = qs;
    while t <= qe {
        times.push(t);
        t += qstep.max(1);
    }

    let data_start = payload.meta.data_start;
    let total = payload.meta.total_duration as f64;
    let mut upper: Vec<f64> = times
        .iter()
        .map(|&t| payload.dft_upper.evaluate(t, data_start, total))
        .collect();
    let mut lower: Vec<f64> = times
        .iter()
        .map(|&t| payload.dft_lower.evaluate(t, data_start, total))
        .collect();

    let mut scale = 1.0;
    if params.scale_corridor && qstep != payload.meta.step && payload.meta.step > 0 {
        scale = qstep as f64 / payload.meta.step as f64;
        for v in upper.iter_mut().chain(lower.iter_mut()) {
            *v *= scale;
        }
    }

    let min_width = minimum_width(
        payload.dft_upper.dc_amplitude() * scale,
        payload.dft_lower.dc_amplitude() * scale,
        params.min_width_factor,
    );
    repair_width(&mut upper, &mut lower, min_width);

    RestoredCorridor {
        times,
        upper,
        lower,
        min_width,
    }
}

/// Width floor for the repair pass: `factor * |amp_u0 - amp_l0|`, falling
/// back to `factor * max(|amp_u0|, |amp_l0|, 1)` when the DC lines cancel.
pub fn minimum_width(amp_upper_0: f64, amp_lower_0: f64, factor: f64) -> f64 {
    let spread = (amp_upper_0 - amp_lower_0).abs();
    if spread > 0.0 {
        factor * spread
    } else {
        factor * amp_upper_0.abs().max(amp_lower_0.abs()).max(1.0)
    }
}

/// Enforce `upper[i] - lower[i] >= min_width` at every grid point.
///
/// Points whose width already satisfies the bound act as anchors, extended
/// to the window endpoints by copying the first and last anchor. Points
/// below the bound get both values linearly interpolated between the
/// neighbouring anchors. With no anchor at all the corridor is flattened
/// to a constant band of width `min_width` centred on the corridor
/// midline mean.
pub fn repair_width(upper: &mut [f64], lower: &mut [f64], min_width: f64) {
    let n = upper.len().min(lower.len());
    if n == 0 || min_width <= 0.0 {
        return;
    }

    let anchors: Vec<usize> = (0..n).filter(|&i| upper[i] - lower[i] >= min_width).collect();

    if anchors.is_empty() {
        let center = (0..n).map(|i| (upper[i] + lower[i]) / 2.0).sum::<f64>() / n as f64;
        for i in 0..n {
            upper[i] = center + min_width / 2.0;
            lower[i] = center - min_width / 2.0;
        }
        return;
    }

    // Effective anchor list with the endpoints backfilled from the nearest
    // real anchor.
    let mut effective: Vec<(usize, f64, f64)> = Vec::with_capacity(anchors.len() + 2);
    let first = anchors[0];
    let last = anchors[anchors.len() - 1];
    if first > 0 {
        effective.push((0, upper[first], lower[first]));
    }
    effective.extend(anchors.iter().map(|&i| (i, upper[i], lower[i])));
    if last < n - 1 {
        effective.push((n - 1, upper[last], lower[last]));
    }

    for w in effective.windows(2) {
        let (i0, u0, l0) = w[0];
        let (i1, u1, l1) = w[1];
        for i in i0..=i1 {
            if upper[i] - lower[i] >= min_width {
                continue;
            }
            let frac = if i1 == i0 {
                0.0
            } else {
                (i - i0) as f64 / (i1 - i0) as f64
            };
            upper[i] = u0 + (u1 - u0) * frac;
            lower[i] = l0 + (l1 - l0) * frac;
        }
    }
}
