use serde::{Deserialize, Serialize};

use crate::config::AnomalyParams;
use crate::series::Sample;

/// Guard against a zero-width corridor when normalising deviations.
const WIDTH_EPSILON: f64 = 1e-9;

/// Number of slots in a compressed history array.
pub const COMPRESSED_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Above,
    Below,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Above => "above",
            Direction::Below => "below",
        }
    }
}

/// Raw exceedance statistics for one direction over one window.
#[derive(Debug, Clone)]
pub struct DirectionStats {
    pub direction: Direction,
    /// Share of the window spent outside the corridor, percent, 2 decimals.
    pub time_outside_percent: f64,
    /// Number of exceedance points.
    pub anomaly_count: u64,
    /// Segment durations in seconds (a single-point segment has duration 0).
    pub durations: Vec<f64>,
    /// Per-point deviation normalised by corridor width.
    pub sizes: Vec<f64>,
}

impl DirectionStats {
    fn empty(direction: Direction) -> Self {
        DirectionStats {
            direction,
            time_outside_percent: 0.0,
            anomaly_count: 0,
            durations: Vec::new(),
            sizes: Vec::new(),
        }
    }
}

/// Both directions of one window.
#[derive(Debug, Clone)]
pub struct AnomalyStats {
    pub above: DirectionStats,
    pub below: DirectionStats,
}

impl AnomalyStats {
    /// Combined view: the two `time_outside_percent` values averaged, the
    /// counts summed.
    pub fn combined_time_outside_percent(&self) -> f64 {
        round2((self.above.time_outside_percent + self.below.time_outside_percent) / 2.0)
    }

    pub fn combined_count(&self) -> u64 {
        self.above.anomaly_count + self.below.anomaly_count
    }
}

/// Fixed-size historical statistics for one direction, as persisted in the
/// corridor metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedDirectionStats {
    pub direction: Direction,
    pub time_outside_percent: f64,
    pub anomaly_count: u64,
    pub durations: [f64; COMPRESSED_LEN],
    pub sizes: [f64; COMPRESSED_LEN],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedStats {
    pub above: CompressedDirectionStats,
    pub below: CompressedDirectionStats,
}

/// Concern scores for one direction.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectionConcern {
    pub duration_concern: f64,
    pub size_concern: f64,
    /// `duration_concern + size_concern`.
    pub total: f64,
    /// `total * rolling_window`.
    pub sum: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConcernScore {
    pub above: DirectionConcern,
    pub below: DirectionConcern,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Classify every point of a window against an index-aligned corridor.
///
/// A point is `above` iff `value > upper[i]`, `below` iff
/// `value < lower[i]`. Each exceedance contributes `step` seconds of
/// outside time and one normalised deviation sample; exceedance runs with
/// gaps of at most one step form segments whose duration is
/// `last - first`.
pub fn detect(points: &[Sample], upper: &[f64], lower: &[f64], step: i64) -> AnomalyStats {
    let n = points.len().min(upper.len()).min(lower.len());
    let mut above = DirectionStats::empty(Direction::Above);
    let mut below = DirectionStats::empty(Direction::Below);
    if n == 0 || step <= 0 {
        return AnomalyStats { above, below };
    }

    let total_duration = (n as i64 * step) as f64;
    let mut above_times = Vec::new();
    let mut below_times = Vec::new();
    let mut above_time = 0.0;
    let mut below_time = 0.0;

    for i in 0..n {
        let value = points[i].value;
        let width = (upper[i] - lower[i]).max(WIDTH_EPSILON);
        if value > upper[i] {
            above.anomaly_count += 1;
            above.sizes.push((value - upper[i]).abs() / width);
            above_time += step as f64;
            above_times.push(points[i].time);
        } else if value < lower[i] {
            below.anomaly_count += 1;
            below.sizes.push((lower[i] - value).abs() / width);
            below_time += step as f64;
            below_times.push(points[i].time);
        }
    }

    above.time_outside_percent = round2(above_time / total_duration * 100.0);
    below.time_outside_percent = round2(below_time / total_duration * 100.0);
    above.durations = segment_durations(&above_times, step);
    below.durations = segment_durations(&below_times, step);

    AnomalyStats { above, below }
}

/// Group exceedance timestamps into segments: a gap greater than one step
/// ends a segment. Duration is `last - first`, so a single-point segment
/// has duration zero.
fn segment_durations(times: &[i64], step: i64) -> Vec<f64> {
    let mut out = Vec::new();
    let mut iter = times.iter();
    let Some(&first) = iter.next() else {
        return out;
    };
    let mut seg_start = first;
    let mut seg_last = first;
    for &t in iter {
        if t - seg_last > step {
            out.push((seg_last - seg_start) as f64);
            seg_start = t;
        }
        seg_last = t;
    }
    out.push((seg_last - seg_start) as f64);
    out
}

/// Compress a value array into the fixed 12-slot historical form.
///
/// With at most 12 samples the array is zero-padded to length 12 and
/// sorted, which deliberately biases small samples toward "no exceedance".
/// With more samples it is replaced by its values at the 12 configured
/// percentiles (linear interpolation between order statistics).
pub fn compress_values(values: &[f64], percentiles: &[f64; COMPRESSED_LEN]) -> [f64; COMPRESSED_LEN] {
    let mut out = [0.0; COMPRESSED_LEN];
    if values.is_empty() {
        return out;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    if sorted.len() <= COMPRESSED_LEN {
        // Pad with zeros, then sort: zeros land in the low slots.
        let pad = COMPRESSED_LEN - sorted.len();
        for (slot, &value) in out.iter_mut().skip(pad).zip(sorted.iter()) {
            *slot = value;
        }
        out.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        return out;
    }

    let max_rank = (sorted.len() - 1) as f64;
    for (slot, &p) in out.iter_mut().zip(percentiles.iter()) {
        let rank = (p.clamp(0.0, 100.0) / 100.0) * max_rank;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        let frac = rank - lo as f64;
        *slot = sorted[lo] + (sorted[hi] - sorted[lo]) * frac;
    }
    out
}

/// Compress a full window of raw statistics for persistence.
pub fn compress(stats: &AnomalyStats, percentiles: &[f64; COMPRESSED_LEN]) -> CompressedStats {
    let pack = |raw: &DirectionStats| CompressedDirectionStats {
        direction: raw.direction,
        time_outside_percent: raw.time_outside_percent,
        anomaly_count: raw.anomaly_count,
        durations: compress_values(&raw.durations, percentiles),
        sizes: compress_values(&raw.sizes, percentiles),
    };
    CompressedStats {
        above: pack(&stats.above),
        below: pack(&stats.below),
    }
}

/// Evaluate a compressed history at an arbitrary percentile by linear
/// interpolation across the 12 stored points. Exact at the stored points;
/// clamped outside the configured range.
pub fn interpolate_percentile(
    values: &[f64; COMPRESSED_LEN],
    percentiles: &[f64; COMPRESSED_LEN],
    target: f64,
) -> f64 {
    if target <= percentiles[0] {
        return values[0];
    }
    if target >= percentiles[COMPRESSED_LEN - 1] {
        return values[COMPRESSED_LEN - 1];
    }
    for i in 0..COMPRESSED_LEN - 1 {
        let (p0, p1) = (percentiles[i], percentiles[i + 1]);
        if target >= p0 && target <= p1 {
            if p1 == p0 {
                return values[i];
            }
            let frac = (target - p0) / (p1 - p0);
            return values[i] + (values[i + 1] - values[i]) * frac;
        }
    }
    values[COMPRESSED_LEN - 1]
}

/// Concern for one metric family: how far the current worst value lies
/// above the historical percentile baseline. Zero when inside baseline,
/// 1.0 when there is current evidence but no historical baseline at all.
fn concern_value(
    current: &[f64],
    historical: &[f64; COMPRESSED_LEN],
    percentiles: &[f64; COMPRESSED_LEN],
    target_percentile: f64,
    multiplier: f64,
) -> f64 {
    if current.is_empty() {
        return 0.0;
    }
    let worst = current.iter().cloned().fold(f64::MIN, f64::max);
    let baseline = interpolate_percentile(historical, percentiles, target_percentile);
    if baseline > 0.0 {
        (worst / (baseline * multiplier) - 1.0).max(0.0)
    } else {
        1.0
    }
}

/// Score the current window against the stored historical baseline.
pub fn score(
    current: &AnomalyStats,
    historical: &CompressedStats,
    params: &AnomalyParams,
) -> ConcernScore {
    let direction = |raw: &DirectionStats, hist: &CompressedDirectionStats| {
        let duration_concern = concern_value(
            &raw.durations,
            &hist.durations,
            &params.percentiles,
            params.target_percentile,
            params.baseline_multiplier,
        );
        let size_concern = concern_value(
            &raw.sizes,
            &hist.sizes,
            &params.percentiles,
            params.target_percentile,
            params.baseline_multiplier,
        );
        let total = duration_concern + size_concern;
        DirectionConcern {
            duration_concern,
            size_concern,
            total,
            sum: total * params.rolling_window,
        }
    };
    ConcernScore {
        above: direction(&current.above, &historical.above),
        below: direction(&current.below, &historical.below),
    }
}

/// An all-zero baseline, used for placeholder series.
pub fn empty_compressed() -> CompressedStats {
    let zero = |direction| CompressedDirectionStats {
        direction,
        time_outside_percent: 0.0,
        anomaly_count: 0,
        durations: [0.0; COMPRESSED_LEN],
        sizes: [0.0; COMPRESSED_LEN],
    };
    CompressedStats {
        above: zero(Direction::Above),
        below: zero(Direction::Below),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PERCENTILES;

    fn samples(pairs: &[(i64, f64)]) -> Vec<Sample> {
        pairs
            .iter()
            .map(|&(time, value)| Sample { time, value })
            .collect()
    }

    #[test]
    fn inside_points_produce_no_anomalies() {
        let points = samples(&[(0, 5.0), (60, 5.5), (120, 4.5)]);
        let stats = detect(&points, &[10.0; 3], &[0.0; 3], 60);
        assert_eq!(stats.above.anomaly_count, 0);
        assert_eq!(stats.below.anomaly_count, 0);
        assert_eq!(stats.combined_count(), 0);
        assert_eq!(stats.above.time_outside_percent, 0.0);
    }

    #[test]
    fn exceedances_split_by_direction() {
        let points = samples(&[(0, 15.0), (60, 5.0), (120, -3.0)]);
        let stats = detect(&points, &[10.0; 3], &[0.0; 3], 60);
        assert_eq!(stats.above.anomaly_count, 1);
        assert_eq!(stats.below.anomaly_count, 1);
        // width 10: above deviation 5 -> size 0.5; below deviation 3 -> 0.3
        assert!((stats.above.sizes[0] - 0.5).abs() < 1e-12);
        assert!((stats.below.sizes[0] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn time_outside_percent_is_rounded_to_two_decimals() {
        // 1 exceedance out of 3 points: 100/3 = 33.333... -> 33.33
        let points = samples(&[(0, 15.0), (60, 5.0), (120, 5.0)]);
        let stats = detect(&points, &[10.0; 3], &[0.0; 3], 60);
        assert_eq!(stats.above.time_outside_percent, 33.33);
    }

    #[test]
    fn segments_break_on_gaps_larger_than_one_step() {
        // Exceedances at 0, 60, 120 (one segment), then 300 (new segment).
        let durations = segment_durations(&[0, 60, 120, 300], 60);
        assert_eq!(durations, vec![120.0, 0.0]);
    }

    #[test]
    fn single_point_segment_has_zero_duration() {
        assert_eq!(segment_durations(&[42], 60), vec![0.0]);
    }

    #[test]
    fn combined_stats_average_percent_and_sum_counts() {
        let points = samples(&[(0, 15.0), (60, -5.0)]);
        let stats = detect(&points, &[10.0; 2], &[0.0; 2], 60);
        // Each direction is outside for 50% of the window.
        assert_eq!(stats.combined_time_outside_percent(), 50.0);
        assert_eq!(stats.combined_count(), 2);
    }

    #[test]
    fn compression_pads_small_samples_with_leading_zeros() {
        let out = compress_values(&[3.0, 1.0, 2.0], &DEFAULT_PERCENTILES);
        // Invariant: output equals sort(values ++ zeros).
        let mut expected = vec![0.0; 9];
        expected.extend([1.0, 2.0, 3.0]);
        assert_eq!(out.to_vec(), expected);
    }

    #[test]
    fn compression_always_returns_twelve_slots() {
        assert_eq!(compress_values(&[], &DEFAULT_PERCENTILES).len(), 12);
        let big: Vec<f64> = (0..100).map(|i| i as f64).collect();
        assert_eq!(compress_values(&big, &DEFAULT_PERCENTILES).len(), 12);
    }

    #[test]
    fn compression_of_large_samples_uses_percentiles() {
        let values: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        let out = compress_values(&values, &DEFAULT_PERCENTILES);
        // 0..=100 has its p-th percentile exactly at p.
        assert_eq!(
            out.to_vec(),
            vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 95.0, 100.0]
        );
    }

    #[test]
    fn compression_of_random_samples_is_sorted_and_fixed_length() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let values: Vec<f64> = (0..200).map(|_| rng.gen_range(0.0..50.0)).collect();
        let out = compress_values(&values, &DEFAULT_PERCENTILES);
        assert_eq!(out.len(), 12);
        assert!(out.windows(2).all(|w| w[0] <= w[1]));
        // Percentile projections stay inside the sample range.
        assert!(out[0] >= 0.0 && out[11] < 50.0);
    }

    #[test]
    fn interpolation_is_exact_at_stored_points() {
        let values: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        let stored = compress_values(&values, &DEFAULT_PERCENTILES);
        for (i, &p) in DEFAULT_PERCENTILES.iter().enumerate() {
            let got = interpolate_percentile(&stored, &DEFAULT_PERCENTILES, p);
            assert_eq!(got, stored[i], "percentile {}", p);
        }
    }

    #[test]
    fn interpolation_between_points_is_linear() {
        let stored = [0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 95.0, 100.0];
        // Halfway between the 90th (90.0) and 95th (95.0) slots.
        let got = interpolate_percentile(&stored, &DEFAULT_PERCENTILES, 92.5);
        assert!((got - 92.5).abs() < 1e-12);
    }

    #[test]
    fn interpolation_clamps_outside_range() {
        let stored = [1.0; 12];
        assert_eq!(interpolate_percentile(&stored, &DEFAULT_PERCENTILES, -5.0), 1.0);
        assert_eq!(interpolate_percentile(&stored, &DEFAULT_PERCENTILES, 120.0), 1.0);
    }

    #[test]
    fn concern_is_zero_without_current_evidence() {
        let params = AnomalyParams {
            percentiles: DEFAULT_PERCENTILES,
            target_percentile: 75.0,
            baseline_multiplier: 1.0,
            rolling_window: 10.0,
        };
        let current = detect(&samples(&[(0, 5.0)]), &[10.0], &[0.0], 60);
        let scored = score(&current, &empty_compressed(), &params);
        assert_eq!(scored.above.total, 0.0);
        assert_eq!(scored.below.total, 0.0);
    }

    #[test]
    fn concern_is_one_with_evidence_but_no_baseline() {
        let params = AnomalyParams {
            percentiles: DEFAULT_PERCENTILES,
            target_percentile: 75.0,
            baseline_multiplier: 1.0,
            rolling_window: 10.0,
        };
        let current = detect(&samples(&[(0, 15.0)]), &[10.0], &[0.0], 60);
        let scored = score(&current, &empty_compressed(), &params);
        // duration concern 1.0 + size concern 1.0
        assert_eq!(scored.above.duration_concern, 1.0);
        assert_eq!(scored.above.size_concern, 1.0);
        assert_eq!(scored.above.total, 2.0);
        assert_eq!(scored.above.sum, 20.0);
    }

    #[test]
    fn concern_scales_against_historical_baseline() {
        let mut historical = empty_compressed();
        historical.above.sizes = [2.0; 12];
        historical.above.durations = [1000.0; 12];
        let params = AnomalyParams {
            percentiles: DEFAULT_PERCENTILES,
            target_percentile: 75.0,
            baseline_multiplier: 1.0,
            rolling_window: 10.0,
        };
        // One exceedance of size (15-10)/10 = 0.5, single-point duration 0.
        let current = detect(&samples(&[(0, 15.0)]), &[10.0], &[0.0], 60);
        let scored = score(&current, &historical, &params);
        // size 0.5 vs baseline 2.0 -> max(0, 0.25 - 1) = 0
        assert_eq!(scored.above.size_concern, 0.0);
        // duration 0 vs baseline 1000 -> 0
        assert_eq!(scored.above.duration_concern, 0.0);
    }

    #[test]
    fn concern_exceeding_baseline_is_proportional() {
        let mut historical = empty_compressed();
        historical.above.sizes = [0.25; 12];
        historical.above.durations = [60.0; 12];
        let params = AnomalyParams {
            percentiles: DEFAULT_PERCENTILES,
            target_percentile: 75.0,
            baseline_multiplier: 1.0,
            rolling_window: 2.0,
        };
        // Two adjacent exceedances of size 0.5 -> duration 60, max size 0.5.
        let current = detect(
            &samples(&[(0, 15.0), (60, 15.0)]),
            &[10.0, 10.0],
            &[0.0, 0.0],
            60,
        );
        let scored = score(&current, &historical, &params);
        // size: 0.5/0.25 - 1 = 1.0 ; duration: 60/60 - 1 = 0.0
        assert!((scored.above.size_concern - 1.0).abs() < 1e-12);
        assert_eq!(scored.above.duration_concern, 0.0);
        assert!((scored.above.sum - 2.0).abs() < 1e-12);
    }
}
