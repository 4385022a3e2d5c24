use serde_json::{json, Map, Value};

use crate::anomaly::{self, CompressedDirectionStats, DirectionStats};
use crate::config::{AnomalyParams, Config};
use crate::pipeline::{RangeQuery, SeriesRow};

/// Emit the Prometheus `matrix` envelope for a set of analysed series.
///
/// Families are gated by `dashboard.show_metrics` (logical family names;
/// an empty whitelist shows everything). Grid families carry the full
/// window; scalar families carry a single point stamped at emission time.
pub fn format_matrix(
    rows: &[SeriesRow],
    req: &RangeQuery,
    cfg: &Config,
    emitted_at: i64,
) -> Value {
    let show = cfg.get_str_list("dashboard.show_metrics");
    let anomaly_params = AnomalyParams::from_config(cfg);
    let visible = |family: &str| show.is_empty() || show.iter().any(|f| f == family);

    let mut result = Vec::new();
    for row in rows {
        emit_series(&mut result, row, req, &visible, &anomaly_params, emitted_at);
    }

    json!({
        "status": "success",
        "data": {
            "resultType": "matrix",
            "result": result,
        }
    })
}

/// The degenerate response for an empty request window: an otherwise
/// empty matrix carrying a single `nodata` row.
pub fn nodata_matrix(query: &str, emitted_at: i64) -> Value {
    let metric = json!({"__name__": "nodata", "original_query": query});
    json!({
        "status": "success",
        "data": {
            "resultType": "matrix",
            "result": [scalar_row(metric, emitted_at, 1.0)],
        }
    })
}

fn emit_series(
    result: &mut Vec<Value>,
    row: &SeriesRow,
    req: &RangeQuery,
    visible: &dyn Fn(&str) -> bool,
    anomaly_params: &AnomalyParams,
    emitted_at: i64,
) {
    let metric = |name: &str| metric_labels(name, &req.query, &row.series.labels);

    if visible("original") {
        let values: Vec<Value> = row
            .series
            .points
            .iter()
            .map(|p| json!([p.time, format_value(p.value)]))
            .collect();
        result.push(json!({"metric": metric("original"), "values": values}));
    }

    if row.placeholder {
        if visible("nodata") {
            result.push(scalar_row(metric("nodata"), emitted_at, 1.0));
        }
        // Shape-stable zero concern for degenerate series.
        if visible("anomaly_concern") {
            result.push(scalar_row(metric("anomaly_concern_above"), emitted_at, 0.0));
            result.push(scalar_row(metric("anomaly_concern_below"), emitted_at, 0.0));
        }
        return;
    }

    if let Some(corridor) = &row.corridor {
        let grid = |values: &[f64]| -> Vec<Value> {
            corridor
                .times
                .iter()
                .zip(values.iter())
                .map(|(&t, &v)| json!([t, format_value(v)]))
                .collect()
        };
        if visible("dft_upper") {
            result.push(json!({"metric": metric("dft_upper"), "values": grid(&corridor.upper)}));
        }
        if visible("dft_lower") {
            result.push(json!({"metric": metric("dft_lower"), "values": grid(&corridor.lower)}));
        }
        if visible("dft_range") {
            let range: Vec<f64> = corridor
                .upper
                .iter()
                .zip(corridor.lower.iter())
                .map(|(u, l)| u - l)
                .collect();
            result.push(json!({"metric": metric("dft_range"), "values": grid(&range)}));
        }
    }

    if let Some(stats) = &row.stats {
        let direction = |raw: &DirectionStats, side: &str| {
            let mut out = Vec::new();
            if visible("time_outside_percent") {
                out.push((
                    format!("{}_time_outside_percent", side),
                    raw.time_outside_percent,
                ));
            }
            if visible("anomaly_count") {
                out.push((format!("{}_anomaly_count", side), raw.anomaly_count as f64));
            }
            if visible("anomaly_duration") {
                out.push((format!("{}_anomaly_duration", side), max_or_zero(&raw.durations)));
            }
            if visible("anomaly_size") {
                out.push((format!("{}_anomaly_size", side), max_or_zero(&raw.sizes)));
            }
            out
        };
        for (name, value) in direction(&stats.above, "upper") {
            result.push(scalar_row(metric(&name), emitted_at, value));
        }
        for (name, value) in direction(&stats.below, "lower") {
            result.push(scalar_row(metric(&name), emitted_at, value));
        }
    }

    if let Some(historical) = &row.historical {
        let direction = |hist: &CompressedDirectionStats, side: &str| {
            let baseline = |values: &[f64; 12]| {
                anomaly::interpolate_percentile(
                    values,
                    &anomaly_params.percentiles,
                    anomaly_params.target_percentile,
                )
            };
            let mut out = Vec::new();
            if visible("historical_time_outside_percent") {
                out.push((
                    format!("historical_{}_time_outside_percent", side),
                    hist.time_outside_percent,
                ));
            }
            if visible("historical_anomaly_count") {
                out.push((
                    format!("historical_{}_anomaly_count", side),
                    hist.anomaly_count as f64,
                ));
            }
            if visible("historical_anomaly_duration") {
                out.push((
                    format!("historical_{}_anomaly_duration", side),
                    baseline(&hist.durations),
                ));
            }
            if visible("historical_anomaly_size") {
                out.push((
                    format!("historical_{}_anomaly_size", side),
                    baseline(&hist.sizes),
                ));
            }
            out
        };
        for (name, value) in direction(&historical.above, "upper") {
            result.push(scalar_row(metric(&name), emitted_at, value));
        }
        for (name, value) in direction(&historical.below, "lower") {
            result.push(scalar_row(metric(&name), emitted_at, value));
        }
    }

    if let Some(concern) = &row.concern {
        if visible("anomaly_concern") {
            result.push(scalar_row(metric("anomaly_concern_above"), emitted_at, concern.above.total));
            result.push(scalar_row(metric("anomaly_concern_below"), emitted_at, concern.below.total));
        }
        if visible("anomaly_concern_sum") {
            result.push(scalar_row(
                metric("anomaly_concern_above_sum"),
                emitted_at,
                concern.above.sum,
            ));
            result.push(scalar_row(
                metric("anomaly_concern_below_sum"),
                emitted_at,
                concern.below.sum,
            ));
        }
    }

    if visible("dft_rebuild_count") {
        result.push(scalar_row(
            metric("dft_rebuild_count"),
            emitted_at,
            row.rebuild_count as f64,
        ));
    }
}

fn metric_labels(name: &str, query: &str, labels: &Map<String, Value>) -> Value {
    let mut out = Map::new();
    for (key, value) in labels {
        if key == "__name__" {
            continue;
        }
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out.insert(key.clone(), Value::String(text));
    }
    out.insert("__name__".into(), Value::String(name.to_string()));
    out.insert("original_query".into(), Value::String(query.to_string()));
    Value::Object(out)
}

fn scalar_row(metric: Value, emitted_at: i64, value: f64) -> Value {
    json!({"metric": metric, "values": [[emitted_at, format_value(value)]]})
}

fn max_or_zero(values: &[f64]) -> f64 {
    values.iter().cloned().fold(0.0, f64::max)
}

fn format_value(v: f64) -> String {
    format!("{}", v)
}
