use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{GatewayError, Result};

/// One raw observation before grouping: an upstream data point with the
/// label set it was returned under.
#[derive(Debug, Clone)]
pub struct RawPoint {
    pub time: i64,
    pub value: f64,
    pub labels: Value,
}

/// A single `(time, value)` observation. Times are unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: i64,
    pub value: f64,
}

/// A labelled series. Identity is `labels_json`: the canonical JSON of the
/// label set with keys deep-sorted and nulls stripped. Two series are equal
/// iff their `labels_json` are byte-equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub labels: Map<String, Value>,
    pub labels_json: String,
    pub points: Vec<Sample>,
}

impl Series {
    pub fn new(labels: Map<String, Value>, points: Vec<Sample>) -> Self {
        let labels_json = Value::Object(labels.clone()).to_string();
        Series {
            labels,
            labels_json,
            points,
        }
    }

    /// Label lookup as a string, for internal annotations such as
    /// `unused_metric` and `__name__`.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).and_then(Value::as_str)
    }

    /// Set (or replace) a string label, recomputing the canonical identity.
    pub fn set_label(&mut self, key: &str, value: &str) {
        self.labels
            .insert(key.to_string(), Value::String(value.to_string()));
        self.labels_json = Value::Object(self.labels.clone()).to_string();
    }
}

/// Canonicalise a label set: deep-sort object keys, strip null values,
/// reject arrays as label-set members. serde_json's default map is ordered,
/// so rebuilding the tree is enough to get byte-canonical output.
pub fn canonical_labels(labels: &Value) -> Result<Map<String, Value>> {
    match labels {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                match value {
                    Value::Null => continue,
                    Value::Array(_) => {
                        return Err(GatewayError::Validation(format!(
                            "label {:?} is an array; label-set members must be scalars or objects",
                            key
                        )))
                    }
                    Value::Object(_) => {
                        let nested = canonical_labels(value)?;
                        out.insert(key.clone(), Value::Object(nested));
                    }
                    other => {
                        out.insert(key.clone(), other.clone());
                    }
                }
            }
            Ok(out)
        }
        _ => Err(GatewayError::Validation(
            "label set must be a JSON object".into(),
        )),
    }
}

/// Canonical JSON text for a label set.
pub fn canonical_labels_json(labels: &Value) -> Result<String> {
    Ok(Value::Object(canonical_labels(labels)?).to_string())
}

/// Group a flat list of raw points into series keyed by canonical
/// `labels_json`. Duplicate `(labels_json, time)` pairs collapse to the
/// later value; points come out strictly ordered by time. Points whose
/// label set fails canonicalisation are dropped with a warning — grouping
/// itself never fails, and an empty input yields an empty map.
pub fn group_samples(points: Vec<RawPoint>) -> BTreeMap<String, Series> {
    let mut buckets: BTreeMap<String, (Map<String, Value>, BTreeMap<i64, f64>)> = BTreeMap::new();

    for point in points {
        let labels = match canonical_labels(&point.labels) {
            Ok(labels) => labels,
            Err(e) => {
                tracing::warn!(error = %e, "dropping point with malformed labels");
                continue;
            }
        };
        if !point.value.is_finite() {
            continue;
        }
        let key = Value::Object(labels.clone()).to_string();
        let entry = buckets.entry(key).or_insert_with(|| (labels, BTreeMap::new()));
        // BTreeMap insert keeps the later value on duplicate timestamps.
        entry.1.insert(point.time, point.value);
    }

    buckets
        .into_iter()
        .map(|(key, (labels, timeline))| {
            let points = timeline
                .into_iter()
                .map(|(time, value)| Sample { time, value })
                .collect();
            (
                key.clone(),
                Series {
                    labels,
                    labels_json: key,
                    points,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalisation_sorts_keys_and_strips_nulls() {
        let labels = json!({"b": "2", "a": "1", "c": null});
        let text = canonical_labels_json(&labels).unwrap();
        assert_eq!(text, r#"{"a":"1","b":"2"}"#);
    }

    #[test]
    fn canonicalisation_is_idempotent() {
        let labels = json!({"z": "9", "nested": {"y": "2", "x": null}, "a": "1"});
        let once = canonical_labels_json(&labels).unwrap();
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        let twice = canonical_labels_json(&reparsed).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn arrays_are_rejected() {
        let labels = json!({"a": ["x", "y"]});
        assert!(canonical_labels(&labels).is_err());
    }

    #[test]
    fn internal_labels_are_retained() {
        let labels = json!({"__name__": "cpu", "panel_url": "/d/abc", "job": "node"});
        let map = canonical_labels(&labels).unwrap();
        assert_eq!(map.get("__name__").unwrap(), "cpu");
        assert_eq!(map.get("panel_url").unwrap(), "/d/abc");
    }

    #[test]
    fn grouping_empty_input_is_empty() {
        assert!(group_samples(Vec::new()).is_empty());
    }

    #[test]
    fn grouping_splits_by_canonical_identity() {
        let points = vec![
            RawPoint {
                time: 10,
                value: 1.0,
                labels: json!({"job": "a"}),
            },
            RawPoint {
                time: 20,
                value: 2.0,
                labels: json!({"job": "b"}),
            },
            // Same identity as the first despite key order and a null.
            RawPoint {
                time: 30,
                value: 3.0,
                labels: json!({"job": "a", "drop": null}),
            },
        ];
        let grouped = group_samples(points);
        assert_eq!(grouped.len(), 2);
        let a = grouped.get(r#"{"job":"a"}"#).unwrap();
        assert_eq!(a.points.len(), 2);
        assert_eq!(a.points[0].time, 10);
        assert_eq!(a.points[1].time, 30);
    }

    #[test]
    fn duplicate_timestamps_keep_the_later_value() {
        let points = vec![
            RawPoint {
                time: 10,
                value: 1.0,
                labels: json!({"job": "a"}),
            },
            RawPoint {
                time: 10,
                value: 7.0,
                labels: json!({"job": "a"}),
            },
        ];
        let grouped = group_samples(points);
        let series = grouped.get(r#"{"job":"a"}"#).unwrap();
        assert_eq!(series.points.len(), 1);
        assert_eq!(series.points[0].value, 7.0);
    }

    #[test]
    fn points_come_out_time_ordered() {
        let points = vec![
            RawPoint {
                time: 30,
                value: 3.0,
                labels: json!({"job": "a"}),
            },
            RawPoint {
                time: 10,
                value: 1.0,
                labels: json!({"job": "a"}),
            },
            RawPoint {
                time: 20,
                value: 2.0,
                labels: json!({"job": "a"}),
            },
        ];
        let grouped = group_samples(points);
        let times: Vec<i64> = grouped[r#"{"job":"a"}"#]
            .points
            .iter()
            .map(|p| p.time)
            .collect();
        assert_eq!(times, vec![10, 20, 30]);
    }

    #[test]
    fn non_finite_values_are_dropped() {
        let points = vec![
            RawPoint {
                time: 10,
                value: f64::NAN,
                labels: json!({"job": "a"}),
            },
            RawPoint {
                time: 20,
                value: 2.0,
                labels: json!({"job": "a"}),
            },
        ];
        let grouped = group_samples(points);
        assert_eq!(grouped[r#"{"job":"a"}"#].points.len(), 1);
    }
}
