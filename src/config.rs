use anyhow::{Context, Result};
use serde_json::{Map, Number, Value};

use crate::error::GatewayError;

/// The 12 percentile slots used for compressed anomaly history.
pub const DEFAULT_PERCENTILES: [f64; 12] = [
    0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 95.0, 100.0,
];

/// Nested runtime configuration.
///
/// Loaded from an INI file whose sections and keys may both carry dotted
/// paths; every dotted segment nests one object level on read, so
/// `[cache.database] path = ...` and `cache.database.path = ...` meet in
/// the same leaf. Values are typed on read (bool, CSV list, integer,
/// float, string, in that order). The whole tree is a plain JSON object,
/// which keeps per-request override copies cheap and the hash canonical
/// (serde_json maps iterate in sorted key order).
#[derive(Debug, Clone)]
pub struct Config {
    root: Value,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root: Value::Object(Map::new()),
        }
    }
}

impl Config {
    /// Load from an INI file (dotted keys nested on read).
    pub fn from_file(path: &str) -> Result<Config> {
        let raw = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Ini))
            .build()
            .with_context(|| format!("failed to read config file: {}", path))?;
        let flat: Value = raw
            .try_deserialize()
            .context("failed to parse config INI")?;

        let mut cfg = Config::default();
        cfg.absorb("", &flat);
        Ok(cfg)
    }

    /// Build directly from a nested JSON tree (tests and overrides).
    pub fn from_value(root: Value) -> Config {
        let mut cfg = Config::default();
        cfg.absorb("", &root);
        cfg
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Walk a parsed tree, re-typing leaf strings and splitting dotted
    /// keys into nested objects.
    fn absorb(&mut self, prefix: &str, node: &Value) {
        match node {
            Value::Object(map) => {
                for (key, value) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    self.absorb(&path, value);
                }
            }
            Value::String(s) => self.set(prefix, parse_scalar(s)),
            other => self.set(prefix, other.clone()),
        }
    }

    /// Dotted-path lookup.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;
        for segment in path.split('.') {
            node = node.as_object()?.get(segment)?;
        }
        Some(node)
    }

    /// Dotted-path insert, creating intermediate objects as needed.
    pub fn set(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').collect();
        let mut node = &mut self.root;
        for segment in &segments[..segments.len() - 1] {
            let map = node.as_object_mut().expect("config root is an object");
            node = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
        }
        node.as_object_mut()
            .expect("config parents are objects")
            .insert(segments[segments.len() - 1].to_string(), value);
    }

    pub fn get_f64(&self, path: &str, default: f64) -> f64 {
        self.get(path).and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn get_i64(&self, path: &str, default: i64) -> i64 {
        self.get(path).and_then(Value::as_i64).unwrap_or(default)
    }

    pub fn get_usize(&self, path: &str, default: usize) -> usize {
        self.get(path)
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(default)
    }

    pub fn get_bool(&self, path: &str, default: bool) -> bool {
        self.get(path).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn get_str(&self, path: &str, default: &str) -> String {
        self.get(path)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    pub fn get_f64_list(&self, path: &str) -> Option<Vec<f64>> {
        let list = self.get(path)?.as_array()?;
        list.iter().map(Value::as_f64).collect()
    }

    pub fn get_str_list(&self, path: &str) -> Vec<String> {
        match self.get(path) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// Apply inline query overrides (`key1=value1; key2=value2`) to a copy
    /// of this configuration. Each key is a dotted path; values are typed
    /// the same way as file values.
    pub fn with_overrides(&self, overrides: &str) -> std::result::Result<Config, GatewayError> {
        let mut out = self.clone();
        for clause in overrides.split(';') {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            let (key, value) = clause.split_once('=').ok_or_else(|| {
                GatewayError::Validation(format!("malformed override clause: {:?}", clause))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(GatewayError::Validation(format!(
                    "empty key in override clause: {:?}",
                    clause
                )));
            }
            out.set(key, parse_scalar(value.trim()));
        }
        Ok(out)
    }

    /// Stable hash of the corridor-affecting configuration subset: keys
    /// prefixed `save` are excluded, floats are rounded to 5 decimals,
    /// object keys come out deep-sorted, and the result is the md5 hex of
    /// the canonical JSON.
    pub fn config_hash(&self) -> String {
        let canonical = canonicalize_for_hash(&self.root);
        format!("{:x}", md5::compute(canonical.to_string()))
    }
}

fn canonicalize_for_hash(node: &Value) -> Value {
    match node {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if key.starts_with("save") {
                    continue;
                }
                out.insert(key.clone(), canonicalize_for_hash(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_for_hash).collect()),
        Value::Number(n) => {
            if n.is_f64() {
                let rounded = (n.as_f64().unwrap() * 1e5).round() / 1e5;
                Number::from_f64(rounded)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            } else {
                node.clone()
            }
        }
        other => other.clone(),
    }
}

/// Type a raw scalar: `true`/`false`, CSV list, integer, float, string.
pub fn parse_scalar(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if trimmed.contains(',') {
        return Value::Array(trimmed.split(',').map(parse_scalar).collect());
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(trimmed.to_string())
}

/// Split a `query_range` query on the `#` override separator.
pub fn split_query_overrides(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once('#') {
        Some((query, overrides)) => (query.trim(), Some(overrides.trim())),
        None => (raw.trim(), None),
    }
}

// ---------------------------------------------------------------------------
// Typed parameter snapshots
// ---------------------------------------------------------------------------

/// Corridor-model parameters.
#[derive(Debug, Clone)]
pub struct CorridorParams {
    pub max_harmonics: usize,
    pub min_data_points: usize,
    pub use_common_trend: bool,
    pub scale_corridor: bool,
    pub min_width_factor: f64,
    pub historical_period_days: f64,
    pub historical_offset_days: f64,
    pub history_step: i64,
    pub auto_tune: bool,
    pub max_rebuild_count: u64,
}

impl CorridorParams {
    pub fn from_config(cfg: &Config) -> Self {
        CorridorParams {
            max_harmonics: cfg.get_usize("corridor_params.max_harmonics", 10),
            min_data_points: cfg.get_usize("corridor_params.min_data_points", 10),
            use_common_trend: cfg.get_bool("corridor_params.use_common_trend", true),
            scale_corridor: cfg.get_bool("corridor_params.scale_corridor", false),
            min_width_factor: cfg.get_f64("corridor_params.min_width_factor", 0.1),
            historical_period_days: cfg.get_f64("corridor_params.historical_period_days", 7.0),
            historical_offset_days: cfg.get_f64("corridor_params.historical_offset_days", 0.0),
            history_step: cfg.get_i64("corridor_params.history_step", 300),
            auto_tune: cfg.get_bool("corridor_params.auto_tune", true),
            max_rebuild_count: cfg.get_i64("corridor_params.max_rebuild_count", 100) as u64,
        }
    }
}

/// Anomaly-statistics parameters.
#[derive(Debug, Clone)]
pub struct AnomalyParams {
    pub percentiles: [f64; 12],
    pub target_percentile: f64,
    pub baseline_multiplier: f64,
    pub rolling_window: f64,
}

impl AnomalyParams {
    pub fn from_config(cfg: &Config) -> Self {
        let percentiles = cfg
            .get_f64_list("anomaly.percentiles")
            .and_then(|list| <[f64; 12]>::try_from(list).ok())
            .unwrap_or(DEFAULT_PERCENTILES);
        AnomalyParams {
            percentiles,
            target_percentile: cfg.get_f64("anomaly.target_percentile", 75.0),
            baseline_multiplier: cfg.get_f64("anomaly.multiplier", 1.0),
            rolling_window: cfg.get_f64("anomaly.rolling_window", 10.0),
        }
    }
}

/// Cache-store parameters.
#[derive(Debug, Clone)]
pub struct CacheParams {
    pub database_path: String,
    pub max_ttl: i64,
    pub cleanup_days: i64,
}

impl CacheParams {
    pub fn from_config(cfg: &Config) -> Self {
        CacheParams {
            database_path: cfg.get_str("cache.database.path", "./cache/corridor.db"),
            max_ttl: cfg.get_i64("cache.max_ttl", 86_400),
            cleanup_days: cfg.get_i64("cache.cleanup_days", 30),
        }
    }
}

/// Per-request budget parameters.
#[derive(Debug, Clone)]
pub struct TimeoutParams {
    pub max_metrics: usize,
    pub request_seconds: u64,
}

impl TimeoutParams {
    pub fn from_config(cfg: &Config) -> Self {
        TimeoutParams {
            max_metrics: cfg.get_usize("timeout.max_metrics", 50),
            request_seconds: cfg.get_i64("timeout.request_seconds", 55) as u64,
        }
    }
}

/// Auto-tune parameters.
#[derive(Debug, Clone)]
pub struct AutotuneParams {
    pub step_hours: f64,
    pub hann_window: bool,
}

impl AutotuneParams {
    pub fn from_config(cfg: &Config) -> Self {
        AutotuneParams {
            step_hours: cfg.get_f64("autotune.step_hours", 4.0),
            hann_window: cfg.get_bool("autotune.hann_window", true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_are_typed_in_order() {
        assert_eq!(parse_scalar("true"), Value::Bool(true));
        assert_eq!(parse_scalar("false"), Value::Bool(false));
        assert_eq!(parse_scalar("42"), json!(42));
        assert_eq!(parse_scalar("4.5"), json!(4.5));
        assert_eq!(parse_scalar("hello"), json!("hello"));
        assert_eq!(parse_scalar("1,2,3"), json!([1, 2, 3]));
        assert_eq!(parse_scalar("a, b"), json!(["a", "b"]));
    }

    #[test]
    fn dotted_keys_nest_on_read() {
        let cfg = Config::from_value(json!({
            "cache": {"database.path": "./x.db"},
            "corridor_params.max_harmonics": "12"
        }));
        assert_eq!(cfg.get_str("cache.database.path", ""), "./x.db");
        assert_eq!(cfg.get_usize("corridor_params.max_harmonics", 0), 12);
    }

    #[test]
    fn overrides_apply_to_a_copy() {
        let base = Config::from_value(json!({
            "corridor_params": {"max_harmonics": 10, "scale_corridor": false}
        }));
        let patched = base
            .with_overrides("corridor_params.max_harmonics=5; corridor_params.scale_corridor=true")
            .unwrap();
        assert_eq!(patched.get_usize("corridor_params.max_harmonics", 0), 5);
        assert!(patched.get_bool("corridor_params.scale_corridor", false));
        // The base is untouched.
        assert_eq!(base.get_usize("corridor_params.max_harmonics", 0), 10);
    }

    #[test]
    fn override_values_parse_as_csv_lists() {
        let base = Config::default();
        let patched = base
            .with_overrides("dashboard.show_metrics=original,dft_upper")
            .unwrap();
        assert_eq!(
            patched.get_str_list("dashboard.show_metrics"),
            vec!["original".to_string(), "dft_upper".to_string()]
        );
    }

    #[test]
    fn malformed_override_is_a_validation_error() {
        let base = Config::default();
        assert!(base.with_overrides("no_equals_sign").is_err());
        assert!(base.with_overrides("=5").is_err());
    }

    #[test]
    fn query_split_on_hash() {
        assert_eq!(split_query_overrides("up"), ("up", None));
        let (q, o) = split_query_overrides("up # a.b=1; c=true");
        assert_eq!(q, "up");
        assert_eq!(o, Some("a.b=1; c=true"));
    }

    #[test]
    fn hash_ignores_save_prefixed_keys() {
        let a = Config::from_value(json!({
            "corridor_params": {"max_harmonics": 10},
            "save_debug": {"path": "/tmp/a"}
        }));
        let b = Config::from_value(json!({
            "corridor_params": {"max_harmonics": 10},
            "save_debug": {"path": "/tmp/b"},
            "save_raw": true
        }));
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn hash_rounds_floats_to_five_decimals() {
        let a = Config::from_value(json!({"x": {"factor": 0.1000001}}));
        let b = Config::from_value(json!({"x": {"factor": 0.1000004}}));
        let c = Config::from_value(json!({"x": {"factor": 0.10002}}));
        assert_eq!(a.config_hash(), b.config_hash());
        assert_ne!(a.config_hash(), c.config_hash());
    }

    #[test]
    fn hash_is_key_order_independent() {
        let a = Config::from_value(json!({"b": 1, "a": 2}));
        let b = Config::from_value(json!({"a": 2, "b": 1}));
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn hash_changes_on_meaningful_edit() {
        let a = Config::from_value(json!({"corridor_params": {"max_harmonics": 10}}));
        let b = a
            .with_overrides("corridor_params.max_harmonics=5")
            .unwrap();
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn typed_snapshots_carry_defaults() {
        let cfg = Config::default();
        let corridor = CorridorParams::from_config(&cfg);
        assert_eq!(corridor.max_harmonics, 10);
        assert_eq!(corridor.min_data_points, 10);
        assert!(corridor.use_common_trend);
        assert!(!corridor.scale_corridor);
        assert_eq!(corridor.history_step, 300);

        let anomaly = AnomalyParams::from_config(&cfg);
        assert_eq!(anomaly.percentiles, DEFAULT_PERCENTILES);
        assert_eq!(anomaly.target_percentile, 75.0);

        let timeout = TimeoutParams::from_config(&cfg);
        assert_eq!(timeout.max_metrics, 50);
    }

    #[test]
    fn percentile_override_needs_twelve_slots() {
        let cfg = Config::from_value(json!({"anomaly": {"percentiles": [0, 50, 100]}}));
        // Wrong cardinality falls back to the canonical 12.
        let anomaly = AnomalyParams::from_config(&cfg);
        assert_eq!(anomaly.percentiles, DEFAULT_PERCENTILES);
    }
}
