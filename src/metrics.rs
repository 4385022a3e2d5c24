use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};

lazy_static! {
    static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "corridor_gate_requests_total",
        "Total requests per route",
        &["route"]
    )
    .unwrap();

    static ref REQUEST_DURATION: Histogram = register_histogram!(
        "corridor_gate_query_range_duration_seconds",
        "query_range handling duration in seconds",
        vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    static ref CACHE_HITS_TOTAL: Counter = register_counter!(
        "corridor_gate_cache_hits_total",
        "Corridor cache entries served without a rebuild"
    )
    .unwrap();

    static ref CACHE_MISSES_TOTAL: Counter = register_counter!(
        "corridor_gate_cache_misses_total",
        "Corridor cache lookups that required a rebuild"
    )
    .unwrap();

    static ref REBUILDS_TOTAL: Counter = register_counter!(
        "corridor_gate_corridor_rebuilds_total",
        "Corridor payloads rebuilt and persisted"
    )
    .unwrap();

    static ref AUTOTUNE_RUNS_TOTAL: Counter = register_counter!(
        "corridor_gate_autotune_runs_total",
        "Auto-tune sweeps actually executed (memo misses)"
    )
    .unwrap();

    static ref PLACEHOLDERS_TOTAL: Counter = register_counter!(
        "corridor_gate_placeholder_series_total",
        "Series emitted as placeholders for lack of history"
    )
    .unwrap();

    static ref UPSTREAM_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "corridor_gate_upstream_failures_total",
        "Upstream fetch failures per kind",
        &["kind"]
    )
    .unwrap();
}

pub fn record_request(route: &str) {
    REQUESTS_TOTAL.with_label_values(&[route]).inc();
}

pub fn record_request_duration(seconds: f64) {
    REQUEST_DURATION.observe(seconds);
}

pub fn record_cache_hit() {
    CACHE_HITS_TOTAL.inc();
}

pub fn record_cache_miss() {
    CACHE_MISSES_TOTAL.inc();
}

pub fn record_rebuild() {
    REBUILDS_TOTAL.inc();
}

pub fn record_autotune_run() {
    AUTOTUNE_RUNS_TOTAL.inc();
}

/// Total auto-tune sweeps executed so far. The memoisation contract is
/// asserted against this counter in the end-to-end tests.
pub fn autotune_runs() -> f64 {
    AUTOTUNE_RUNS_TOTAL.get()
}

pub fn record_placeholder() {
    PLACEHOLDERS_TOTAL.inc();
}

pub fn record_upstream_failure(kind: &str) {
    UPSTREAM_FAILURES_TOTAL.with_label_values(&[kind]).inc();
}

/// `/metrics` endpoint: the default registry in text exposition format.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
    }
    (
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
