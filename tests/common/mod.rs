//! Shared harness for the gateway end-to-end tests: a wiremock upstream
//! that answers Prometheus `query_range` calls from closures, and an axum
//! app wired to it through the basic-auth port scheme.
#![allow(dead_code)]

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::Request;
use axum::Router;
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::{Mock, MockServer, Request as MockRequest, Respond, ResponseTemplate};

use corridor_gate::cache::Cache;
use corridor_gate::config::Config;
use corridor_gate::router::{build_router, AppState};

/// History requests span days; live requests span the dashboard window.
/// The upstream responder tells them apart by window length.
const HISTORY_WINDOW_THRESHOLD: i64 = 2 * 86_400;

pub type WindowFn = Box<dyn Fn(i64, i64, i64) -> Value + Send + Sync>;

/// Upstream double answering `query_range` with synthetic matrices.
pub struct DualWindowUpstream {
    pub live: WindowFn,
    pub history: WindowFn,
}

impl Respond for DualWindowUpstream {
    fn respond(&self, request: &MockRequest) -> ResponseTemplate {
        let mut start = 0i64;
        let mut end = 0i64;
        let mut step = 60i64;
        for (key, value) in request.url.query_pairs() {
            match key.as_ref() {
                "start" => start = value.parse().unwrap_or(0),
                "end" => end = value.parse().unwrap_or(0),
                "step" => step = value.parse().unwrap_or(60),
                _ => {}
            }
        }
        let body = if end - start > HISTORY_WINDOW_THRESHOLD {
            (self.history)(start, end, step)
        } else {
            (self.live)(start, end, step)
        };
        ResponseTemplate::new(200).set_body_json(body)
    }
}

/// A matrix body with a single series.
pub fn matrix(labels: Value, points: &[(i64, f64)]) -> Value {
    let values: Vec<Value> = points
        .iter()
        .map(|&(t, v)| json!([t, format!("{}", v)]))
        .collect();
    json!({
        "status": "success",
        "data": {
            "resultType": "matrix",
            "result": [{"metric": labels, "values": values}]
        }
    })
}

/// Sample `f` on the grid `[start, end]` with `step`.
pub fn sampled(labels: Value, start: i64, end: i64, step: i64, f: impl Fn(i64) -> f64) -> Value {
    let mut points = Vec::new();
    let mut t = start;
    while t <= end {
        points.push((t, f(t)));
        t += step.max(1);
    }
    matrix(labels, &points)
}

pub struct TestGateway {
    pub app: Router,
    pub upstream: MockServer,
    pub auth: String,
    pub cache: Arc<Cache>,
}

/// Bring up the gateway against a fresh wiremock upstream. The caller
/// mounts responders on `upstream` before issuing requests.
pub async fn gateway(config: Value) -> TestGateway {
    let upstream = MockServer::start().await;
    let config = Config::from_value(config);
    let cache = Arc::new(Cache::open(":memory:", 86_400).expect("open cache"));
    let state = AppState {
        config,
        cache: cache.clone(),
        http: reqwest::Client::new(),
    };
    let app = build_router(state)
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 55_555))));

    let credentials = format!("{}:test-token", upstream.address().port());
    let auth = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(credentials)
    );

    TestGateway {
        app,
        upstream,
        auth,
        cache,
    }
}

impl TestGateway {
    /// Mount a dual-window upstream on `/api/v1/query_range`.
    pub async fn mount_upstream(&self, upstream: DualWindowUpstream) {
        Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/api/v1/query_range"))
            .respond_with(upstream)
            .mount(&self.upstream)
            .await;
    }

    /// POST `/api/v1/query_range` and decode the JSON response body.
    pub async fn query_range(&self, query: &str, start: i64, end: i64, step: i64) -> Value {
        let form = format!(
            "query={}&start={}&end={}&step={}",
            urlencode(query),
            start,
            end,
            step
        );
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/query_range")
            .header("authorization", &self.auth)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(form))
            .unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| panic!("non-JSON response ({})", status));
        assert!(
            status.is_success(),
            "query_range returned {}: {}",
            status,
            body
        );
        body
    }
}

/// Form-encode the reserved characters that show up in override queries.
fn urlencode(raw: &str) -> String {
    raw.replace('%', "%25")
        .replace('#', "%23")
        .replace('=', "%3D")
        .replace('&', "%26")
        .replace('+', "%2B")
        .replace(' ', "+")
}

/// All result rows carrying the given `__name__`.
pub fn rows_named<'a>(body: &'a Value, name: &str) -> Vec<&'a Value> {
    body.pointer("/data/result")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter(|row| row["metric"]["__name__"] == name)
                .collect()
        })
        .unwrap_or_default()
}

/// Every emitted `__name__` in order.
pub fn row_names(body: &Value) -> Vec<String> {
    body.pointer("/data/result")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| row["metric"]["__name__"].as_str().unwrap_or("").to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// The numeric values of one row.
pub fn row_values(row: &Value) -> Vec<f64> {
    row["values"]
        .as_array()
        .map(|values| {
            values
                .iter()
                .filter_map(|pair| pair[1].as_str())
                .filter_map(|s| s.parse::<f64>().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// The single scalar of a one-point row.
pub fn scalar(row: &Value) -> f64 {
    let values = row_values(row);
    assert_eq!(values.len(), 1, "expected a scalar row: {}", row);
    values[0]
}

/// A test configuration with a small metric floor and fast autotune.
pub fn base_config() -> Value {
    json!({
        "corridor_params": {
            "min_data_points": 10,
            "history_step": 300,
            "historical_period_days": 7.0,
            "historical_offset_days": 0.0,
            "auto_tune": false
        },
        "timeout": {"max_metrics": 20, "request_seconds": 30},
        "cache": {"max_ttl": 86400}
    })
}
