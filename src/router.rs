use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::cache::{Cache, Instance};
use crate::config::{self, Config, TimeoutParams};
use crate::error::{GatewayError, Result};
use crate::format;
use crate::grafana::GrafanaClient;
use crate::metrics;
use crate::pipeline::{Pipeline, RangeQuery};

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub cache: Arc<Cache>,
    pub http: reqwest::Client,
}

/// An authenticated request context: the tenant record plus a client
/// bound to its upstream.
#[derive(Debug)]
pub struct Tenant {
    pub instance: Instance,
    pub client: GrafanaClient,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/labels", get(labels_handler).post(labels_handler))
        .route("/api/v1/label/{name}/values", get(label_values_handler))
        .route("/api/v1/metadata", get(metadata_handler))
        .route("/api/v1/query", post(instant_query_handler))
        .route("/api/v1/query_range", post(query_range_handler))
        .route("/api/v1/status/buildinfo", get(buildinfo_handler))
        .route("/api/ds/query", post(ds_query_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/health", get(health_handler))
        .fallback(not_found_handler)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve the tenant from HTTP Basic credentials: `user` is the upstream
/// port, `pass` the upstream API token, and the client IP plus port form
/// the upstream URL. An `X-Datasource-UID` header appends to the tenant's
/// datasource blacklist (idempotently).
fn authenticate(state: &AppState, headers: &HeaderMap, addr: &SocketAddr) -> Result<Tenant> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::Auth("missing authorization header".into()))?;
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(|| GatewayError::Auth("expected basic authorization".into()))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| GatewayError::Auth("malformed basic credentials".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| GatewayError::Auth("malformed basic credentials".into()))?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or_else(|| GatewayError::Auth("malformed basic credentials".into()))?;
    let port: u16 = user
        .parse()
        .map_err(|_| GatewayError::Auth("user must be an upstream port".into()))?;

    let base_url = format!("http://{}:{}", addr.ip(), port);
    let instance = state.cache.upsert_instance(&base_url, pass)?;
    if let Some(uid) = headers.get("x-datasource-uid").and_then(|v| v.to_str().ok()) {
        state.cache.add_blacklist_uid(instance.id, uid)?;
    }

    let client = GrafanaClient::new(state.http.clone(), base_url, pass.to_string());
    Ok(Tenant { instance, client })
}

#[derive(Debug, Deserialize, Default)]
pub struct RangeForm {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
    #[serde(default)]
    step: Option<String>,
}

fn parse_time(raw: Option<&String>, field: &str) -> Result<i64> {
    raw.and_then(|s| s.parse::<f64>().ok())
        .map(|t| t as i64)
        .ok_or_else(|| GatewayError::Validation(format!("missing or malformed {}", field)))
}

async fn query_range_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(form): Form<RangeForm>,
) -> Result<Json<Value>> {
    metrics::record_request("query_range");
    let started = std::time::Instant::now();

    let tenant = authenticate(&state, &headers, &addr)?;

    let raw_query = form
        .query
        .as_deref()
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| GatewayError::Validation("missing query".into()))?;
    let (query, overrides) = config::split_query_overrides(raw_query);
    if query.is_empty() {
        return Err(GatewayError::Validation("missing query".into()));
    }
    let cfg = match overrides {
        Some(overrides) => {
            let cfg = state.config.with_overrides(overrides)?;
            if let Err(e) = state.cache.save_query_params(
                query,
                overrides,
                &cfg.config_hash(),
                chrono::Utc::now().timestamp(),
            ) {
                warn!(error = %e, "failed to record query overrides");
            }
            cfg
        }
        None => state.config.clone(),
    };

    let start = parse_time(form.start.as_ref(), "start")?;
    let end = parse_time(form.end.as_ref(), "end")?;
    let step = parse_time(form.step.as_ref(), "step")?;
    if step <= 0 {
        return Err(GatewayError::Validation("step must be positive".into()));
    }
    if end < start {
        return Err(GatewayError::Validation("end precedes start".into()));
    }

    let now = chrono::Utc::now().timestamp();
    if end == start {
        return Ok(Json(format::nodata_matrix(query, now)));
    }

    let req = RangeQuery {
        query: query.to_string(),
        start,
        end,
        step,
    };
    let timeout_params = TimeoutParams::from_config(&cfg);
    let pipeline = Pipeline::new(state.cache.clone());
    let rows = tokio::time::timeout(
        Duration::from_secs(timeout_params.request_seconds.max(1)),
        pipeline.run(&tenant.client, &cfg, &req, now),
    )
    .await
    .map_err(|_| GatewayError::Upstream("request deadline exceeded".into()))??;

    let body = format::format_matrix(&rows, &req, &cfg, chrono::Utc::now().timestamp());
    metrics::record_request_duration(started.elapsed().as_secs_f64());
    info!(
        query = %req.query,
        series = rows.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "query_range served"
    );
    Ok(Json(body))
}

/// Catalog reads degrade to an empty listing on store failures instead of
/// failing the request.
fn catalog_or_empty(state: &AppState, instance_id: i64) -> Vec<String> {
    match state.cache.catalog_keys(instance_id) {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "catalog read failed, serving empty listing");
            Vec::new()
        }
    }
}

async fn labels_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    metrics::record_request("labels");
    let tenant = authenticate(&state, &headers, &addr)?;
    let keys = catalog_or_empty(&state, tenant.instance.id);
    Ok(Json(json!({"status": "success", "data": keys})))
}

async fn label_values_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    axum::extract::Path(name): axum::extract::Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    metrics::record_request("label_values");
    let tenant = authenticate(&state, &headers, &addr)?;
    if name != "__name__" {
        return Ok(Json(json!({"status": "success", "data": []})));
    }
    let keys = catalog_or_empty(&state, tenant.instance.id);
    Ok(Json(json!({"status": "success", "data": keys})))
}

async fn metadata_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    metrics::record_request("metadata");
    let tenant = authenticate(&state, &headers, &addr)?;
    let keys = catalog_or_empty(&state, tenant.instance.id);
    let mut data = serde_json::Map::new();
    for key in keys {
        data.insert(
            key.clone(),
            json!([{"type": "gauge", "help": format!("corridor analysis for {}", key), "unit": ""}]),
        );
    }
    Ok(Json(json!({"status": "success", "data": data})))
}

/// Instant queries are not supported: an empty vector keeps Prometheus
/// clients happy without running the pipeline.
async fn instant_query_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    metrics::record_request("query");
    authenticate(&state, &headers, &addr)?;
    Ok(Json(json!({
        "status": "success",
        "data": {"resultType": "vector", "result": []}
    })))
}

async fn buildinfo_handler() -> Json<Value> {
    metrics::record_request("buildinfo");
    Json(json!({
        "status": "success",
        "data": {
            "version": env!("CARGO_PKG_VERSION"),
            "revision": env!("GIT_BRANCH"),
            "buildUser": "",
            "buildDate": "",
            "goVersion": ""
        }
    }))
}

async fn ds_query_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    metrics::record_request("ds_query");
    let tenant = authenticate(&state, &headers, &addr)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    let (status, bytes) = tenant.client.proxy_ds_query(content_type, body).await?;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, [(header::CONTENT_TYPE, "application/json")], bytes).into_response())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn not_found_handler() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "status": "error",
            "errorType": "not_found",
            "error": "unknown route"
        })),
    )
        .into_response()
}

/// Periodic catalog refresher: enumerates every tenant's datasources
/// (minus the blacklist) and swaps the per-tenant catalog atomically.
pub async fn refresh_catalogs(cache: &Cache, http: &reqwest::Client) {
    let instances = match cache.instances() {
        Ok(instances) => instances,
        Err(e) => {
            warn!(error = %e, "cannot list tenants for catalog refresh");
            return;
        }
    };
    for instance in instances {
        let client = GrafanaClient::new(http.clone(), instance.url.clone(), instance.token.clone());
        let datasources = match client.datasources().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, url = %instance.url, "datasource enumeration failed");
                metrics::record_upstream_failure("catalog");
                continue;
            }
        };
        let mut entries: Vec<(String, String)> = Vec::new();
        for ds in datasources {
            if instance.blacklist_uids.iter().any(|uid| uid == &ds.uid) {
                continue;
            }
            match client.label_values(&ds.uid).await {
                Ok(names) => {
                    for name in names {
                        entries.push((
                            name,
                            json!({"datasource_uid": ds.uid, "datasource_type": ds.ds_type})
                                .to_string(),
                        ));
                    }
                }
                Err(e) => {
                    warn!(error = %e, uid = %ds.uid, "label enumeration failed");
                    metrics::record_upstream_failure("catalog");
                }
            }
        }
        entries.sort();
        entries.dedup_by(|a, b| a.0 == b.0);
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = cache.replace_catalog(instance.id, &entries, now) {
            warn!(error = %e, "catalog write failed");
        } else {
            info!(url = %instance.url, metrics = entries.len(), "catalog refreshed");
        }
    }
}
