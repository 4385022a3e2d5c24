use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Gateway error taxonomy.
///
/// Validation and authentication errors abort the request; upstream and
/// cache errors are recovered locally (a failed series is omitted, a failed
/// cache read is treated as a miss). Numeric degeneracies never surface as
/// errors at all — the numerical modules resolve them with documented
/// fallbacks and log at info.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing query, malformed overrides, non-positive step.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Missing or malformed credentials.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// Fetch failed, non-2xx from upstream, or unparseable upstream body.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Persistent-store I/O failure that survived the single re-open retry.
    #[error("cache error: {0}")]
    Cache(String),

    /// Per-request metric cap or fetch-time budget hit.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// Catch-all infrastructure failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Cache(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::BudgetExceeded(_) => StatusCode::OK,
        }
    }

    /// Prometheus-style `errorType` discriminator.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "bad_data",
            GatewayError::Auth(_) => "unauthorized",
            GatewayError::Upstream(_) => "upstream",
            GatewayError::Cache(_) => "cache",
            GatewayError::BudgetExceeded(_) => "budget",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Cache(e.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Upstream(e.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "status": "error",
            "errorType": self.error_type(),
            "error": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
