use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::series::RawPoint;

/// Client for one upstream Grafana-fronted backend, speaking the
/// Prometheus HTTP API. Cheap to construct per request: the underlying
/// reqwest pool is shared application-wide.
#[derive(Debug, Clone)]
pub struct GrafanaClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

/// One upstream datasource as enumerated from `/api/datasources`.
#[derive(Debug, Clone, Deserialize)]
pub struct Datasource {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub ds_type: String,
}

impl GrafanaClient {
    pub fn new(http: reqwest::Client, base_url: String, token: String) -> Self {
        GrafanaClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    /// Fetch a `query_range` matrix and flatten it into raw points.
    pub async fn fetch_range(
        &self,
        query: &str,
        start: i64,
        end: i64,
        step: i64,
        deadline: Duration,
    ) -> Result<Vec<RawPoint>> {
        let response = self
            .get("/api/v1/query_range")
            .query(&[
                ("query", query.to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("step", step.to_string()),
            ])
            .timeout(deadline)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Upstream(format!(
                "query_range returned {} from {}",
                status, self.base_url
            )));
        }
        let body: Value = response.json().await?;
        parse_matrix(&body)
    }

    /// Enumerate metric names visible through one datasource.
    pub async fn label_values(&self, datasource_uid: &str) -> Result<Vec<String>> {
        let path = format!(
            "/api/datasources/proxy/uid/{}/api/v1/label/__name__/values",
            datasource_uid
        );
        let response = self.get(&path).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::Upstream(format!(
                "label values returned {}",
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        let values = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::Upstream("label values without data array".into()))?;
        Ok(values
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    /// List datasources for catalog enumeration.
    pub async fn datasources(&self) -> Result<Vec<Datasource>> {
        let response = self.get("/api/datasources").send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::Upstream(format!(
                "datasources returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Transparent passthrough for `/api/ds/query`.
    pub async fn proxy_ds_query(
        &self,
        content_type: &str,
        body: Bytes,
    ) -> Result<(u16, Bytes)> {
        let response = self
            .http
            .post(format!("{}/api/ds/query", self.base_url))
            .bearer_auth(&self.token)
            .header("content-type", content_type)
            .body(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        Ok((status, bytes))
    }
}

/// Flatten a Prometheus `matrix` response into raw points carrying their
/// label sets. Tolerates numeric timestamps with fractional seconds and
/// skips values that do not parse as finite floats.
pub fn parse_matrix(body: &Value) -> Result<Vec<RawPoint>> {
    if body.get("status").and_then(Value::as_str) != Some("success") {
        return Err(GatewayError::Upstream(format!(
            "upstream status {:?}",
            body.get("status")
        )));
    }
    let result = body
        .pointer("/data/result")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Upstream("matrix response without data.result".into()))?;

    let mut out = Vec::new();
    for entry in result {
        let labels = entry.get("metric").cloned().unwrap_or(Value::Object(Default::default()));
        let Some(values) = entry.get("values").and_then(Value::as_array) else {
            continue;
        };
        for pair in values {
            let Some(pair) = pair.as_array() else { continue };
            if pair.len() != 2 {
                continue;
            }
            let Some(time) = pair[0].as_f64().map(|t| t as i64).or_else(|| pair[0].as_i64()) else {
                continue;
            };
            let value = match &pair[1] {
                Value::String(s) => s.parse::<f64>().ok(),
                Value::Number(n) => n.as_f64(),
                _ => None,
            };
            let Some(value) = value else { continue };
            if !value.is_finite() {
                continue;
            }
            out.push(RawPoint {
                time,
                value,
                labels: labels.clone(),
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn matrix_parsing_flattens_series() {
        let body = json!({
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [
                    {
                        "metric": {"__name__": "cpu", "job": "api"},
                        "values": [[1700000000, "1.5"], [1700000060, "2.5"]]
                    },
                    {
                        "metric": {"__name__": "cpu", "job": "db"},
                        "values": [[1700000000, "9"]]
                    }
                ]
            }
        });
        let points = parse_matrix(&body).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].time, 1_700_000_000);
        assert_eq!(points[0].value, 1.5);
        assert_eq!(points[2].labels["job"], "db");
    }

    #[test]
    fn matrix_parsing_skips_unparseable_values() {
        let body = json!({
            "status": "success",
            "data": {"result": [
                {"metric": {}, "values": [[1700000000, "NaN"], [1700000060, "4"]]}
            ]}
        });
        let points = parse_matrix(&body).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 4.0);
    }

    #[test]
    fn matrix_parsing_accepts_fractional_timestamps() {
        let body = json!({
            "status": "success",
            "data": {"result": [
                {"metric": {}, "values": [[1700000000.5, "1"]]}
            ]}
        });
        let points = parse_matrix(&body).unwrap();
        assert_eq!(points[0].time, 1_700_000_000);
    }

    #[test]
    fn error_status_is_an_upstream_error() {
        let body = json!({"status": "error", "error": "boom"});
        assert!(parse_matrix(&body).is_err());
    }
}
