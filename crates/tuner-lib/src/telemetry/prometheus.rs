//! Prometheus HTTP API backend

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{MetricsBackend, Sample, TelemetryError};
use crate::resilience::{CallError, CallGuard};

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<VectorResult>,
}

#[derive(Debug, Deserialize)]
struct VectorResult {
    #[serde(default)]
    metric: HashMap<String, String>,
    value: (f64, String),
}

/// Instant-query client for a Prometheus-compatible endpoint
pub struct PrometheusBackend {
    http_client: reqwest::Client,
    base_url: Url,
    guard: Arc<CallGuard>,
}

impl PrometheusBackend {
    pub fn new(base_url: &str, guard: Arc<CallGuard>) -> Result<Self, TelemetryError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http_client,
            base_url: Url::parse(base_url)?,
            guard,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn execute(&self, url: &Url, promql: &str) -> Result<Vec<Sample>, TelemetryError> {
        let response = self
            .http_client
            .get(url.clone())
            .query(&[("query", promql)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TelemetryError::Status { status, body });
        }

        let body: QueryResponse = response.json().await?;
        parse_response(promql, body)
    }
}

fn parse_response(promql: &str, body: QueryResponse) -> Result<Vec<Sample>, TelemetryError> {
    if body.status != "success" {
        return Err(TelemetryError::Query {
            query: promql.to_string(),
            reason: body.error.unwrap_or_else(|| body.status.clone()),
        });
    }

    let data = body.data.ok_or_else(|| TelemetryError::Query {
        query: promql.to_string(),
        reason: "response has no data".to_string(),
    })?;

    if data.result_type != "vector" {
        return Err(TelemetryError::Query {
            query: promql.to_string(),
            reason: format!("expected vector result, got {}", data.result_type),
        });
    }

    data.result
        .into_iter()
        .map(|r| {
            let value: f64 = r.value.1.parse().map_err(|_| TelemetryError::Query {
                query: promql.to_string(),
                reason: format!("unparseable sample value '{}'", r.value.1),
            })?;
            Ok(Sample {
                labels: r.metric,
                value,
            })
        })
        .filter(|s: &Result<Sample, TelemetryError>| {
            s.as_ref().map(|s| s.value.is_finite()).unwrap_or(true)
        })
        .collect()
}

#[async_trait]
impl MetricsBackend for PrometheusBackend {
    async fn query(&self, promql: &str) -> Result<Vec<Sample>, TelemetryError> {
        let url = self.base_url.join("api/v1/query")?;
        let url = &url;
        debug!(query = %promql, "Querying metrics backend");

        self.guard
            .call(move || self.execute(url, promql))
            .await
            .map_err(|e| match e {
                CallError::CircuitOpen(name) => {
                    TelemetryError::CircuitOpen(format!("circuit '{}' is open", name))
                }
                CallError::Failed(inner) => inner,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Vec<Sample>, TelemetryError> {
        parse_response("up", serde_json::from_str(json).unwrap())
    }

    #[test]
    fn test_parse_vector_response() {
        let samples = parse(
            r#"{"status":"success","data":{"resultType":"vector","result":[
                {"metric":{"pod":"web-1"},"value":[1700000000.0,"0.25"]},
                {"metric":{"pod":"web-2"},"value":[1700000000.0,"0.75"]}
            ]}}"#,
        )
        .unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].label("pod"), Some("web-1"));
        assert_eq!(samples[1].value, 0.75);
    }

    #[test]
    fn test_parse_error_status() {
        let err = parse(r#"{"status":"error","error":"parse error at char 3"}"#).unwrap_err();
        assert!(err.to_string().contains("parse error"));
    }

    #[test]
    fn test_parse_drops_nan_samples() {
        let samples = parse(
            r#"{"status":"success","data":{"resultType":"vector","result":[
                {"metric":{},"value":[1700000000.0,"NaN"]},
                {"metric":{},"value":[1700000000.0,"3"]}
            ]}}"#,
        )
        .unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 3.0);
    }

    #[test]
    fn test_rejects_bad_url() {
        let guard = Arc::new(CallGuard::new("metrics_backend", &Default::default()));
        assert!(PrometheusBackend::new("not a url", guard).is_err());
    }
}
