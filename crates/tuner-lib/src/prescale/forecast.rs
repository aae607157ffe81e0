//! Load forecaster client
//!
//! The forecaster is an external service; the tuner only needs a point
//! prediction with a confidence for a handful of forward windows, and a way
//! to report the observed value back once it is known.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::resilience::{CallError, CallGuard};

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid forecaster URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("forecaster returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("{0}")]
    CircuitOpen(String),
}

impl From<CallError<ForecastError>> for ForecastError {
    fn from(e: CallError<ForecastError>) -> Self {
        match e {
            CallError::CircuitOpen(name) => {
                ForecastError::CircuitOpen(format!("circuit '{}' is open", name))
            }
            CallError::Failed(inner) => inner,
        }
    }
}

/// Forward-looking prediction windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForecastWindow {
    #[serde(rename = "15min")]
    Minutes15,
    #[serde(rename = "30min")]
    Minutes30,
    #[serde(rename = "1hr")]
    Hour1,
    #[serde(rename = "2hr")]
    Hours2,
    #[serde(rename = "4hr")]
    Hours4,
}

impl ForecastWindow {
    pub const ALL: [ForecastWindow; 5] = [
        ForecastWindow::Minutes15,
        ForecastWindow::Minutes30,
        ForecastWindow::Hour1,
        ForecastWindow::Hours2,
        ForecastWindow::Hours4,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastWindow::Minutes15 => "15min",
            ForecastWindow::Minutes30 => "30min",
            ForecastWindow::Hour1 => "1hr",
            ForecastWindow::Hours2 => "2hr",
            ForecastWindow::Hours4 => "4hr",
        }
    }
}

impl std::fmt::Display for ForecastWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicted CPU utilization percent for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_value: f64,
    pub confidence: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub model_used: String,
}

#[async_trait]
pub trait Forecaster: Send + Sync {
    /// Prediction for `deployment` (a `namespace/name` key); `None` when the
    /// forecaster has no model for it yet
    async fn predict(
        &self,
        deployment: &str,
        window: ForecastWindow,
    ) -> Result<Option<Prediction>, ForecastError>;

    /// Report the value observed for an earlier prediction
    async fn validate_prediction(
        &self,
        deployment: &str,
        predicted: f64,
        actual: f64,
        model: &str,
    ) -> Result<(), ForecastError>;
}

#[derive(Debug, Serialize)]
struct ValidationRequest<'a> {
    deployment: &'a str,
    predicted: f64,
    actual: f64,
    model: &'a str,
}

/// Forecaster reached over HTTP/JSON
pub struct HttpForecaster {
    http_client: reqwest::Client,
    base_url: Url,
    guard: Arc<CallGuard>,
}

impl HttpForecaster {
    pub fn new(base_url: &str, guard: Arc<CallGuard>) -> Result<Self, ForecastError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http_client,
            base_url: Url::parse(base_url)?,
            guard,
        })
    }

    async fn fetch(
        &self,
        url: &Url,
        deployment: &str,
        window: ForecastWindow,
    ) -> Result<Option<Prediction>, ForecastError> {
        let response = self
            .http_client
            .get(url.clone())
            .query(&[("deployment", deployment), ("window", window.as_str())])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ForecastError::Status { status, body });
        }

        Ok(Some(response.json().await?))
    }

    async fn post_validation(
        &self,
        url: &Url,
        request: &ValidationRequest<'_>,
    ) -> Result<(), ForecastError> {
        let response = self.http_client.post(url.clone()).json(request).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ForecastError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl Forecaster for HttpForecaster {
    async fn predict(
        &self,
        deployment: &str,
        window: ForecastWindow,
    ) -> Result<Option<Prediction>, ForecastError> {
        let url = self.base_url.join("v1/predict")?;
        let url = &url;
        debug!(deployment, window = %window, "Requesting forecast");

        Ok(self
            .guard
            .call(move || self.fetch(url, deployment, window))
            .await?)
    }

    async fn validate_prediction(
        &self,
        deployment: &str,
        predicted: f64,
        actual: f64,
        model: &str,
    ) -> Result<(), ForecastError> {
        let url = self.base_url.join("v1/validate")?;
        let url = &url;
        let request = ValidationRequest {
            deployment,
            predicted,
            actual,
            model,
        };
        let request = &request;

        Ok(self
            .guard
            .mutate(move || self.post_validation(url, request))
            .await?)
    }
}
