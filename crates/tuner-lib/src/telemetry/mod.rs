//! Cluster telemetry for control decisions
//!
//! This module provides:
//! - [`Telemetry`], the read result every decision-facing query returns
//! - the [`MetricsBackend`] trait and its Prometheus implementation
//! - [`NodeCapacityAnalyzer`], which turns node and pod telemetry into one
//!   [`NodeMetrics`] reading per deployment

mod node_capacity;
mod prometheus;

pub use node_capacity::{
    classify_pressure, AnalyzerConfig, NodeCapacityAnalyzer, NodeMetrics, PodCpuUsage,
    PressureLevel, UtilizationSource, WorkloadUtilization,
};
pub use prometheus::PrometheusBackend;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Errors from telemetry queries
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid backend URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("query '{query}' failed: {reason}")]
    Query { query: String, reason: String },
    #[error("query '{0}' returned no samples")]
    Empty(String),
    #[error("{0}")]
    CircuitOpen(String),
    #[error("cluster read failed: {0}")]
    Cluster(String),
}

/// Result of a telemetry read
///
/// A failed read is not an error to the caller: it yields a `Degraded`
/// value carrying a safe fallback and the reason. Callers must branch on
/// the variant; a degraded zero means "no signal", not "idle".
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry<T> {
    Live(T),
    Degraded { fallback: T, reason: String },
}

impl<T> Telemetry<T> {
    pub fn degraded(fallback: T, reason: impl Into<String>) -> Self {
        Telemetry::Degraded {
            fallback,
            reason: reason.into(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Telemetry::Live(_))
    }

    /// The live value, if any
    pub fn live(&self) -> Option<&T> {
        match self {
            Telemetry::Live(value) => Some(value),
            Telemetry::Degraded { .. } => None,
        }
    }

    /// The live value or the fallback
    pub fn value(&self) -> &T {
        match self {
            Telemetry::Live(value) => value,
            Telemetry::Degraded { fallback, .. } => fallback,
        }
    }

    pub fn degraded_reason(&self) -> Option<&str> {
        match self {
            Telemetry::Live(_) => None,
            Telemetry::Degraded { reason, .. } => Some(reason),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Telemetry<U> {
        match self {
            Telemetry::Live(value) => Telemetry::Live(f(value)),
            Telemetry::Degraded { fallback, reason } => Telemetry::Degraded {
                fallback: f(fallback),
                reason,
            },
        }
    }
}

/// One instant-vector sample
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: HashMap<String, String>,
    pub value: f64,
}

impl Sample {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

/// Source of PromQL-style instant queries
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn query(&self, promql: &str) -> Result<Vec<Sample>, TelemetryError>;

    /// Sum of all samples, failing on an empty result
    async fn query_scalar(&self, promql: &str) -> Result<f64, TelemetryError> {
        let samples = self.query(promql).await?;
        if samples.is_empty() {
            return Err(TelemetryError::Empty(promql.to_string()));
        }
        Ok(samples.iter().map(|s| s.value).sum())
    }
}
