//! HTTP API for health checks, Prometheus metrics and read-only snapshots

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use tuner_lib::{
    health::{ComponentStatus, HealthRegistry},
    HpaDecision, HpaDecisionEngine, PreScaleManager, PreScaleStats,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub engine: Arc<HpaDecisionEngine>,
    pub prescale: Option<Arc<PreScaleManager>>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        engine: Arc<HpaDecisionEngine>,
        prescale: Option<Arc<PreScaleManager>>,
    ) -> Self {
        Self {
            health_registry,
            engine,
            prescale,
        }
    }
}

/// 200 while operational (degraded included), 503 when unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct DecisionEntry {
    deployment: String,
    #[serde(flatten)]
    decision: HpaDecision,
}

/// Last HPA decision per deployment
async fn decisions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let entries: Vec<DecisionEntry> = state
        .engine
        .decisions()
        .into_iter()
        .map(|(deployment, decision)| DecisionEntry {
            deployment,
            decision,
        })
        .collect();
    Json(entries)
}

#[derive(Debug, Serialize)]
struct PreScaleView {
    enabled: bool,
    #[serde(flatten)]
    stats: PreScaleStats,
}

async fn prescale(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let view = match &state.prescale {
        Some(manager) => PreScaleView {
            enabled: manager.config().enabled,
            stats: manager.stats().await,
        },
        None => PreScaleView {
            enabled: false,
            stats: PreScaleStats::default(),
        },
    };
    Json(view)
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/decisions", get(decisions))
        .route("/v1/prescale", get(prescale))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
