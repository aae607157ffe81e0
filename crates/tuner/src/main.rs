//! HPA Tuner - closed-loop HPA target controller
//!
//! This binary runs as a single-replica Deployment, retuning the CPU target
//! and behavior of each watched HPA from node pressure, and raising replica
//! floors ahead of forecast load spikes.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tuner_lib::{
    cluster::{ClusterApi, KubeClusterApi},
    health::{components, HealthRegistry},
    prescale::{spawn_rollback_worker, HttpForecaster},
    resilience::CallGuard,
    telemetry::{NodeCapacityAnalyzer, PrometheusBackend},
    ControlLoop, HpaDecisionEngine, PreScaleManager, PriorityManager, StructuredLogger,
};

mod api;
mod config;

const TUNER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Parser)]
#[command(name = "hpa-tuner", version, about = "Closed-loop HPA target controller")]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "TUNER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "json", env = "TUNER_LOG_FORMAT")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (json, text) = match format {
        LogFormat::Json => (Some(fmt::layer().json()), None),
        LogFormat::Text => (None, Some(fmt::layer())),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting hpa-tuner");

    let config = config::TunerConfig::load(args.config.as_deref())
        .context("loading tuner configuration")?;
    let prescale_enabled = config.prescale_enabled();
    info!(
        deployments = config.deployments.len(),
        prometheus_url = %config.prometheus_url,
        prescale = prescale_enabled,
        "Tuner configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::METRICS_BACKEND).await;
    health_registry.register(components::CLUSTER_API).await;
    health_registry.register(components::CONTROL_LOOP).await;
    if prescale_enabled {
        health_registry.register(components::FORECASTER).await;
    }

    let metrics_guard = Arc::new(CallGuard::new(
        components::METRICS_BACKEND,
        &config.resilience.metrics_backend,
    ));
    let cluster_guard = Arc::new(CallGuard::new(
        components::CLUSTER_API,
        &config.resilience.cluster_api,
    ));
    let forecaster_guard = Arc::new(CallGuard::new(
        components::FORECASTER,
        &config.resilience.forecaster,
    ));

    let cluster: Arc<dyn ClusterApi> = Arc::new(
        KubeClusterApi::try_default(cluster_guard.clone())
            .await
            .context("connecting to the Kubernetes API")?,
    );
    let backend = Arc::new(
        PrometheusBackend::new(&config.prometheus_url, metrics_guard.clone())
            .context("building the metrics backend client")?,
    );
    let analyzer = Arc::new(NodeCapacityAnalyzer::new(
        backend,
        cluster.clone(),
        config.analyzer_config(),
    ));
    let engine = Arc::new(HpaDecisionEngine::new(cluster.clone(), config.engine.clone()));

    let priorities = Arc::new(PriorityManager::new(config.priority.clone()));
    for deployment in &config.deployments {
        priorities.set_priority(deployment.workload().key(), deployment.priority);
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut guards = vec![metrics_guard, cluster_guard];

    let mut rollback_handle = None;
    let prescale = match config.forecaster_url.as_deref() {
        Some(url) if prescale_enabled => {
            let forecaster = Arc::new(
                HttpForecaster::new(url, forecaster_guard.clone())
                    .context("building the forecaster client")?,
            );
            let manager = Arc::new(PreScaleManager::new(
                cluster.clone(),
                forecaster,
                analyzer.clone(),
                config.prescale.clone(),
            ));
            for deployment in &config.deployments {
                let workload = deployment.workload();
                if let Err(e) = manager.register_deployment(&workload).await {
                    warn!(
                        deployment = %workload.key(),
                        error = %e,
                        "Pre-scale registration failed, retrying each tick"
                    );
                }
            }
            rollback_handle = Some(spawn_rollback_worker(
                manager.clone(),
                Duration::from_secs(config.rollback_check_interval_secs),
                shutdown_tx.subscribe(),
            ));
            guards.push(forecaster_guard);
            Some(manager)
        }
        _ => None,
    };

    let logger = StructuredLogger::new("hpa_tuner");
    logger.log_startup(TUNER_VERSION, config.deployments.len(), prescale.is_some());

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        engine.clone(),
        prescale.clone(),
    ));

    let control_loop = ControlLoop::new(
        config.deployments.clone(),
        cluster,
        analyzer,
        engine,
        priorities,
        prescale,
        health_registry.clone(),
        config.loop_config(),
    )
    .with_guards(guards);

    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));
    let loop_handle = tokio::spawn(control_loop.run(shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    info!("Shutting down");

    health_registry.set_ready(false).await;
    // Receivers may already be gone if a task exited early
    let _ = shutdown_tx.send(());

    if let Err(e) = loop_handle.await {
        warn!(error = %e, "Control loop task ended abnormally");
    }
    if let Some(handle) = rollback_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Rollback worker ended abnormally");
        }
    }
    api_handle.abort();

    Ok(())
}
