//! Tuner configuration
//!
//! An optional config file is layered under `TUNER__*` environment
//! variables, e.g. `TUNER__CHECK_INTERVAL_SECS=30` or
//! `TUNER__ENGINE__MIN_CONFIDENCE=0.7`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tuner_lib::{
    decision::EngineConfig,
    models::WatchedDeployment,
    prescale::PreScaleConfig,
    priority::PriorityManagerConfig,
    resilience::ResilienceConfig,
    telemetry::AnalyzerConfig,
    LoopConfig,
};

#[derive(Debug, Clone, Deserialize)]
pub struct TunerConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    #[serde(default = "default_inter_deployment_delay")]
    pub inter_deployment_delay_ms: u64,

    #[serde(default = "default_rollback_check_interval")]
    pub rollback_check_interval_secs: u64,

    /// Port for health, metrics and snapshot endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_prometheus_url")]
    pub prometheus_url: String,

    /// Pre-scaling runs only when a forecaster is configured
    #[serde(default)]
    pub forecaster_url: Option<String>,

    #[serde(default = "default_startup_window")]
    pub startup_window_minutes: i64,

    #[serde(default = "default_base_target")]
    pub base_target: i32,

    #[serde(default)]
    pub deployments: Vec<WatchedDeployment>,

    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub prescale: PreScaleConfig,

    #[serde(default)]
    pub priority: PriorityManagerConfig,

    #[serde(default)]
    pub resilience: ResilienceConfig,
}

fn default_check_interval() -> u64 {
    60
}

fn default_inter_deployment_delay() -> u64 {
    500
}

fn default_rollback_check_interval() -> u64 {
    60
}

fn default_api_port() -> u16 {
    8080
}

fn default_prometheus_url() -> String {
    "http://prometheus-server.monitoring:9090".to_string()
}

fn default_startup_window() -> i64 {
    2
}

fn default_base_target() -> i32 {
    70
}

impl TunerConfig {
    /// Load from an optional file plus `TUNER__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(env)
            .build()
            .context("reading configuration sources")?
            .try_deserialize()
            .context("decoding configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.check_interval_secs == 0 {
            bail!("check_interval_secs must be positive");
        }
        if self.rollback_check_interval_secs == 0 {
            bail!("rollback_check_interval_secs must be positive");
        }
        if !(1..=100).contains(&self.base_target) {
            bail!("base_target must be within 1..=100, got {}", self.base_target);
        }

        let mut seen = std::collections::HashSet::new();
        for deployment in &self.deployments {
            let key = deployment.workload().key();
            if !seen.insert(key.clone()) {
                bail!("deployment {} is listed twice", key);
            }
        }
        Ok(())
    }

    pub fn prescale_enabled(&self) -> bool {
        self.prescale.enabled && self.forecaster_url.is_some()
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            check_interval: Duration::from_secs(self.check_interval_secs),
            inter_deployment_delay: Duration::from_millis(self.inter_deployment_delay_ms),
            startup_window_minutes: self.startup_window_minutes,
            base_target: self.base_target,
        }
    }

    /// Analyzer settings with the top-level startup window applied
    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            startup_window_minutes: self.startup_window_minutes,
            ..self.analyzer.clone()
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("TUNER")
        .separator("__")
        .try_parsing(true)
}
